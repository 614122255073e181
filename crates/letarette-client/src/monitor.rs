//! Status monitor for clients: follows the status broadcasts of the
//! workers in the cluster.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use letarette_bus::Bus;
use letarette_core::protocol::IndexStatus;
use letarette_core::Result;

/// Delivers every worker status broadcast to a listener.
pub struct Monitor {
    task: JoinHandle<()>,
}

impl Monitor {
    pub async fn start<F>(bus: Arc<dyn Bus>, topic: &str, listener: F) -> Result<Self>
    where
        F: Fn(IndexStatus) + Send + Sync + 'static,
    {
        let subject = format!("{}.status", topic);
        let mut statuses = bus.subscribe(&subject).await?;
        let task = tokio::spawn(async move {
            while let Some(msg) = statuses.next_message().await {
                match msg.decode::<IndexStatus>() {
                    Ok(status) => {
                        debug!("Status: {}", status);
                        listener(status);
                    }
                    Err(e) => warn!("Bad status message: {}", e),
                }
            }
        });
        Ok(Self { task })
    }

    pub fn close(self) {}
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use letarette_bus::{BusExt, MemoryBus};
    use letarette_core::protocol::{epoch, IndexStatusCode};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_listener_gets_statuses() {
        let bus = Arc::new(MemoryBus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::start(bus.clone(), "leta", move |status| {
            let _ = tx.send(status);
        })
        .await
        .unwrap();

        let status = IndexStatus {
            index_id: "A1".into(),
            version: "0.5.0".into(),
            doc_count: 12,
            last_update: epoch(),
            shardgroup_size: 3,
            shardgroup: 1,
            status: IndexStatusCode::InSync,
        };
        bus.publish_json("leta.status", &status).await.unwrap();
        bus.publish("leta.status", b"garbage".to_vec()).await.unwrap();
        bus.publish_json("leta.status", &status).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, status);
        assert!(rx.recv().await.is_some());
        monitor.close();
    }
}
