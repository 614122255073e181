//! In-process bus with exact subject matching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{Bus, Message, Subscription};
use letarette_core::{Error, Result};

const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

struct Subscriber {
    subject: String,
    group: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Cheaply cloneable; all clones share the same subscribers.
#[derive(Clone)]
pub struct MemoryBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    inbox_counter: Arc<AtomicU64>,
    max_payload: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            inbox_counter: Arc::new(AtomicU64::new(0)),
            max_payload,
        }
    }

    fn add_subscriber(&self, subject: &str, group: Option<&str>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            subject: subject.to_string(),
            group: group.map(str::to_string),
            tx,
        });
        Subscription::new(UnboundedReceiverStream::new(rx))
    }

    /// Deliver to every plain subscriber and one member of each queue
    /// group. Returns the number of receivers.
    fn deliver(&self, msg: Message) -> Result<usize> {
        if msg.payload.len() > self.max_payload {
            return Err(Error::MaxPayload(msg.payload.len()));
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut targets: Vec<&Subscriber> = Vec::new();
        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for sub in subscribers.iter().filter(|s| s.subject == msg.subject) {
            match &sub.group {
                Some(group) => groups.entry(group.as_str()).or_default().push(sub),
                None => targets.push(sub),
            }
        }
        let mut rng = rand::thread_rng();
        for members in groups.values() {
            targets.push(members[rng.gen_range(0..members.len())]);
        }

        let delivered = targets.len();
        for sub in targets {
            // A receiver dropped since the retain above is pruned next time.
            let _ = sub.tx.send(msg.clone());
        }
        Ok(delivered)
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.subject == subject && !s.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: None,
            payload,
        })?;
        Ok(())
    }

    async fn publish_request(&self, subject: &str, reply: &str, payload: Vec<u8>) -> Result<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })?;
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Message> {
        let inbox = self.new_inbox();
        let mut replies = self.add_subscriber(&inbox, None).take(1);
        let delivered = self.deliver(Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            payload,
        })?;
        if delivered == 0 {
            return Err(Error::NoResponders(subject.to_string()));
        }
        match tokio::time::timeout(timeout, replies.next_message()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(Error::Bus("reply subscription closed".into())),
            Err(_) => Err(Error::Timeout(format!("request on {}", subject))),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        Ok(self.add_subscriber(subject, None))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        Ok(self.add_subscriber(subject, Some(group)))
    }

    fn new_inbox(&self) -> String {
        let n = self.inbox_counter.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.{}", n)
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusExt;
    use letarette_core::protocol::DocumentRequest;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("leta.status").await.unwrap();
        let mut b = bus.subscribe("leta.status").await.unwrap();
        let mut other = bus.subscribe("leta.other").await.unwrap();

        bus.publish("leta.status", b"hello".to_vec()).await.unwrap();
        assert_eq!(a.next_message().await.unwrap().payload, b"hello");
        assert_eq!(b.next_message().await.unwrap().payload, b"hello");

        let nothing = tokio::time::timeout(Duration::from_millis(20), other.next_message()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let bus = MemoryBus::new();
        let mut members = Vec::new();
        for _ in 0..3 {
            members.push(bus.queue_subscribe("leta.q", "0").await.unwrap());
        }
        let mut plain = bus.subscribe("leta.q").await.unwrap();

        for i in 0..10u8 {
            bus.publish("leta.q", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(plain.next_message().await.unwrap().payload, vec![i]);
        }

        let mut received = 0;
        for member in members.iter_mut() {
            while let Ok(Some(_)) =
                tokio::time::timeout(Duration::from_millis(10), member.next_message()).await
            {
                received += 1;
            }
        }
        assert_eq!(received, 10);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = MemoryBus::new();
        let responder = bus.clone();
        let mut requests = bus.subscribe("leta.echo").await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = requests.next_message().await {
                let req: DocumentRequest = msg.decode().unwrap();
                responder.reply_json(&msg, &req.wanted).await.unwrap();
            }
        });

        let req = DocumentRequest {
            space: "docs".into(),
            wanted: vec!["x".into()],
        };
        let wanted: Vec<String> = bus
            .request_json("leta.echo", &req, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(wanted, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let bus = MemoryBus::new();
        let err = bus
            .request("leta.index.request", b"{}".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponders(_)));

        let _silent = bus.subscribe("leta.index.request").await.unwrap();
        let err = bus
            .request("leta.index.request", b"{}".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_take_and_drop_unsubscribe() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("leta.x").await.unwrap().take(2);
        for _ in 0..3 {
            bus.publish("leta.x", vec![1]).await.unwrap();
        }
        assert!(sub.next_message().await.is_some());
        assert!(sub.next_message().await.is_some());
        assert!(sub.next_message().await.is_none());

        drop(sub);
        assert_eq!(bus.subscriber_count("leta.x"), 0);
    }

    #[tokio::test]
    async fn test_max_payload() {
        let bus = MemoryBus::with_max_payload(8);
        let err = bus.publish("leta.x", vec![0; 9]).await.unwrap_err();
        assert!(matches!(err, Error::MaxPayload(9)));
    }
}
