//! Document master side of the protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use letarette_bus::{Bus, BusExt};
use letarette_core::protocol::{
    DocumentRequest, DocumentUpdate, IndexUpdate, IndexUpdateRequest,
};
use letarette_core::{Error, Result};

/// Provides documents to the cluster.
///
/// `index_update` must return references with `updated >= start_time`,
/// ordered by `(updated, id)`. Returning an empty list means there is
/// nothing newer.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    async fn index_update(&self, req: IndexUpdateRequest) -> Result<IndexUpdate>;

    async fn documents(&self, req: DocumentRequest) -> Result<DocumentUpdate>;
}

/// Answers index and document requests from workers.
pub struct DocumentManager {
    tasks: Vec<JoinHandle<()>>,
}

impl DocumentManager {
    pub async fn start(bus: Arc<dyn Bus>, topic: &str, source: Arc<dyn DocumentSource>) -> Result<Self> {
        let mut index_requests = bus.subscribe(&format!("{}.index.request", topic)).await?;
        let mut document_requests = bus.subscribe(&format!("{}.document.request", topic)).await?;
        let update_subject = format!("{}.document.update", topic);

        let index_task = {
            let bus = bus.clone();
            let source = source.clone();
            tokio::spawn(async move {
                while let Some(msg) = index_requests.next_message().await {
                    let req: IndexUpdateRequest = match msg.decode() {
                        Ok(req) => req,
                        Err(e) => {
                            warn!("Bad index request: {}", e);
                            continue;
                        }
                    };
                    let result = match source.index_update(req).await {
                        Ok(update) => bus.reply_json(&msg, &update).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        error!("Failed to handle index request: {}", e);
                    }
                }
            })
        };

        let document_task = tokio::spawn(async move {
            while let Some(msg) = document_requests.next_message().await {
                let req: DocumentRequest = match msg.decode() {
                    Ok(req) => req,
                    Err(e) => {
                        warn!("Bad document request: {}", e);
                        continue;
                    }
                };
                let result = match source.documents(req).await {
                    Ok(update) => publish_documents(bus.as_ref(), &update_subject, update).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("Failed to handle document request: {}", e);
                }
            }
        });

        Ok(Self {
            tasks: vec![index_task, document_task],
        })
    }

    pub fn close(self) {}
}

impl Drop for DocumentManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Broadcast a document update, splitting it in halves while it is too
/// large for the bus. A single document that is still too large gets its
/// text truncated to half the payload limit.
pub async fn publish_documents(bus: &dyn Bus, subject: &str, update: DocumentUpdate) -> Result<()> {
    let mut pending = vec![update];

    while let Some(current) = pending.pop() {
        match bus.publish_json(subject, &current).await {
            Ok(()) => {}
            Err(Error::MaxPayload(size)) => {
                let DocumentUpdate { space, mut documents } = current;
                if documents.len() > 1 {
                    warn!("Document list too large ({} bytes), splitting", size);
                    let tail = documents.split_off(documents.len() / 2);
                    pending.push(DocumentUpdate {
                        space: space.clone(),
                        documents: tail,
                    });
                    pending.push(DocumentUpdate { space, documents });
                } else if let Some(mut doc) = documents.pop() {
                    let truncated = truncate_text(&doc.text, bus.max_payload() / 2);
                    if truncated.len() >= doc.text.len() {
                        error!("Document {} cannot be sent, dropping", doc.id);
                        continue;
                    }
                    warn!("Document {} too large, truncating", doc.id);
                    doc.text = truncated;
                    pending.push(DocumentUpdate {
                        space,
                        documents: vec![doc],
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Cut `text` to at most `max` bytes on a character boundary, marking
/// the cut with an ellipsis.
fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\u{2026}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use letarette_bus::MemoryBus;
    use letarette_core::protocol::{Document, DocumentReference};
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    fn random_text(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn document(id: usize, text: String) -> Document {
        Document {
            id: id.to_string(),
            updated: Utc::now(),
            title: String::new(),
            text,
            alive: true,
        }
    }

    async fn collect_documents(sub: &mut letarette_bus::Subscription) -> (usize, Vec<Document>) {
        let mut messages = 0;
        let mut docs = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(50), sub.next_message()).await
        {
            let update: DocumentUpdate = msg.decode().unwrap();
            messages += 1;
            docs.extend(update.documents);
        }
        (messages, docs)
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdef", 3), "abc\u{2026}");
        // "å" is two bytes; the cut must not split it.
        assert_eq!(truncate_text("aåb", 2), "a\u{2026}");
    }

    #[tokio::test]
    async fn test_large_updates_are_split() {
        let bus = MemoryBus::with_max_payload(2000);
        let mut updates = bus.subscribe("leta.document.update").await.unwrap();

        let update = DocumentUpdate {
            space: "docs".into(),
            documents: (0..10).map(|i| document(i, random_text(600))).collect(),
        };
        publish_documents(&bus, "leta.document.update", update).await.unwrap();

        let (messages, docs) = collect_documents(&mut updates).await;
        assert!(messages > 1);
        let mut ids: Vec<usize> = docs.iter().map(|d| d.id.parse().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert!(docs.iter().all(|d| d.text.len() == 600));
    }

    #[tokio::test]
    async fn test_oversized_document_is_truncated() {
        let bus = MemoryBus::with_max_payload(2000);
        let mut updates = bus.subscribe("leta.document.update").await.unwrap();

        let update = DocumentUpdate {
            space: "docs".into(),
            documents: vec![document(1, random_text(5000))],
        };
        publish_documents(&bus, "leta.document.update", update).await.unwrap();

        let (messages, docs) = collect_documents(&mut updates).await;
        assert_eq!(messages, 1);
        assert!(docs[0].text.ends_with('\u{2026}'));
        assert_eq!(docs[0].text.chars().count(), 1001);
    }

    struct FixedSource;

    #[async_trait]
    impl DocumentSource for FixedSource {
        async fn index_update(&self, req: IndexUpdateRequest) -> Result<IndexUpdate> {
            Ok(IndexUpdate {
                space: req.space,
                updates: vec![DocumentReference {
                    id: "1".into(),
                    updated: req.start_time,
                }],
            })
        }

        async fn documents(&self, req: DocumentRequest) -> Result<DocumentUpdate> {
            Ok(DocumentUpdate {
                space: req.space,
                documents: req
                    .wanted
                    .iter()
                    .map(|id| document(id.parse().unwrap_or(0), "text".into()))
                    .collect(),
            })
        }
    }

    #[tokio::test]
    async fn test_manager_answers_requests() {
        let bus = Arc::new(MemoryBus::new());
        let _manager = DocumentManager::start(bus.clone(), "leta", Arc::new(FixedSource))
            .await
            .unwrap();
        let mut updates = bus.subscribe("leta.document.update").await.unwrap();

        let req = IndexUpdateRequest {
            space: "docs".into(),
            start_time: Utc::now(),
            after_document: String::new(),
            limit: 10,
        };
        let update: IndexUpdate = bus
            .request_json("leta.index.request", &req, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(update.updates.len(), 1);

        bus.publish_json(
            "leta.document.request",
            &DocumentRequest {
                space: "docs".into(),
                wanted: vec!["7".into(), "8".into()],
            },
        )
        .await
        .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), updates.next_message())
            .await
            .unwrap()
            .unwrap();
        let update: DocumentUpdate = msg.decode().unwrap();
        assert_eq!(update.documents.len(), 2);
    }
}
