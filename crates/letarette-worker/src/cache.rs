//! Search result cache.
//!
//! A single coordinator task owns the entries. Other tasks talk to it
//! through a [`Cache`] handle. Entries live for a fixed time and are
//! dropped early when a document they contain is updated.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use letarette_core::protocol::{DocumentId, SearchResult};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    spaces: Vec<String>,
    limit: u16,
    offset: u16,
}

impl CacheKey {
    /// `query` should be a canonical form of the parsed query. Space order
    /// does not matter.
    pub fn new(query: impl Into<String>, spaces: &[String], limit: u16, offset: u16) -> Self {
        let mut spaces = spaces.to_vec();
        spaces.sort();
        spaces.dedup();
        Self {
            query: query.into(),
            spaces,
            limit,
            offset,
        }
    }
}

struct Entry {
    key: CacheKey,
    stamp: Instant,
}

/// Entry bookkeeping, kept separate from the task for testing.
pub(crate) struct CacheCore {
    ttl: Duration,
    /// Ordered by stamp, oldest first.
    entries: VecDeque<Entry>,
    results: HashMap<CacheKey, Arc<SearchResult>>,
    by_document: HashMap<DocumentId, HashSet<CacheKey>>,
}

impl CacheCore {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: VecDeque::new(),
            results: HashMap::new(),
            by_document: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<SearchResult>> {
        self.results.get(key).cloned()
    }

    /// Add an entry. An existing entry for the same key is kept.
    pub(crate) fn put(&mut self, key: CacheKey, result: SearchResult, now: Instant) {
        if self.results.contains_key(&key) {
            return;
        }
        for hit in &result.hits {
            self.by_document
                .entry(hit.id.clone())
                .or_default()
                .insert(key.clone());
        }
        self.results.insert(key.clone(), Arc::new(result));
        // Stamps come from a monotonic clock, so pushing keeps the order.
        self.entries.push_back(Entry { key, stamp: now });
    }

    /// Remove the result for `key` and its document references.
    fn forget(&mut self, key: &CacheKey) {
        let Some(result) = self.results.remove(key) else {
            return;
        };
        for hit in &result.hits {
            if let Some(keys) = self.by_document.get_mut(&hit.id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_document.remove(&hit.id);
                }
            }
        }
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let Some(limit) = now.checked_sub(self.ttl) else {
            return 0;
        };
        let expired = self.entries.partition_point(|e| e.stamp < limit);
        let keys: Vec<CacheKey> = self.entries.drain(..expired).map(|e| e.key).collect();
        for key in &keys {
            self.forget(key);
        }
        expired
    }

    /// Drop every entry containing `doc_id`.
    pub(crate) fn invalidate(&mut self, doc_id: &str) -> usize {
        let Some(keys) = self.by_document.get(doc_id).cloned() else {
            return 0;
        };
        for key in &keys {
            self.forget(key);
        }
        self.entries.retain(|e| !keys.contains(&e.key));
        keys.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.results.len()
    }
}

enum CacheMessage {
    Get(CacheKey, oneshot::Sender<Option<Arc<SearchResult>>>),
    Put(CacheKey, SearchResult, Instant),
    Sweep,
    Invalidate(DocumentId),
}

/// Handle to the cache coordinator.
#[derive(Clone)]
pub struct Cache {
    tx: mpsc::UnboundedSender<CacheMessage>,
}

impl Cache {
    /// Spawn the coordinator and its sweep timer.
    pub fn start(ttl: Duration, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sweeper = tx.clone();
        let sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if sweeper.send(CacheMessage::Sweep).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut core = CacheCore::new(ttl);
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                match msg {
                    CacheMessage::Get(key, reply) => {
                        let _ = reply.send(core.get(&key));
                    }
                    CacheMessage::Put(key, result, stamp) => core.put(key, result, stamp),
                    CacheMessage::Sweep => {
                        let removed = core.sweep(Instant::now());
                        if removed > 0 {
                            debug!("Cache sweep removed {} of {} entries", removed, removed + core.len());
                        }
                    }
                    CacheMessage::Invalidate(doc_id) => {
                        core.invalidate(&doc_id);
                    }
                }
            }
        });

        Self { tx }
    }

    /// Cached result for `key`. Returns `None` on miss or when the
    /// coordinator has stopped.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<SearchResult>> {
        let (reply, response) = oneshot::channel();
        self.tx.send(CacheMessage::Get(key.clone(), reply)).ok()?;
        response.await.ok().flatten()
    }

    pub fn put(&self, key: CacheKey, result: SearchResult) {
        let _ = self.tx.send(CacheMessage::Put(key, result, Instant::now()));
    }

    pub fn invalidate(&self, doc_id: &str) {
        let _ = self.tx.send(CacheMessage::Invalidate(doc_id.to_string()));
    }

    /// Request an immediate sweep.
    pub fn sweep(&self) {
        let _ = self.tx.send(CacheMessage::Sweep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letarette_core::protocol::SearchHit;

    fn key(q: &str) -> CacheKey {
        CacheKey::new(q, &["docs".to_string()], 10, 0)
    }

    fn result(ids: &[&str]) -> SearchResult {
        SearchResult {
            hits: ids
                .iter()
                .map(|id| SearchHit {
                    space: "docs".into(),
                    id: id.to_string(),
                    snippet: String::new(),
                    rank: -1.0,
                })
                .collect(),
            total_hits: ids.len() as u32,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_ignores_space_order() {
        let a = CacheKey::new("q", &["b".to_string(), "a".to_string()], 10, 0);
        let b = CacheKey::new("q", &["a".to_string(), "b".to_string()], 10, 0);
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("q", &["a".to_string(), "b".to_string()], 10, 1));
    }

    #[test]
    fn test_entry_survives_until_ttl() {
        let ttl = Duration::from_secs(10);
        let mut core = CacheCore::new(ttl);
        let start = Instant::now();
        core.put(key("a"), result(&["1"]), start);

        assert_eq!(core.sweep(start + Duration::from_secs(5)), 0);
        assert_eq!(core.get(&key("a")).unwrap().hits[0].id, "1");

        assert_eq!(core.sweep(start + ttl + Duration::from_millis(1)), 1);
        assert!(core.get(&key("a")).is_none());
        assert_eq!(core.len(), 0);
    }

    #[test]
    fn test_sweep_removes_only_old_entries() {
        let ttl = Duration::from_secs(10);
        let mut core = CacheCore::new(ttl);
        let start = Instant::now();
        for i in 0..5u64 {
            core.put(key(&i.to_string()), result(&[]), start + Duration::from_secs(i * 4));
        }
        // Entries stamped before 9s are gone.
        assert_eq!(core.sweep(start + Duration::from_secs(19)), 3);
        assert!(core.get(&key("2")).is_none());
        assert!(core.get(&key("3")).is_some());
        assert!(core.get(&key("4")).is_some());
    }

    #[test]
    fn test_first_put_wins() {
        let mut core = CacheCore::new(Duration::from_secs(10));
        let now = Instant::now();
        core.put(key("a"), result(&["first"]), now);
        core.put(key("a"), result(&["second"]), now);
        assert_eq!(core.get(&key("a")).unwrap().hits[0].id, "first");
        assert_eq!(core.len(), 1);
    }

    #[test]
    fn test_invalidate_by_document() {
        let mut core = CacheCore::new(Duration::from_secs(10));
        let now = Instant::now();
        core.put(key("a"), result(&["1", "2"]), now);
        core.put(key("b"), result(&["2"]), now);
        core.put(key("c"), result(&["3"]), now);

        assert_eq!(core.invalidate("2"), 2);
        assert!(core.get(&key("a")).is_none());
        assert!(core.get(&key("b")).is_none());
        assert!(core.get(&key("c")).is_some());
        assert_eq!(core.invalidate("2"), 0);
        assert_eq!(core.sweep(now + Duration::from_secs(11)), 1);
    }

    #[tokio::test]
    async fn test_cache_handle() {
        let shutdown = CancellationToken::new();
        let cache = Cache::start(Duration::from_secs(60), shutdown.clone());

        assert!(cache.get(&key("a")).await.is_none());
        cache.put(key("a"), result(&["1"]));
        assert_eq!(cache.get(&key("a")).await.unwrap().total_hits, 1);

        cache.invalidate("1");
        assert!(cache.get(&key("a")).await.is_none());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cache_handle_expires_entries() {
        let shutdown = CancellationToken::new();
        let cache = Cache::start(Duration::from_millis(50), shutdown.clone());
        cache.put(key("a"), result(&["1"]));
        assert!(cache.get(&key("a")).await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.sweep();
        assert!(cache.get(&key("a")).await.is_none());
        shutdown.cancel();
    }
}
