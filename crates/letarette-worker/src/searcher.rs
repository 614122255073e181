//! Search responder on `<topic>.q`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::CacheKey;
use crate::state::WorkerState;
use letarette_bus::BusExt;
use letarette_core::protocol::{SearchRequest, SearchResponse, SearchResult, SearchStatus};
use letarette_core::query::{canonicalize_phrase_list, parse_query, reduce_phrase_list, PhraseList};
use letarette_core::{Error, Result};

const MAX_PAGE_LIMIT: u16 = 500;
const MAX_CONCURRENT_SEARCHES: usize = 16;

/// Queue-subscribe on `<topic>.q` in the shard index group, so that one
/// worker per shard answers each query.
pub async fn start_searcher(state: Arc<WorkerState>) -> Result<JoinHandle<()>> {
    let mut requests = state
        .bus
        .queue_subscribe(&state.subject("q"), &state.config.search_group())
        .await?;
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES));

    Ok(tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                msg = requests.next_message() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let req: SearchRequest = match msg.decode() {
                Ok(req) => req,
                Err(e) => {
                    warn!("Bad search request: {}", e);
                    continue;
                }
            };

            state.metrics.query_queue.inc();
            let state = state.clone();
            let permits = permits.clone();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                let response = execute(&state, req).await;
                state.metrics.query_queue.dec();
                if let Err(e) = state.bus.reply_json(&msg, &response).await {
                    warn!("Failed to send search response: {}", e);
                }
            });
        }
    }))
}

/// Answer one search request from the cache or the index.
pub async fn execute(state: &WorkerState, req: SearchRequest) -> SearchResponse {
    let started = Instant::now();
    let limit = req.page_limit.clamp(1, MAX_PAGE_LIMIT);
    let offset = req.page_offset;

    let phrases = reduce_phrase_list(parse_query(&req.query));
    let canonical = canonicalize_phrase_list(&phrases);
    let key = CacheKey::new(
        PhraseList(&canonical).to_string(),
        &req.spaces,
        limit,
        offset,
    );

    let (result, status) = match state.cache.get(&key).await {
        Some(cached) => {
            state.metrics.cache_hits.inc();
            let status = status_for(&cached);
            ((*cached).clone(), status)
        }
        None => {
            state.metrics.cache_misses.inc();
            match run_search(state, phrases, req.spaces, limit, offset, req.autocorrect).await {
                Ok(result) => {
                    state.cache.put(key, result.clone());
                    let status = status_for(&result);
                    (result, status)
                }
                Err(e) => {
                    error!("Search for {:?} failed: {}", req.query, e);
                    (SearchResult::default(), SearchStatus::Error)
                }
            }
        }
    };

    let duration = started.elapsed().as_secs_f32();
    state.metrics.search_duration.observe(f64::from(duration));
    debug!("Query {:?}: {} hits in {:.3}s", req.query, result.total_hits, duration);
    SearchResponse {
        result,
        duration,
        status,
    }
}

fn status_for(result: &SearchResult) -> SearchStatus {
    if result.hits.is_empty() {
        SearchStatus::NoHit
    } else {
        SearchStatus::Ok
    }
}

async fn run_search(
    state: &WorkerState,
    phrases: Vec<letarette_core::Phrase>,
    spaces: Vec<String>,
    limit: u16,
    offset: u16,
    autocorrect: bool,
) -> Result<SearchResult> {
    let search = state.with_store(move |store| {
        store.search(&phrases, &spaces, limit, offset, autocorrect)
    });
    tokio::time::timeout(state.config.search.timeout, search)
        .await
        .map_err(|_| Error::Timeout("search".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use letarette_bus::{Bus, MemoryBus};
    use letarette_core::protocol::Document;
    use letarette_core::Config;
    use letarette_store::{SqliteStore, StoreOptions};
    use tempfile::TempDir;

    fn worker_state(dir: &TempDir) -> WorkerState {
        let config = Config::default();
        let store = SqliteStore::open(dir.path().join("index.db"), StoreOptions::from(&config)).unwrap();
        {
            let mut loader = store.start_bulk_load("docs").unwrap();
            for (id, text) in [("1", "apple pie recipe"), ("2", "banana bread"), ("3", "apple crumble")] {
                loader
                    .load(&Document {
                        id: id.into(),
                        updated: chrono::Utc::now(),
                        title: String::new(),
                        text: text.into(),
                        alive: true,
                    })
                    .unwrap();
            }
            loader.commit().unwrap();
        }
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        WorkerState::new(config, Arc::new(store), bus)
    }

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            spaces: vec!["docs".into()],
            query: query.into(),
            page_limit: 10,
            page_offset: 0,
            autocorrect: true,
        }
    }

    #[tokio::test]
    async fn test_execute_finds_and_caches() {
        let dir = TempDir::new().unwrap();
        let state = worker_state(&dir);

        let first = execute(&state, request("apple")).await;
        assert_eq!(first.status, SearchStatus::Ok);
        assert_eq!(first.result.total_hits, 2);
        assert_eq!(state.metrics.cache_misses.get(), 1);

        // Same canonical query.
        let second = execute(&state, request("APPLE apple")).await;
        assert_eq!(second.result.hits, first.result.hits);
        assert_eq!(state.metrics.cache_hits.get(), 1);
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_execute_no_hit() {
        let dir = TempDir::new().unwrap();
        let state = worker_state(&dir);
        let response = execute(&state, request("zebra")).await;
        assert_eq!(response.status, SearchStatus::NoHit);
        assert!(response.result.hits.is_empty());

        let empty = execute(&state, request("")).await;
        assert_eq!(empty.status, SearchStatus::NoHit);
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_responder_answers_on_inbox() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(worker_state(&dir));
        let _task = start_searcher(state.clone()).await.unwrap();

        let response: SearchResponse = state
            .bus
            .request_json("leta.q", &request("banana"), std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.status, SearchStatus::Ok);
        assert_eq!(response.result.hits[0].id, "2");
        state.shutdown.cancel();
    }
}
