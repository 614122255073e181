//! Client-side search: fan a query out to every shard and merge the
//! answers into one response.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::monitor::Monitor;
use letarette_bus::{Bus, BusExt};
use letarette_core::protocol::{SearchRequest, SearchResponse, SearchStatus};
use letarette_core::{Error, Result};

const SHARDGROUP_WAIT: Duration = Duration::from_secs(5);
const SHARDGROUP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub topic: String,
    /// Fixed shard group size. When unset, it is learned from status
    /// broadcasts.
    pub shardgroup_size: Option<u16>,
    pub timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            topic: "leta".into(),
            shardgroup_size: None,
            timeout: Duration::from_secs(2),
        }
    }
}

pub struct SearchAgent {
    bus: Arc<dyn Bus>,
    options: AgentOptions,
    shardgroup_size: Arc<AtomicU16>,
    _monitor: Option<Monitor>,
}

impl SearchAgent {
    pub async fn connect(bus: Arc<dyn Bus>, options: AgentOptions) -> Result<Self> {
        let shardgroup_size = Arc::new(AtomicU16::new(options.shardgroup_size.unwrap_or(0)));
        let monitor = if options.shardgroup_size.is_none() {
            let size = shardgroup_size.clone();
            let monitor = Monitor::start(bus.clone(), &options.topic, move |status| {
                size.store(status.shardgroup_size, Ordering::Relaxed);
            })
            .await?;
            Some(monitor)
        } else {
            None
        };

        Ok(Self {
            bus,
            options,
            shardgroup_size,
            _monitor: monitor,
        })
    }

    async fn shardgroup_size(&self) -> Result<u16> {
        let deadline = Instant::now() + SHARDGROUP_WAIT;
        loop {
            let size = self.shardgroup_size.load(Ordering::Relaxed);
            if size > 0 {
                return Ok(size);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for cluster".into()));
            }
            tokio::time::sleep(SHARDGROUP_POLL).await;
        }
    }

    pub async fn search(
        &self,
        query: &str,
        spaces: &[String],
        page_limit: u16,
        page_offset: u16,
    ) -> Result<SearchResponse> {
        self.search_request(SearchRequest {
            spaces: spaces.to_vec(),
            query: query.to_string(),
            page_limit,
            page_offset,
            autocorrect: true,
        })
        .await
    }

    /// Send `request` to all shards. The page limit is divided between
    /// the shards and the merged hits are cut back to it. Shards that do
    /// not answer in time make the result partial.
    pub async fn search_request(&self, mut request: SearchRequest) -> Result<SearchResponse> {
        let shards = self.shardgroup_size().await?;
        let page_limit = usize::from(request.page_limit);
        request.page_limit = request.page_limit.div_ceil(shards).max(1);

        let inbox = self.bus.new_inbox();
        let mut replies = self.bus.subscribe(&inbox).await?.take(usize::from(shards));
        let subject = format!("{}.q", self.options.topic);
        self.bus
            .publish_request_json(&subject, &inbox, &request)
            .await?;

        let deadline = Instant::now() + self.options.timeout;
        let mut responses = Vec::with_capacity(usize::from(shards));
        while responses.len() < usize::from(shards) {
            match tokio::time::timeout_at(deadline, replies.next_message()).await {
                Ok(Some(msg)) => match msg.decode::<SearchResponse>() {
                    Ok(response) => responses.push(response),
                    Err(e) => warn!("Bad search response: {}", e),
                },
                Ok(None) | Err(_) => break,
            }
        }

        if responses.is_empty() {
            return Err(Error::Timeout("waiting for search response".into()));
        }
        let complete = responses.len() == usize::from(shards);
        debug!("Got {} of {} shard responses", responses.len(), shards);

        let mut merged = merge_responses(&responses);
        merged.result.hits.truncate(page_limit);
        if !complete && merged.status != SearchStatus::Error {
            merged.status = SearchStatus::Partial;
        }
        Ok(merged)
    }
}

/// Combine shard responses. Hits are ordered by rank, keeping shard order
/// for equal ranks.
pub fn merge_responses(responses: &[SearchResponse]) -> SearchResponse {
    let mut merged = SearchResponse::default();
    for response in responses {
        merged.duration = merged.duration.max(response.duration);
        merged.status = merged.status.max(response.status);

        let result = &response.result;
        merged.result.capped |= result.capped;
        merged.result.total_hits += result.total_hits;
        merged.result.hits.extend(result.hits.iter().cloned());

        if !result.respelt.is_empty()
            && result.respelt_distance > 0.0
            && (merged.result.respelt.is_empty()
                || result.respelt_distance < merged.result.respelt_distance)
        {
            merged.result.respelt = result.respelt.clone();
            merged.result.respelt_distance = result.respelt_distance;
        }
    }
    merged
        .result
        .hits
        .sort_by(|a, b| a.rank.total_cmp(&b.rank));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use letarette_bus::MemoryBus;
    use letarette_core::protocol::{SearchHit, SearchResult};

    fn hit(id: &str, rank: f32) -> SearchHit {
        SearchHit {
            space: "docs".into(),
            id: id.into(),
            snippet: String::new(),
            rank,
        }
    }

    fn response(status: SearchStatus, hits: Vec<SearchHit>, total: u32) -> SearchResponse {
        SearchResponse {
            result: SearchResult {
                hits,
                total_hits: total,
                ..Default::default()
            },
            duration: 0.1,
            status,
        }
    }

    #[test]
    fn test_merge_orders_by_rank() {
        let merged = merge_responses(&[
            response(SearchStatus::NoHit, vec![hit("a", 0.1)], 0),
            response(SearchStatus::Ok, vec![hit("b", 0.05)], 1),
            response(SearchStatus::Ok, vec![], 0),
        ]);
        assert_eq!(merged.status, SearchStatus::Ok);
        assert_eq!(merged.result.total_hits, 1);
        let ids: Vec<&str> = merged.result.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_merge_is_stable_and_keeps_best_respelling() {
        let mut first = response(SearchStatus::Ok, vec![hit("x", -1.0), hit("y", -1.0)], 2);
        first.result.respelt = "\"melon\"".into();
        first.result.respelt_distance = 2.0;
        first.result.capped = true;
        let mut second = response(SearchStatus::Ok, vec![hit("z", -1.0)], 1);
        second.result.respelt = "\"melo\"".into();
        second.result.respelt_distance = 1.0;
        second.duration = 0.5;

        let merged = merge_responses(&[first, second]);
        let ids: Vec<&str> = merged.result.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
        assert_eq!(merged.result.respelt, "\"melo\"");
        assert_eq!(merged.result.respelt_distance, 1.0);
        assert!(merged.result.capped);
        assert_eq!(merged.duration, 0.5);
    }

    async fn fake_shard(bus: Arc<MemoryBus>, group: &str, hits: Vec<SearchHit>) {
        let mut requests = bus.queue_subscribe("leta.q", group).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = requests.next_message().await {
                let req: SearchRequest = msg.decode().unwrap();
                assert_eq!(req.page_limit, 5);
                let total = hits.len() as u32;
                let status = if hits.is_empty() {
                    SearchStatus::NoHit
                } else {
                    SearchStatus::Ok
                };
                let reply = response(status, hits.clone(), total);
                bus.reply_json(&msg, &reply).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_search_fans_out_to_all_shards() {
        let bus = Arc::new(MemoryBus::new());
        fake_shard(bus.clone(), "0", vec![hit("a", 0.2)]).await;
        fake_shard(bus.clone(), "1", vec![hit("b", 0.1)]).await;

        let agent = SearchAgent::connect(
            bus.clone(),
            AgentOptions {
                shardgroup_size: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let res = agent.search("fruit", &["docs".to_string()], 10, 0).await.unwrap();
        assert_eq!(res.status, SearchStatus::Ok);
        assert_eq!(res.result.total_hits, 2);
        assert_eq!(res.result.hits[0].id, "b");
    }

    #[tokio::test]
    async fn test_merged_hits_are_cut_to_page_limit() {
        let bus = Arc::new(MemoryBus::new());
        let hits = |prefix: &str, base: f32| {
            (0..5)
                .map(|i| hit(&format!("{}{}", prefix, i), base + i as f32))
                .collect::<Vec<_>>()
        };
        fake_shard(bus.clone(), "0", hits("a", 0.0)).await;
        fake_shard(bus.clone(), "1", hits("b", 0.5)).await;

        let agent = SearchAgent::connect(
            bus.clone(),
            AgentOptions {
                shardgroup_size: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let res = agent.search("fruit", &["docs".to_string()], 9, 0).await.unwrap();
        assert_eq!(res.result.total_hits, 10);
        assert_eq!(res.result.hits.len(), 9);
        assert_eq!(res.result.hits[0].id, "a0");
        assert_eq!(res.result.hits[8].id, "a4");
    }

    #[tokio::test]
    async fn test_missing_shard_gives_partial_result() {
        let bus = Arc::new(MemoryBus::new());
        fake_shard(bus.clone(), "0", vec![hit("a", 0.2)]).await;

        let agent = SearchAgent::connect(
            bus.clone(),
            AgentOptions {
                shardgroup_size: Some(2),
                timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let res = agent.search("fruit", &["docs".to_string()], 10, 0).await.unwrap();
        assert_eq!(res.status, SearchStatus::Partial);
        assert_eq!(res.result.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_no_shards_times_out() {
        let bus = Arc::new(MemoryBus::new());
        let agent = SearchAgent::connect(
            bus,
            AgentOptions {
                shardgroup_size: Some(1),
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = agent.search("fruit", &["docs".to_string()], 10, 0).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
