//! Cold start: clone the index from healthy peers instead of pulling
//! every document from the masters.

use std::collections::HashSet;
use std::time::Duration;

use tracing::info;

use crate::cloning;
use crate::state::WorkerState;
use crate::status::{ShardInfo, StatusMonitor};
use letarette_bus::BusExt;
use letarette_core::protocol::{CloneRequest, CloneStream};
use letarette_core::{Result, Shard};

const CLONE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Cloning is skipped when the local index holds more than this share
/// of the source documents.
const CLONE_THRESHOLD: f64 = 0.8;

/// Pick the peers to clone from: the same shard of an equally sized group
/// if present, otherwise one peer per shard index of the smallest other group.
pub(crate) fn select_clone_sources(infos: &[ShardInfo], local: Shard) -> Vec<ShardInfo> {
    if let Some(same) = infos
        .iter()
        .find(|info| info.shardgroup_size == local.size && info.shard_index == local.index)
    {
        return vec![*same];
    }

    let Some(smallest) = infos
        .iter()
        .map(|info| info.shardgroup_size)
        .filter(|size| *size != local.size)
        .min()
    else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    infos
        .iter()
        .filter(|info| info.shardgroup_size == smallest && seen.insert(info.shard_index))
        .copied()
        .collect()
}

/// Clone from healthy peers if the local index is far behind. Always
/// marks shard initialization as done on the monitor.
pub async fn initialize_shard(state: &WorkerState, monitor: &StatusMonitor) -> Result<usize> {
    let result = clone_from_peers(state, monitor).await;
    monitor.shard_init_done();
    result
}

async fn clone_from_peers(state: &WorkerState, monitor: &StatusMonitor) -> Result<usize> {
    info!("Looking for healthy shards to clone");
    let infos = monitor.healthy_shards().await?;
    let local = state.config.shard;

    let sources = select_clone_sources(&infos, local);
    if sources.is_empty() {
        info!("Found no valid cloning sources, continuing normal startup");
        return Ok(0);
    }

    let source_total: u64 = sources.iter().map(|s| s.doc_count).sum();
    let count = state.with_store(|store| store.document_count()).await?;
    if count as f64 > CLONE_THRESHOLD * source_total as f64 {
        info!("In sync enough to skip cloning, continuing normal startup");
        return Ok(0);
    }

    let mut loaded = 0;
    for source in sources {
        let source_shard = Shard {
            index: source.shard_index,
            size: source.shardgroup_size,
        };
        info!("Requesting clone from shard {}", source_shard);

        let req = CloneRequest {
            source_shard: source_shard.to_string(),
            target_shard: local.to_string(),
        };
        let stream: CloneStream = state
            .bus
            .request_json(&state.subject("clone"), &req, CLONE_REQUEST_TIMEOUT)
            .await?;

        let count = cloning::load_from_url(state.store.clone(), &stream.url, state.shutdown.clone()).await?;
        info!("Loaded {} documents from shard {}", count, source_shard);
        loaded += count;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(size: u16, index: u16, docs: u64) -> ShardInfo {
        ShardInfo {
            shardgroup_size: size,
            shard_index: index,
            doc_count: docs,
        }
    }

    #[test]
    fn test_prefers_same_shard() {
        let local = Shard::new(1, 2).unwrap();
        let infos = [info(1, 0, 100), info(2, 1, 50), info(2, 0, 50)];
        assert_eq!(select_clone_sources(&infos, local), vec![info(2, 1, 50)]);
    }

    #[test]
    fn test_smallest_other_group_one_per_index() {
        let local = Shard::new(0, 4).unwrap();
        let infos = [
            info(3, 0, 30),
            info(2, 1, 50),
            info(2, 0, 50),
            info(2, 1, 51),
            info(4, 2, 25),
        ];
        let sources = select_clone_sources(&infos, local);
        assert_eq!(sources, vec![info(2, 1, 50), info(2, 0, 50)]);
    }

    #[test]
    fn test_no_sources_from_own_group() {
        let local = Shard::new(0, 2).unwrap();
        assert!(select_clone_sources(&[info(2, 1, 10)], local).is_empty());
        assert!(select_clone_sources(&[], local).is_empty());
    }
}
