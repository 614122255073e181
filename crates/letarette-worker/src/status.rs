//! Cluster status: publish our own status and track the rest of the
//! shard group from their broadcasts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::state::WorkerState;
use letarette_bus::BusExt;
use letarette_core::protocol::{
    epoch, IndexStatus, IndexStatusCode, Semver, PROTOCOL_VERSION,
};
use letarette_core::{Error, Result, Shard};
use letarette_store::SqliteStore;

#[derive(Debug, Clone)]
pub struct StatusOptions {
    /// Delay before the first status is computed and published.
    pub first_checkpoint: Duration,
    pub interval: Duration,
    /// Peers not heard from for this long are considered gone.
    pub stale_after: Duration,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            first_checkpoint: Duration::from_secs(5),
            interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// A healthy peer shard, usable as a clone source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfo {
    pub shardgroup_size: u16,
    pub shard_index: u16,
    pub doc_count: u64,
}

enum StatusMessage {
    HealthyShards(oneshot::Sender<Vec<ShardInfo>>),
    ShardInitDone,
    Current(oneshot::Sender<IndexStatusCode>),
}

/// Handle to the status task.
#[derive(Clone)]
pub struct StatusMonitor {
    tx: mpsc::UnboundedSender<StatusMessage>,
}

impl StatusMonitor {
    pub async fn start(state: Arc<WorkerState>, options: StatusOptions) -> Result<(Self, JoinHandle<()>)> {
        let mut statuses = state.bus.subscribe(&state.subject("status")).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        info!("Index@{}", state.index_id());

        let task = tokio::spawn(async move {
            let mut tracker = Tracker::new(state.index_id().to_string(), state.config.shard, options);
            let mut checkpoint = Box::pin(tokio::time::sleep(tracker.options.first_checkpoint));

            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    msg = statuses.next_message() => {
                        let Some(msg) = msg else { break };
                        match msg.decode::<IndexStatus>() {
                            Ok(status) => tracker.update(status, Instant::now()),
                            Err(e) => warn!("Bad status message: {}", e),
                        }
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        tracker.handle(msg);
                    }
                    _ = &mut checkpoint => {
                        if let Err(e) = publish_checkpoint(&state, &mut tracker).await {
                            error!("Status checkpoint failed: {}", e);
                        }
                        tracker.checkpoint_passed();
                        checkpoint
                            .as_mut()
                            .reset(Instant::now() + tracker.options.interval);
                    }
                }
            }
            debug!("Status monitor stopped");
        });

        Ok((Self { tx }, task))
    }

    /// Peers that are starting up, in sync or syncing. Waits for the
    /// first checkpoint so that peers have had a chance to report.
    pub async fn healthy_shards(&self) -> Result<Vec<ShardInfo>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(StatusMessage::HealthyShards(reply))
            .map_err(|_| Error::Cancelled)?;
        response.await.map_err(|_| Error::Cancelled)
    }

    /// Mark the end of start-up. Until then the worker reports `StartingUp`.
    pub fn shard_init_done(&self) {
        let _ = self.tx.send(StatusMessage::ShardInitDone);
    }

    /// Status computed at the latest checkpoint.
    pub async fn current(&self) -> Result<IndexStatusCode> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(StatusMessage::Current(reply))
            .map_err(|_| Error::Cancelled)?;
        response.await.map_err(|_| Error::Cancelled)
    }
}

struct Tracker {
    index_id: String,
    shard: Shard,
    options: StatusOptions,
    peers: HashMap<String, (IndexStatus, Instant)>,
    current: IndexStatusCode,
    init_done: bool,
    started: bool,
    waiting: Vec<oneshot::Sender<Vec<ShardInfo>>>,
}

impl Tracker {
    fn new(index_id: String, shard: Shard, options: StatusOptions) -> Self {
        Self {
            index_id,
            shard,
            options,
            peers: HashMap::new(),
            current: IndexStatusCode::StartingUp,
            init_done: false,
            started: false,
            waiting: Vec::new(),
        }
    }

    fn update(&mut self, status: IndexStatus, now: Instant) {
        if status.index_id == self.index_id {
            return;
        }
        self.peers.insert(status.index_id.clone(), (status, now));
    }

    fn handle(&mut self, msg: StatusMessage) {
        match msg {
            StatusMessage::HealthyShards(reply) => {
                if self.started {
                    let _ = reply.send(self.healthy_shards(Instant::now()));
                } else {
                    self.waiting.push(reply);
                }
            }
            StatusMessage::ShardInitDone => self.init_done = true,
            StatusMessage::Current(reply) => {
                let _ = reply.send(self.current);
            }
        }
    }

    fn checkpoint_passed(&mut self) {
        self.started = true;
        let healthy = self.healthy_shards(Instant::now());
        for reply in self.waiting.drain(..) {
            let _ = reply.send(healthy.clone());
        }
    }

    /// Forget peers not heard from within the stale limit.
    fn prune(&mut self, now: Instant) -> usize {
        let stale_after = self.options.stale_after;
        let before = self.peers.len();
        self.peers
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) <= stale_after);
        before - self.peers.len()
    }

    fn active_peers(&self, now: Instant) -> Vec<&IndexStatus> {
        self.peers
            .values()
            .filter(|(_, seen)| now.saturating_duration_since(*seen) <= self.options.stale_after)
            .map(|(status, _)| status)
            .collect()
    }

    fn healthy_shards(&self, now: Instant) -> Vec<ShardInfo> {
        self.active_peers(now)
            .into_iter()
            .filter(|status| status.status <= IndexStatusCode::Syncing)
            .map(|status| ShardInfo {
                shardgroup_size: status.shardgroup_size,
                shard_index: status.shardgroup,
                doc_count: status.doc_count,
            })
            .collect()
    }
}

/// Local status given the active peers. The worst applicable status wins.
pub(crate) fn compute_status(
    local: Shard,
    peers: &[&IndexStatus],
    init_done: bool,
    has_interest: bool,
) -> IndexStatusCode {
    let mut status = if init_done {
        IndexStatusCode::InSync
    } else {
        IndexStatusCode::StartingUp
    };
    let mut raise = |code: IndexStatusCode| status = status.max(code);

    let mut covered = vec![false; usize::from(local.size)];
    covered[usize::from(local.index)] = true;

    for peer in peers {
        if peer.shardgroup_size != local.size {
            error!(
                "Shard group size mismatch: worker@{}({}) != local({})",
                peer.index_id, peer.shardgroup_size, local.size
            );
            raise(IndexStatusCode::IncompleteShardgroup);
        }
        let compatible = Semver::parse(&peer.version)
            .map(|v| v.compatible_with(&PROTOCOL_VERSION))
            .unwrap_or(false);
        if !compatible {
            error!(
                "Incompatible protocol versions: worker@{}({}) vs local({})",
                peer.index_id, peer.version, PROTOCOL_VERSION
            );
            raise(IndexStatusCode::Incompatible);
        }
        if let Some(slot) = covered.get_mut(usize::from(peer.shardgroup)) {
            *slot = true;
        }
    }

    let missing: Vec<String> = covered
        .iter()
        .enumerate()
        .filter(|(_, present)| !**present)
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if !missing.is_empty() {
        error!("No active workers for shards {}!", missing.join(","));
        raise(IndexStatusCode::IncompleteShardgroup);
    }

    if status == IndexStatusCode::InSync && has_interest {
        status = IndexStatusCode::Syncing;
    }
    status
}

struct LocalState {
    doc_count: u64,
    last_update: DateTime<Utc>,
    has_interest: bool,
}

fn read_local_state(store: &SqliteStore, spaces: &[String]) -> Result<LocalState> {
    let mut last_update = epoch();
    for space in spaces {
        last_update = last_update.max(store.last_update_time(space)?);
    }
    Ok(LocalState {
        doc_count: store.document_count()?,
        last_update,
        has_interest: store.has_interest()?,
    })
}

async fn publish_checkpoint(state: &WorkerState, tracker: &mut Tracker) -> Result<()> {
    let spaces = state.config.index.spaces.clone();
    let local = state
        .with_store(move |store| read_local_state(store, &spaces))
        .await?;

    let now = Instant::now();
    let pruned = tracker.prune(now);
    if pruned > 0 {
        debug!("Dropped {} stale workers", pruned);
    }
    let code = compute_status(
        tracker.shard,
        &tracker.active_peers(now),
        tracker.init_done,
        local.has_interest,
    );
    if code != tracker.current {
        info!("Status changed: {} -> {}", tracker.current, code);
    }
    tracker.current = code;

    let status = IndexStatus {
        index_id: tracker.index_id.clone(),
        version: PROTOCOL_VERSION.to_string(),
        doc_count: local.doc_count,
        last_update: local.last_update,
        shardgroup_size: tracker.shard.size,
        shardgroup: tracker.shard.index,
        status: code,
    };
    state.bus.publish_json(&state.subject("status"), &status).await
}
