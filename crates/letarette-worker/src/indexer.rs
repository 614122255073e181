//! Indexer: pulls interest lists from the document masters, requests the
//! listed documents and applies document broadcasts.
//!
//! Each space runs its own loop. A list is fetched only when the previous
//! one is fully served and committed, so the index position only moves
//! past documents that are stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::WorkerState;
use letarette_bus::BusExt;
use letarette_core::protocol::{
    to_nanos, DocumentId, DocumentReference, DocumentRequest, DocumentUpdate, IndexUpdate,
    IndexUpdateRequest,
};
use letarette_core::{Error, Result};
use letarette_store::{Interest, InterestListState, InterestState};

/// Updates further into the future than this are ignored.
const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Start the document update listener and one pull loop per space.
pub async fn start_indexer(state: Arc<WorkerState>) -> Result<Vec<JoinHandle<()>>> {
    for space in state.config.index.spaces.clone() {
        let reset = {
            let space = space.clone();
            state.with_store(move |store| store.reset_requested(&space)).await?
        };
        if reset > 0 {
            info!("Reset {} requested documents in {}", reset, space);
        }
    }

    let notify = Arc::new(Notify::new());
    let mut tasks = vec![start_update_listener(state.clone(), notify.clone()).await?];
    for space in &state.config.index.spaces {
        let indexer = SpaceIndexer::new(state.clone(), space.clone(), notify.clone());
        tasks.push(tokio::spawn(indexer.run()));
    }
    info!("Indexer started for {}", state.config.index.spaces.join(", "));
    Ok(tasks)
}

async fn start_update_listener(state: Arc<WorkerState>, notify: Arc<Notify>) -> Result<JoinHandle<()>> {
    let mut updates = state.bus.subscribe(&state.subject("document.update")).await?;

    Ok(tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                msg = updates.next_message() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let update: DocumentUpdate = match msg.decode() {
                Ok(update) => update,
                Err(e) => {
                    warn!("Bad document update: {}", e);
                    continue;
                }
            };
            if !state.config.index.spaces.contains(&update.space) {
                continue;
            }

            let shard = state.config.shard;
            let DocumentUpdate { space, documents } = update;
            let owned: Vec<_> = documents.into_iter().filter(|doc| shard.owns(&doc.id)).collect();
            if owned.is_empty() {
                continue;
            }

            state.metrics.update_queue.inc();
            let applied = state
                .with_store(move |store| store.add_document_updates(&space, &owned))
                .await;
            state.metrics.update_queue.dec();

            match applied {
                Ok(applied) => {
                    for id in &applied {
                        state.cache.invalidate(id);
                    }
                    if !applied.is_empty() {
                        debug!("Applied {} document updates", applied.len());
                        notify.notify_waiters();
                    }
                }
                Err(e) => error!("Failed to add document update: {}", e),
            }
        }
        debug!("Document update listener stopped");
    }))
}

fn position_moved(before: &InterestListState, after: &InterestListState) -> bool {
    (after.last_updated_at_nanos, &after.last_updated_doc_id)
        != (before.last_updated_at_nanos, &before.last_updated_doc_id)
}

/// Result of asking the master for more work.
enum Fetched {
    /// New interest list stored, or the position moved.
    Progress,
    /// Nothing new.
    Empty,
}

struct SpaceIndexer {
    state: Arc<WorkerState>,
    space: String,
    notify: Arc<Notify>,
    /// Missed request rounds per document.
    attempts: HashMap<DocumentId, u32>,
    /// Request the next list by timestamp only.
    timestamp_cursor: bool,
    last_housekeeping: Option<Instant>,
}

impl SpaceIndexer {
    fn new(state: Arc<WorkerState>, space: String, notify: Arc<Notify>) -> Self {
        Self {
            state,
            space,
            notify,
            attempts: HashMap::new(),
            timestamp_cursor: false,
            last_housekeeping: None,
        }
    }

    async fn run(mut self) {
        let empty_wait = self.state.config.index.empty_cycle_wait;
        while !self.state.shutdown.is_cancelled() {
            let wait = match self.cycle().await {
                Ok(()) => None,
                Err(Error::NoResponders(_)) => {
                    info!("No document manager available for space {:?}", self.space);
                    Some(empty_wait * 4)
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    warn!("Index cycle for {} failed: {}", self.space, e);
                    Some(empty_wait)
                }
            };
            if let Some(wait) = wait {
                if !self.state.pause(wait).await {
                    break;
                }
            }
        }
        info!("Indexer for {} stopped", self.space);
    }

    async fn cycle(&mut self) -> Result<()> {
        let space = self.space.clone();
        let interests = self
            .state
            .with_store(move |store| store.interest_list(&space))
            .await?;

        if interests.is_empty() {
            return match self.fetch_interest_list().await? {
                Fetched::Progress => Ok(()),
                Fetched::Empty => {
                    self.housekeeping().await;
                    if self.state.pause(self.state.config.index.empty_cycle_wait).await {
                        Ok(())
                    } else {
                        Err(Error::Cancelled)
                    }
                }
            };
        }

        let pending: Vec<&Interest> = interests
            .iter()
            .filter(|i| i.state == InterestState::Pending)
            .collect();
        let requested = interests
            .iter()
            .filter(|i| i.state == InterestState::Requested)
            .count();
        let metrics = &self.state.metrics;
        metrics.pending_docs.set(pending.len() as i64);

        if requested > 0 {
            // Left over from an interrupted round.
            let space = self.space.clone();
            self.state
                .with_store(move |store| store.reset_requested(&space))
                .await?;
            return Ok(());
        }

        if pending.is_empty() {
            metrics.served_docs.add(interests.len() as i64);
            let space = self.space.clone();
            let moved = self
                .state
                .with_store(move |store| {
                    let before = store.interest_list_state(&space)?;
                    store.commit_interest_list(&space)?;
                    let after = store.interest_list_state(&space)?;
                    store.clear_interest_list(&space)?;
                    Ok(position_moved(&before, &after))
                })
                .await?;
            self.attempts.clear();
            debug!("Committed interest list of {} for {}", interests.len(), self.space);
            if !moved {
                // Entries newer than the list creation time are fetched again
                // on the next cycle. Give the master clock time to pass them.
                debug!("Index position of {} did not move", self.space);
                if !self.state.pause(self.state.config.index.empty_cycle_wait).await {
                    return Err(Error::Cancelled);
                }
            }
            return Ok(());
        }

        let batch: Vec<Interest> = pending
            .into_iter()
            .take(usize::from(self.state.config.index.max_outstanding))
            .cloned()
            .collect();
        self.request_documents(batch).await
    }

    /// Ask the master for the next chunk of updates after the index position.
    async fn fetch_interest_list(&mut self) -> Result<Fetched> {
        let space = self.space.clone();
        let position = self
            .state
            .with_store(move |store| store.interest_list_state(&space))
            .await?;

        let after_document = if self.timestamp_cursor {
            String::new()
        } else {
            position.last_updated_doc_id.clone()
        };
        let req = IndexUpdateRequest {
            space: self.space.clone(),
            start_time: position.last_updated(),
            after_document,
            limit: self.state.config.index.chunk_size,
        };
        debug!(
            "Requesting index update ({}, {}, {:?})",
            req.space, req.start_time, req.after_document
        );
        let update: IndexUpdate = self
            .state
            .bus
            .request_json(
                &self.state.subject("index.request"),
                &req,
                self.state.config.index.max_interest_wait,
            )
            .await?;
        self.timestamp_cursor = false;

        let now = to_nanos(&Utc::now());
        let horizon = to_nanos(&(Utc::now() + MAX_FUTURE_SKEW));
        let mut updates: Vec<DocumentReference> = Vec::with_capacity(update.updates.len());
        let mut outdated = 0;
        for reference in update.updates {
            let updated = to_nanos(&reference.updated);
            if updated > horizon {
                warn!("Ignoring update of {} far in the future", reference.id);
            } else if updated < position.last_updated_at_nanos {
                outdated += 1;
            } else {
                updates.push(reference);
            }
        }
        if outdated > 0 {
            warn!(
                "Master sent {} updates for {} older than the index position, using timestamp cursor",
                outdated, self.space
            );
            self.timestamp_cursor = true;
        }
        if updates.is_empty() {
            return Ok(Fetched::Empty);
        }

        let shard = self.state.config.shard;
        let owned: Vec<DocumentReference> = updates
            .iter()
            .filter(|r| shard.owns(&r.id))
            .cloned()
            .collect();

        let space = self.space.clone();
        if owned.is_empty() {
            // Nothing for this shard, move past the chunk.
            let Some(last) = updates
                .iter()
                .map(|r| (to_nanos(&r.updated), r.id.clone()))
                .filter(|(updated, _)| *updated <= now)
                .max()
            else {
                return Ok(Fetched::Empty);
            };
            self.state
                .with_store(move |store| store.advance_index_position(&space, last.0, &last.1))
                .await?;
        } else {
            debug!("Received interest list of {} docs for {}", owned.len(), self.space);
            self.state
                .with_store(move |store| store.set_interest_list(&space, &owned))
                .await?;
        }
        Ok(Fetched::Progress)
    }

    /// Request a batch of pending documents and wait for them to arrive.
    async fn request_documents(&mut self, batch: Vec<Interest>) -> Result<()> {
        let space = self.space.clone();
        let (stored, mut missing) = self
            .state
            .with_store(move |store| {
                let mut stored = Vec::new();
                let mut missing = Vec::new();
                for interest in batch {
                    if store.has_document(&space, &interest.doc_id, interest.updated_nanos)? {
                        stored.push(interest.doc_id);
                    } else {
                        missing.push(interest.doc_id);
                    }
                }
                if !stored.is_empty() {
                    store.set_interest_states(&space, &stored, InterestState::Served)?;
                }
                Ok((stored, missing))
            })
            .await?;
        if !stored.is_empty() {
            debug!("{} documents already stored in {}", stored.len(), self.space);
        }
        if missing.is_empty() {
            return Ok(());
        }

        missing.shuffle(&mut rand::thread_rng());
        let space = self.space.clone();
        let wanted = missing.clone();
        self.state
            .with_store(move |store| store.set_interest_states(&space, &wanted, InterestState::Requested))
            .await?;

        let request = DocumentRequest {
            space: self.space.clone(),
            wanted: missing.clone(),
        };
        let metrics = &self.state.metrics;
        metrics.doc_requests.add(missing.len() as i64);
        metrics.document_request_size.observe(missing.len() as f64);
        debug!("Requesting {} docs from {}", missing.len(), self.space);
        if let Err(e) = self
            .state
            .bus
            .publish_json(&self.state.subject("document.request"), &request)
            .await
        {
            let space = self.space.clone();
            self.state
                .with_store(move |store| store.reset_requested(&space))
                .await?;
            return Err(e);
        }

        self.wait_for_documents().await?;
        self.settle_requested(missing).await
    }

    /// Wait until no entry is in the requested state, or the document wait runs out.
    async fn wait_for_documents(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.state.config.index.max_document_wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let space = self.space.clone();
            let outstanding = self
                .state
                .with_store(move |store| {
                    Ok(store
                        .interest_list(&space)?
                        .iter()
                        .any(|i| i.state == InterestState::Requested))
                })
                .await?;
            if !outstanding {
                return Ok(());
            }

            tokio::select! {
                _ = self.state.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = &mut notified => {}
            }
        }
    }

    /// Put documents that did not arrive back to pending, or give up on
    /// them after too many attempts.
    async fn settle_requested(&mut self, requested: Vec<DocumentId>) -> Result<()> {
        let space = self.space.clone();
        let interests = self
            .state
            .with_store(move |store| store.interest_list(&space))
            .await?;
        let still_requested: Vec<&Interest> = interests
            .iter()
            .filter(|i| i.state == InterestState::Requested && requested.contains(&i.doc_id))
            .collect();
        for id in &requested {
            if !still_requested.iter().any(|i| &i.doc_id == id) {
                self.attempts.remove(id);
            }
        }
        if still_requested.is_empty() {
            return Ok(());
        }

        let max_attempts = self.state.config.index.max_attempts;
        let mut retry = Vec::new();
        let mut give_up = Vec::new();
        for interest in still_requested {
            let attempts = self.attempts.entry(interest.doc_id.clone()).or_insert(0);
            *attempts += 1;
            if *attempts >= max_attempts {
                give_up.push(interest.doc_id.clone());
            } else {
                retry.push(interest.doc_id.clone());
            }
        }
        for id in &give_up {
            self.attempts.remove(id);
        }
        if !give_up.is_empty() {
            warn!(
                "Waited too long for {} documents in {}, moving on",
                give_up.len(),
                self.space
            );
        }
        if !retry.is_empty() {
            debug!("Timeout waiting for {} documents, re-requesting", retry.len());
        }

        let space = self.space.clone();
        self.state
            .with_store(move |store| {
                store.set_interest_states(&space, &retry, InterestState::Pending)?;
                store.set_interest_states(&space, &give_up, InterestState::Served)
            })
            .await
    }

    /// Refresh spelling and stopword tables, at most every few minutes.
    async fn housekeeping(&mut self) {
        if let Some(last) = self.last_housekeeping {
            if last.elapsed() < HOUSEKEEPING_INTERVAL {
                return;
            }
        }
        self.last_housekeeping = Some(Instant::now());

        let spelling = self.state.config.spelling.clone();
        let cutoff = self.state.config.stemmer.stopword_cutoff;
        let result = self
            .state
            .with_store(move |store| {
                let lag = store.spelling_lag(spelling.min_frequency)?;
                if lag >= u64::from(spelling.max_lag) {
                    info!("Updating spelling table, lag {}", lag);
                    store.update_spelling(spelling.min_frequency)?;
                }
                store.update_stopwords(cutoff)
            })
            .await;
        match result {
            Ok(stopwords) => debug!("Housekeeping done, {} stopwords", stopwords),
            Err(e) => error!("Housekeeping failed: {}", e),
        }
    }
}
