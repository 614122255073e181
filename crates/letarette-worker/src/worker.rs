//! Worker assembly: starts every service on a shared state and stops
//! them together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cloner::start_cloner;
use crate::indexer::start_indexer;
use crate::metrics::start_metrics_responder;
use crate::searcher::start_searcher;
use crate::shardinit::initialize_shard;
use crate::state::WorkerState;
use crate::status::{StatusMonitor, StatusOptions};
use letarette_bus::Bus;
use letarette_core::{Config, Result};
use letarette_store::SqliteStore;

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub status: StatusOptions,
}

pub struct Worker {
    state: Arc<WorkerState>,
    monitor: StatusMonitor,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker. Returns once shard initialization is done and the
    /// indexer and searcher are running.
    pub async fn start(
        config: Config,
        bus: Arc<dyn Bus>,
        store: Arc<SqliteStore>,
        options: WorkerOptions,
    ) -> Result<Self> {
        let state = Arc::new(WorkerState::new(config, store, bus));
        info!(
            "Starting worker for shard {} of spaces {}",
            state.config.shard,
            state.config.index.spaces.join(", ")
        );

        let mut tasks = Vec::new();
        let (monitor, status_task) = StatusMonitor::start(state.clone(), options.status).await?;
        tasks.push(status_task);
        tasks.push(start_metrics_responder(state.clone()).await?);

        // Serve clones only once our own index is initialized, so that our
        // clone request cannot be routed back to ourselves.
        match initialize_shard(&state, &monitor).await {
            Ok(0) => {}
            Ok(count) => info!("Cloned {} documents", count),
            Err(e) => error!("Failed to clone index: {}, continuing normal startup", e),
        }

        if state.config.cloning_port != 0 {
            tasks.extend(start_cloner(state.clone()).await?);
        }

        if state.config.index.disable {
            info!("Indexing disabled");
        } else {
            tasks.extend(start_indexer(state.clone()).await?);
        }
        if state.config.search.disable {
            info!("Search disabled");
        } else {
            tasks.push(start_searcher(state.clone()).await?);
        }

        Ok(Self {
            state,
            monitor,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    pub fn monitor(&self) -> &StatusMonitor {
        &self.monitor
    }

    /// Stop all services and wait for them to finish.
    pub async fn shutdown(self) {
        info!("Worker shutting down");
        self.state.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Worker task failed: {}", e);
            }
        }
        if let Err(e) = self.state.bus.flush().await {
            error!("Failed to flush bus: {}", e);
        }
    }
}
