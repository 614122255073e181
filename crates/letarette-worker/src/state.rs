//! State shared by the worker tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::metrics::Metrics;
use letarette_bus::Bus;
use letarette_core::{Config, Error, Result};
use letarette_store::SqliteStore;

pub struct WorkerState {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub bus: Arc<dyn Bus>,
    pub cache: Cache,
    pub metrics: Arc<Metrics>,
    /// Cancelled when the worker shuts down.
    pub shutdown: CancellationToken,
}

impl WorkerState {
    pub fn new(config: Config, store: Arc<SqliteStore>, bus: Arc<dyn Bus>) -> Self {
        let shutdown = CancellationToken::new();
        let cache = Cache::start(config.search.cache_ttl, shutdown.clone());
        Self {
            config,
            store,
            bus,
            cache,
            metrics: Arc::new(Metrics::default()),
            shutdown,
        }
    }

    /// Subject under the configured root topic.
    pub fn subject(&self, suffix: &str) -> String {
        self.config.subject(suffix)
    }

    pub fn index_id(&self) -> &str {
        self.store.index_id()
    }

    /// Run a store operation on the blocking pool.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
