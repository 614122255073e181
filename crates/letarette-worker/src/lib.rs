//! Letarette worker: indexes its shard of the document spaces and answers
//! searches over it.

pub mod cache;
pub mod cloner;
pub mod cloning;
pub mod indexer;
pub mod metrics;
pub mod searcher;
pub mod shardinit;
pub mod state;
pub mod status;
pub mod worker;

pub use state::WorkerState;
pub use status::{StatusMonitor, StatusOptions};
pub use worker::{Worker, WorkerOptions};
