//! Letarette Client: search agent, cluster status monitor and the
//! document manager used by document masters.

pub mod agent;
pub mod docmanager;
pub mod monitor;

pub use agent::{merge_responses, AgentOptions, SearchAgent};
pub use docmanager::{DocumentManager, DocumentSource};
pub use monitor::Monitor;
