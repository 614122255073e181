//! Letarette Core: wire protocol, query parsing, sharding and configuration.

pub mod config;
pub mod error;
pub mod protocol;
pub mod query;
pub mod sharding;

pub use config::Config;
pub use error::{Error, Result};
pub use query::Phrase;
pub use sharding::Shard;
