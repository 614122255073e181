//! Error types for Letarette.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("cannot overwrite active interest list")]
    ActiveInterestList,

    #[error("config does not match index state")]
    StemmerSettingsMismatch,

    #[error("Invalid shard: {0}")]
    InvalidShard(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("No responders on {0}")]
    NoResponders(String),

    #[error("Payload of {0} bytes exceeds bus limit")]
    MaxPayload(usize),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that are expected to clear up by retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Bus(_) | Error::NoResponders(_) | Error::Timeout(_) | Error::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
