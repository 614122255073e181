//! Row types for spaces, interest lists and index state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use letarette_core::config::StemmerConfig;
use letarette_core::protocol::{from_nanos, DocumentId};

/// Progress of one interest list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterestState {
    Pending = 0,
    Requested = 1,
    Served = 2,
}

impl InterestState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(InterestState::Pending),
            1 => Some(InterestState::Requested),
            2 => Some(InterestState::Served),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// A document the worker has committed to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub doc_id: DocumentId,
    pub state: InterestState,
    /// Timestamp promised by the master, in nanoseconds.
    pub updated_nanos: i64,
}

/// Index position and interest list creation time of a space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestListState {
    pub created_at_nanos: i64,
    pub last_updated_at_nanos: i64,
    pub last_updated_doc_id: DocumentId,
}

impl InterestListState {
    pub fn created_at(&self) -> DateTime<Utc> {
        from_nanos(self.created_at_nanos)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        from_nanos(self.last_updated_at_nanos)
    }
}

/// Tokenizer settings as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemmerState {
    pub languages: Vec<String>,
    pub remove_diacritics: bool,
    pub token_characters: String,
    pub separators: String,
}

impl From<&StemmerConfig> for StemmerState {
    fn from(cfg: &StemmerConfig) -> Self {
        Self {
            languages: cfg.languages.clone(),
            remove_diacritics: cfg.remove_diacritics,
            token_characters: cfg.token_characters.clone(),
            separators: cfg.separators.clone(),
        }
    }
}

/// A named group of interchangeable words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synonym {
    pub description: String,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceStats {
    pub name: String,
    pub state: InterestListState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: i64,
}

/// Output of the `stats` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub spaces: Vec<SpaceStats>,
    pub common_terms: Vec<TermCount>,
    pub terms: i64,
    pub docs: i64,
    pub stemmer: Option<StemmerState>,
}

/// Settings the store needs beyond its path.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub cache_size_mb: u32,
    pub spaces: Vec<String>,
    pub stemmer: StemmerConfig,
    /// Maximum number of matches counted per query.
    pub result_cap: u32,
    pub snippet_start: String,
    pub snippet_end: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_size_mb: 64,
            spaces: vec!["docs".into()],
            stemmer: StemmerConfig::default(),
            result_cap: 25000,
            snippet_start: String::new(),
            snippet_end: String::new(),
        }
    }
}

impl From<&letarette_core::Config> for StoreOptions {
    fn from(cfg: &letarette_core::Config) -> Self {
        Self {
            cache_size_mb: cfg.db.cache_size_mb,
            spaces: cfg.index.spaces.clone(),
            stemmer: cfg.stemmer.clone(),
            result_cap: cfg.search.cap,
            snippet_start: cfg.search.snippet_start.clone(),
            snippet_end: cfg.search.snippet_end.clone(),
        }
    }
}
