//! Letarette Store: SQLite FTS5 document index with interest lists,
//! spelling correction, stopwords and bulk loading.

pub mod bulk;
pub mod schema;
pub mod search;
pub mod sqlite;
pub mod synonyms;
pub mod tools;
pub mod types;

pub use bulk::{BulkLoader, StoredDocument};
pub use sqlite::{reset_migration, SqliteStore};
pub use tools::IndexOptimizer;
pub use types::*;
