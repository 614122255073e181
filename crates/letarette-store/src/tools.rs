//! Maintenance operations: statistics, integrity checks, rebuilds and
//! step-wise optimization of the full-text index.

use parking_lot::MutexGuard;
use rusqlite::{params, Connection};

use crate::sqlite::SqliteStore;
use crate::types::{IndexStats, SpaceStats, TermCount};
use letarette_core::{Error, Result};

const COMMON_TERMS: i64 = 15;

impl SqliteStore {
    /// Collect index statistics, partly from the FTS vocabulary.
    pub fn index_stats(&self) -> Result<IndexStats> {
        let mut spaces = Vec::new();
        for name in self.spaces()? {
            let state = self.interest_list_state(&name)?;
            spaces.push(SpaceStats { name, state });
        }
        let stemmer = self.stemmer_state()?.map(|(state, _)| state);

        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached("SELECT term, cnt FROM fts_vocab ORDER BY cnt DESC LIMIT ?1")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![COMMON_TERMS], |row| {
                Ok(TermCount {
                    term: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        let common_terms: Vec<TermCount> = rows
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        let terms: i64 = conn
            .query_row("SELECT COUNT(*) FROM fts_vocab", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        let docs: i64 = conn
            .query_row("SELECT COUNT(*) FROM docs", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(IndexStats {
            spaces,
            common_terms,
            terms,
            docs,
            stemmer,
        })
    }

    /// Run the FTS5 integrity check.
    pub fn check_index(&self) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute("INSERT INTO fts(fts) VALUES ('integrity-check')", [])
            .map_err(|e| Error::Database(format!("Index check failed: {}", e)))?;
        Ok(())
    }

    /// Rebuild the full-text index from the docs table.
    pub fn rebuild_index(&self) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute("INSERT INTO fts(fts) VALUES ('rebuild')", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Set the maximum page size for future index allocations.
    pub fn set_index_page_size(&self, page_size: u32) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO fts(fts, rank) VALUES ('pgsz', ?1)",
            params![page_size],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Begin a step-wise merge of index segments. The optimizer holds the
    /// writer connection; stopping before it is done is fine.
    pub fn start_optimize(&self, page_increment: u32) -> Result<IndexOptimizer<'_>> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO fts(fts, rank) VALUES ('merge', ?1)",
            params![-i64::from(page_increment)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(IndexOptimizer {
            conn,
            page_increment,
        })
    }
}

pub struct IndexOptimizer<'a> {
    conn: MutexGuard<'a, Connection>,
    page_increment: u32,
}

impl IndexOptimizer<'_> {
    fn total_changes(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT total_changes()", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Run one merge step. Returns true when there is nothing left to merge.
    pub fn step(&mut self) -> Result<bool> {
        let before = self.total_changes()?;
        self.conn
            .execute(
                "INSERT INTO fts(fts, rank) VALUES ('merge', ?1)",
                params![self.page_increment],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let after = self.total_changes()?;
        Ok(after - before < 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreOptions;
    use letarette_core::protocol::{from_nanos, Document};
    use tempfile::TempDir;

    fn loaded_store(docs: usize) -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("tools.db"), StoreOptions::default()).unwrap();
        let mut loader = store.start_bulk_load("docs").unwrap();
        for i in 0..docs {
            loader
                .load(&Document {
                    id: i.to_string(),
                    updated: from_nanos(1),
                    title: String::new(),
                    text: format!("common words and rare{}", i),
                    alive: true,
                })
                .unwrap();
        }
        loader.commit().unwrap();
        (store, dir)
    }

    #[test]
    fn test_index_stats() {
        let (store, _dir) = loaded_store(20);
        let stats = store.index_stats().unwrap();
        assert_eq!(stats.docs, 20);
        assert_eq!(stats.spaces.len(), 1);
        assert_eq!(stats.spaces[0].name, "docs");
        assert!(stats.common_terms.len() <= 15);
        assert_eq!(stats.common_terms[0].count, 20);
        // "common", "word", "and" plus one rare term per document
        assert_eq!(stats.terms, 23);
        assert_eq!(stats.stemmer.unwrap().languages, vec!["english"]);
    }

    #[test]
    fn test_check_rebuild_and_optimize() {
        let (store, _dir) = loaded_store(50);
        store.check_index().unwrap();
        store.rebuild_index().unwrap();
        store.check_index().unwrap();
        store.set_index_page_size(4000).unwrap();

        let mut optimizer = store.start_optimize(100).unwrap();
        let mut steps = 0;
        while !optimizer.step().unwrap() {
            steps += 1;
            assert!(steps < 1000);
        }
        drop(optimizer);
        store.check_index().unwrap();
    }
}
