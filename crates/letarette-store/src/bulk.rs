//! Transactional bulk loading, and batch reads for streaming the index out.

use parking_lot::MutexGuard;
use rusqlite::{params, Connection};
use tracing::warn;

use crate::sqlite::{SqliteStore, UPSERT_DOCUMENT_SQL};
use letarette_core::protocol::{from_nanos, to_nanos, Document};
use letarette_core::{Error, Result};

/// Loads documents into one space inside a single transaction.
///
/// Holds the writer connection until committed or dropped. Dropping an
/// uncommitted loader rolls the transaction back.
pub struct BulkLoader<'a> {
    conn: MutexGuard<'a, Connection>,
    space_id: i64,
    loaded_bytes: u64,
    finished: bool,
}

/// A stored document with its space and row position.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub rowid: i64,
    pub space: String,
    pub document: Document,
}

impl SqliteStore {
    pub fn start_bulk_load(&self, space: &str) -> Result<BulkLoader<'_>> {
        let conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(BulkLoader {
            conn,
            space_id,
            loaded_bytes: 0,
            finished: false,
        })
    }

    /// Up to `limit` documents with row ids above `after_rowid`, in row order.
    pub fn document_batch(&self, after_rowid: i64, limit: usize) -> Result<Vec<StoredDocument>> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT docs.id, spaces.space, docs.docID, docs.updatedNanos, \
                 docs.title, docs.txt, docs.alive \
                 FROM docs JOIN spaces USING (spaceID) \
                 WHERE docs.id > ?1 ORDER BY docs.id LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![after_rowid, limit as i64], |row| {
                Ok(StoredDocument {
                    rowid: row.get(0)?,
                    space: row.get(1)?,
                    document: Document {
                        id: row.get(2)?,
                        updated: from_nanos(row.get(3)?),
                        title: row.get(4)?,
                        text: row.get(5)?,
                        alive: row.get(6)?,
                    },
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        let batch: Vec<StoredDocument> = rows
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(batch)
    }
}

impl BulkLoader<'_> {
    /// Add or replace one document.
    pub fn load(&mut self, doc: &Document) -> Result<()> {
        let (title, text) = if doc.alive {
            (doc.title.as_str(), doc.text.as_str())
        } else {
            ("", "")
        };
        self.loaded_bytes += (title.len() + text.len()) as u64;

        let changed = self
            .conn
            .prepare_cached(UPSERT_DOCUMENT_SQL)
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![
                self.space_id,
                doc.id,
                to_nanos(&doc.updated),
                title,
                text,
                doc.alive
            ])
            .map_err(|e| Error::Database(e.to_string()))?;
        if changed != 1 {
            return Err(Error::Database("unexpected number of rows changed".into()));
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Title and text bytes loaded so far.
    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes
    }
}

impl Drop for BulkLoader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Bulk load rollback failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreOptions;
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("bulk.db"), StoreOptions::default()).unwrap();
        (store, dir)
    }

    fn doc(i: usize) -> Document {
        Document {
            id: i.to_string(),
            updated: from_nanos(i as i64 * 1000),
            title: format!("Title {}", i),
            text: format!("text of document {}", i),
            alive: i % 7 != 0,
        }
    }

    #[test]
    fn test_bulk_load_commit() {
        let (store, _dir) = test_store();
        let mut loader = store.start_bulk_load("docs").unwrap();
        for i in 0..50 {
            loader.load(&doc(i)).unwrap();
        }
        assert!(loader.loaded_bytes() > 0);
        loader.commit().unwrap();
        assert_eq!(store.document_count().unwrap(), 50);

        let dead = store.document("docs", "7").unwrap().unwrap();
        assert!(!dead.alive);
        assert!(dead.text.is_empty());
    }

    #[test]
    fn test_bulk_load_rolls_back_on_drop() {
        let (store, _dir) = test_store();
        {
            let mut loader = store.start_bulk_load("docs").unwrap();
            loader.load(&doc(1)).unwrap();
        }
        assert_eq!(store.document_count().unwrap(), 0);

        let mut loader = store.start_bulk_load("docs").unwrap();
        loader.load(&doc(2)).unwrap();
        loader.rollback().unwrap();
        assert_eq!(store.document_count().unwrap(), 0);
    }

    #[test]
    fn test_bulk_load_unknown_space() {
        let (store, _dir) = test_store();
        assert!(store.start_bulk_load("nope").is_err());
        // The writer must still be usable.
        store.start_bulk_load("docs").unwrap().commit().unwrap();
    }

    #[test]
    fn test_document_batches_cover_all_rows() {
        let (store, _dir) = test_store();
        let mut loader = store.start_bulk_load("docs").unwrap();
        for i in 0..25 {
            loader.load(&doc(i)).unwrap();
        }
        loader.commit().unwrap();

        let mut after = 0;
        let mut seen = Vec::new();
        loop {
            let batch = store.document_batch(after, 10).unwrap();
            if batch.is_empty() {
                break;
            }
            after = batch.last().unwrap().rowid;
            seen.extend(batch.into_iter().map(|d| (d.space, d.document)));
        }
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().all(|(space, _)| space == "docs"));
        assert_eq!(seen[3].1, doc(3));
    }
}
