//! SQLite-based document index with FTS5 full-text search.
//!
//! Writes go through a single writer connection; searches and status
//! queries use a separate read-only connection so they never wait for
//! an indexing transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use rust_stemmers::{Algorithm, Stemmer};
use tracing::{debug, info, warn};

use crate::schema::{
    fts_table_sql, latest_version, FTS_TABLE_PLACEHOLDER, MIGRATIONS, MIGRATIONS_TABLE_SQL,
};
use crate::types::*;
use letarette_core::config::StemmerConfig;
use letarette_core::protocol::{from_nanos, to_nanos, Document, DocumentReference};
use letarette_core::{Error, Result};

pub(crate) const UPSERT_DOCUMENT_SQL: &str = "INSERT INTO docs (spaceID, docID, updatedNanos, title, txt, alive) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
     ON CONFLICT (spaceID, docID) DO UPDATE SET \
     updatedNanos = excluded.updatedNanos, title = excluded.title, \
     txt = excluded.txt, alive = excluded.alive";

/// SQLite store holding spaces, documents and interest lists.
pub struct SqliteStore {
    pub(crate) reader: Mutex<Connection>,
    pub(crate) writer: Mutex<Connection>,
    pub(crate) options: StoreOptions,
    pub(crate) stemmers: Vec<Stemmer>,
    db_path: PathBuf,
    index_id: String,
}

impl SqliteStore {
    /// Open or create the index at `db_path`, refusing to start if the
    /// stored stemmer state differs from the configured one.
    pub fn open(db_path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let store = Self::open_unchecked(db_path, options)?;
        store.check_stemmer_state()?;
        Ok(store)
    }

    /// Open the index without checking the stemmer state. Used by tools
    /// that repair the state.
    pub fn open_unchecked(db_path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }

        let writer = Self::create_connection(&db_path, options.cache_size_mb)?;
        migrate(&writer, &options.stemmer)?;
        let index_id = Self::init_index_id(&writer)?;
        Self::init_spaces(&writer, &options.spaces)?;

        let reader = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        reader
            .busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Database(e.to_string()))?;
        reader
            .execute_batch(&format!(
                "PRAGMA cache_size = -{};",
                u64::from(options.cache_size_mb) * 1024
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        let stemmers = options
            .stemmer
            .languages
            .iter()
            .filter_map(|language| match algorithm_for(language) {
                Some(algorithm) => Some(Stemmer::create(algorithm)),
                None => {
                    warn!("No stemmer available for {:?}", language);
                    None
                }
            })
            .collect();

        let store = Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            options,
            stemmers,
            db_path,
            index_id,
        };

        info!(
            "Index {} opened: {} documents, path={}",
            store.index_id,
            store.document_count()?,
            store.db_path.display()
        );
        Ok(store)
    }

    fn create_connection(db_path: &Path, cache_size_mb: u32) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;
             PRAGMA synchronous = NORMAL;
             PRAGMA wal_autocheckpoint = 4000;
             PRAGMA cache_size = -{};",
            u64::from(cache_size_mb) * 1024
        ))
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_index_id(conn: &Connection) -> Result<String> {
        let existing: Option<String> = conn
            .query_row("SELECT indexID FROM meta LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        if let Some(id) = existing.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = format!("{:016X}{:016X}", rand::random::<u64>(), rand::random::<u64>());
        conn.execute("INSERT INTO meta (indexID) VALUES (?1)", params![id])
            .map_err(|e| Error::Database(e.to_string()))?;
        debug!("Created index id {}", id);
        Ok(id)
    }

    fn init_spaces(conn: &Connection, spaces: &[String]) -> Result<()> {
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO spaces (space, lastUpdatedAtNanos, listCreatedAtNanos) \
                 VALUES (?1, 0, 0) ON CONFLICT (space) DO NOTHING",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        for space in spaces {
            stmt.execute(params![space])
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        Ok(())
    }

    /// Random id identifying this index in status messages.
    pub fn index_id(&self) -> &str {
        &self.index_id
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Currently applied schema version and its dirty flag.
    pub fn schema_version(&self) -> Result<(u32, bool)> {
        let conn = self.reader.lock();
        Ok(read_version(&conn)?.unwrap_or((0, false)))
    }

    // ---------------------------------------------------------------
    // Spaces
    // ---------------------------------------------------------------

    pub(crate) fn space_id(conn: &Connection, space: &str) -> Result<i64> {
        conn.prepare_cached("SELECT spaceID FROM spaces WHERE space = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![space], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("no such space, {}", space)))
    }

    pub fn spaces(&self) -> Result<Vec<String>> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached("SELECT space FROM spaces ORDER BY spaceID")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Documents
    // ---------------------------------------------------------------

    /// Number of stored documents, dead ones included.
    pub fn document_count(&self) -> Result<u64> {
        let conn = self.reader.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM docs", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count as u64)
    }

    pub fn alive_document_count(&self) -> Result<u64> {
        let conn = self.reader.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM docs WHERE alive", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count as u64)
    }

    pub fn document(&self, space: &str, doc_id: &str) -> Result<Option<Document>> {
        let conn = self.reader.lock();
        let result = conn.prepare_cached(
            "SELECT docs.docID, docs.updatedNanos, docs.title, docs.txt, docs.alive \
             FROM docs JOIN spaces USING (spaceID) \
             WHERE spaces.space = ?1 AND docs.docID = ?2",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![space, doc_id], |row| {
            Ok(Document {
                id: row.get(0)?,
                updated: from_nanos(row.get(1)?),
                title: row.get(2)?,
                text: row.get(3)?,
                alive: row.get(4)?,
            })
        })
        .optional()
        .map_err(|e| Error::Database(e.to_string()));
        result
    }

    /// True if the document is stored with exactly the given timestamp.
    pub fn has_document(&self, space: &str, doc_id: &str, updated_nanos: i64) -> Result<bool> {
        let conn = self.reader.lock();
        let space_id = Self::space_id(&conn, space)?;
        let result = conn.prepare_cached(
            "SELECT EXISTS (SELECT 1 FROM docs \
             WHERE spaceID = ?1 AND docID = ?2 AND updatedNanos = ?3)",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![space_id, doc_id, updated_nanos], |row| row.get(0))
        .map_err(|e| Error::Database(e.to_string()));
        result
    }

    /// Store documents that are on the space's interest list and mark
    /// their entries served, in one transaction.
    ///
    /// A document is applied only if its timestamp is at least the one
    /// promised in the interest entry. Returns the ids that were applied.
    pub fn add_document_updates(&self, space: &str, docs: &[Document]) -> Result<Vec<String>> {
        let mut conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut applied = Vec::new();
        {
            let mut interest_stmt = tx
                .prepare_cached(
                    "SELECT updatedNanos FROM interest WHERE spaceID = ?1 AND docID = ?2",
                )
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut doc_stmt = tx
                .prepare_cached(UPSERT_DOCUMENT_SQL)
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut served_stmt = tx
                .prepare_cached("UPDATE interest SET state = ?1 WHERE spaceID = ?2 AND docID = ?3")
                .map_err(|e| Error::Database(e.to_string()))?;

            for doc in docs {
                let updated = to_nanos(&doc.updated);
                let promised: Option<i64> = interest_stmt
                    .query_row(params![space_id, doc.id], |row| row.get(0))
                    .optional()
                    .map_err(|e| Error::Database(e.to_string()))?;
                match promised {
                    Some(promised) if updated >= promised => {}
                    Some(_) => {
                        debug!("Ignoring outdated update of {} in {}", doc.id, space);
                        continue;
                    }
                    None => continue,
                }

                let (title, text) = if doc.alive {
                    (doc.title.as_str(), doc.text.as_str())
                } else {
                    ("", "")
                };
                let changed = doc_stmt
                    .execute(params![space_id, doc.id, updated, title, text, doc.alive])
                    .map_err(|e| Error::Database(format!("failed to update doc: {}", e)))?;
                if changed != 1 {
                    return Err(Error::Database(
                        "failed to update index, no rows affected".into(),
                    ));
                }
                served_stmt
                    .execute(params![InterestState::Served.code(), space_id, doc.id])
                    .map_err(|e| {
                        Error::Database(format!("failed to update interest list: {}", e))
                    })?;
                applied.push(doc.id.clone());
            }
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(applied)
    }

    // ---------------------------------------------------------------
    // Interest lists
    // ---------------------------------------------------------------

    /// Replace the space's interest list. Fails while any entry is unserved.
    pub fn set_interest_list(&self, space: &str, updates: &[DocumentReference]) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        let space_id = Self::space_id(&tx, space)?;

        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM interest WHERE spaceID = ?1 AND state <> ?2",
                params![space_id, InterestState::Served.code()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if active != 0 {
            return Err(Error::ActiveInterestList);
        }

        tx.execute("DELETE FROM interest WHERE spaceID = ?1", params![space_id])
            .map_err(|e| Error::Database(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO interest (spaceID, docID, state, updatedNanos) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (spaceID, docID) DO UPDATE SET \
                     updatedNanos = max(updatedNanos, excluded.updatedNanos)",
                )
                .map_err(|e| Error::Database(e.to_string()))?;
            for update in updates {
                stmt.execute(params![
                    space_id,
                    update.id,
                    InterestState::Pending.code(),
                    to_nanos(&update.updated)
                ])
                .map_err(|e| Error::Database(e.to_string()))?;
            }
        }

        let now = to_nanos(&chrono::Utc::now());
        tx.execute(
            "UPDATE spaces SET listCreatedAtNanos = max(?1, lastUpdatedAtNanos) WHERE spaceID = ?2",
            params![now, space_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))
    }

    /// Advance the index position to the highest served entry that was
    /// promised no later than the list creation time.
    pub fn commit_interest_list(&self, space: &str) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let position: Option<(i64, String)> = tx
            .query_row(
                "SELECT interest.updatedNanos, interest.docID \
                 FROM interest JOIN spaces USING (spaceID) \
                 WHERE spaces.space = ?1 AND interest.state = ?2 \
                 AND interest.updatedNanos <= spaces.listCreatedAtNanos \
                 ORDER BY interest.updatedNanos DESC, interest.docID DESC LIMIT 1",
                params![space, InterestState::Served.code()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let Some((updated, doc_id)) = position else {
            return Ok(());
        };

        let count = tx
            .execute(
                "UPDATE spaces SET lastUpdatedAtNanos = ?1, lastUpdatedDocID = ?2 WHERE space = ?3",
                params![updated, doc_id, space],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if count != 1 {
            return Err(Error::Database(format!(
                "failed to update index position for space {:?}",
                space
            )));
        }
        debug!("Index position of {} is now ({}, {})", space, updated, doc_id);

        tx.commit().map_err(|e| Error::Database(e.to_string()))
    }

    /// Move the index position forward without an interest list. Used when
    /// a fetched list held nothing for this shard.
    pub fn advance_index_position(&self, space: &str, updated_nanos: i64, doc_id: &str) -> Result<()> {
        let conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        conn.execute(
            "UPDATE spaces SET \
             listCreatedAtNanos = max(listCreatedAtNanos, ?1), \
             lastUpdatedAtNanos = ?1, lastUpdatedDocID = ?2 \
             WHERE spaceID = ?3 AND (?1 > lastUpdatedAtNanos \
             OR (?1 = lastUpdatedAtNanos AND ?2 > lastUpdatedDocID))",
            params![updated_nanos, doc_id, space_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    pub fn interest_list(&self, space: &str) -> Result<Vec<Interest>> {
        let conn = self.reader.lock();
        let space_id = Self::space_id(&conn, space)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT docID, state, updatedNanos FROM interest \
                 WHERE spaceID = ?1 ORDER BY updatedNanos, docID",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![space_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let (doc_id, state, updated_nanos) = row.map_err(|e| Error::Database(e.to_string()))?;
            let state = InterestState::from_code(state)
                .ok_or_else(|| Error::Database(format!("invalid interest state {}", state)))?;
            result.push(Interest {
                doc_id,
                state,
                updated_nanos,
            });
        }
        Ok(result)
    }

    pub fn interest_list_state(&self, space: &str) -> Result<InterestListState> {
        let conn = self.reader.lock();
        let result = conn.prepare_cached(
            "SELECT listCreatedAtNanos, lastUpdatedAtNanos, lastUpdatedDocID \
             FROM spaces WHERE space = ?1",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .query_row(params![space], |row| {
            Ok(InterestListState {
                created_at_nanos: row.get(0)?,
                last_updated_at_nanos: row.get(1)?,
                last_updated_doc_id: row.get(2)?,
            })
        })
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("no such space, {}", space)));
        result
    }

    /// Timestamp of the index position of a space.
    pub fn last_update_time(&self, space: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        Ok(self.interest_list_state(space)?.last_updated())
    }

    /// True if any space has interest list entries.
    pub fn has_interest(&self) -> Result<bool> {
        let conn = self.reader.lock();
        conn.query_row("SELECT EXISTS (SELECT 1 FROM interest)", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn clear_interest_list(&self, space: &str) -> Result<()> {
        let conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        conn.execute("DELETE FROM interest WHERE spaceID = ?1", params![space_id])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn move_interest_state(&self, space: &str, from: InterestState, to: InterestState) -> Result<usize> {
        let conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        conn.execute(
            "UPDATE interest SET state = ?1 WHERE state = ?2 AND spaceID = ?3",
            params![to.code(), from.code(), space_id],
        )
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Put requested entries back to pending. Returns the number of entries moved.
    pub fn reset_requested(&self, space: &str) -> Result<usize> {
        self.move_interest_state(space, InterestState::Requested, InterestState::Pending)
    }

    /// Give up on all requested entries by marking them served.
    pub fn fake_serve_requested(&self, space: &str) -> Result<usize> {
        self.move_interest_state(space, InterestState::Requested, InterestState::Served)
    }

    pub fn set_interest_state(&self, space: &str, doc_id: &str, state: InterestState) -> Result<()> {
        self.set_interest_states(space, &[doc_id.to_string()], state)
    }

    /// Set the state of several entries in one transaction.
    pub fn set_interest_states(&self, space: &str, doc_ids: &[String], state: InterestState) -> Result<()> {
        let mut conn = self.writer.lock();
        let space_id = Self::space_id(&conn, space)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare_cached("UPDATE interest SET state = ?1 WHERE spaceID = ?2 AND docID = ?3")
                .map_err(|e| Error::Database(e.to_string()))?;
            for doc_id in doc_ids {
                stmt.execute(params![state.code(), space_id, doc_id])
                    .map_err(|e| Error::Database(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| Error::Database(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Stemmer state
    // ---------------------------------------------------------------

    /// Stored tokenizer settings and when they were written.
    pub fn stemmer_state(&self) -> Result<Option<(StemmerState, String)>> {
        let conn = self.reader.lock();
        conn.query_row(
            "SELECT languages, removeDiacritics, tokenCharacters, separators, updated \
             FROM stemmerstate LIMIT 1",
            [],
            |row| {
                let languages: String = row.get(0)?;
                Ok((
                    StemmerState {
                        languages: languages
                            .split(',')
                            .filter(|l| !l.is_empty())
                            .map(String::from)
                            .collect(),
                        remove_diacritics: row.get(1)?,
                        token_characters: row.get(2)?,
                        separators: row.get(3)?,
                    },
                    row.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Record the configured settings if none are stored, otherwise
    /// fail with [`Error::StemmerSettingsMismatch`] if they differ.
    pub fn check_stemmer_state(&self) -> Result<()> {
        let wanted = StemmerState::from(&self.options.stemmer);
        match self.stemmer_state()? {
            None => {
                let conn = self.writer.lock();
                write_stemmer_state(&conn, &wanted)
            }
            Some((stored, updated)) if stored != wanted => {
                warn!(
                    "Stemmer config {:?} does not match index state {:?} (set {})",
                    wanted, stored, updated
                );
                Err(Error::StemmerSettingsMismatch)
            }
            Some(_) => Ok(()),
        }
    }

    /// Overwrite the stored stemmer state with the configured settings and
    /// rebuild the full-text index with the matching tokenizer.
    pub fn force_stemmer_state(&self) -> Result<()> {
        let wanted = StemmerState::from(&self.options.stemmer);
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        write_stemmer_state(&tx, &wanted)?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS fts;\n{}\nINSERT INTO fts(fts) VALUES ('rebuild');",
            fts_table_sql(&self.options.stemmer)
        ))
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        info!("Stemmer state forced to {:?}", wanted);
        Ok(())
    }
}

fn write_stemmer_state(conn: &Connection, state: &StemmerState) -> Result<()> {
    conn.execute("DELETE FROM stemmerstate", [])
        .map_err(|e| Error::Database(e.to_string()))?;
    conn.execute(
        "INSERT INTO stemmerstate (languages, removeDiacritics, tokenCharacters, separators, updated) \
         VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
        params![
            state.languages.join(","),
            state.remove_diacritics,
            state.token_characters,
            state.separators
        ],
    )
    .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

/// Snowball algorithm for a configured language name.
pub fn algorithm_for(language: &str) -> Option<Algorithm> {
    let algorithm = match language.to_ascii_lowercase().as_str() {
        "arabic" => Algorithm::Arabic,
        "danish" => Algorithm::Danish,
        "dutch" => Algorithm::Dutch,
        "english" => Algorithm::English,
        "finnish" => Algorithm::Finnish,
        "french" => Algorithm::French,
        "german" => Algorithm::German,
        "greek" => Algorithm::Greek,
        "hungarian" => Algorithm::Hungarian,
        "italian" => Algorithm::Italian,
        "norwegian" => Algorithm::Norwegian,
        "portuguese" => Algorithm::Portuguese,
        "romanian" => Algorithm::Romanian,
        "russian" => Algorithm::Russian,
        "spanish" => Algorithm::Spanish,
        "swedish" => Algorithm::Swedish,
        "tamil" => Algorithm::Tamil,
        "turkish" => Algorithm::Turkish,
        _ => return None,
    };
    Some(algorithm)
}

// ---------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------

fn read_version(conn: &Connection) -> Result<Option<(u32, bool)>> {
    conn.query_row(
        "SELECT version, dirty FROM schema_migrations LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| Error::Database(e.to_string()))
}

fn write_version(conn: &Connection, version: u32, dirty: bool) -> Result<()> {
    conn.execute_batch("DELETE FROM schema_migrations;")
        .map_err(|e| Error::Database(e.to_string()))?;
    conn.execute(
        "INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)",
        params![version, dirty],
    )
    .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

/// Apply all migrations newer than the stored schema version.
fn migrate(conn: &Connection, stemmer: &StemmerConfig) -> Result<()> {
    conn.execute_batch(MIGRATIONS_TABLE_SQL)
        .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;

    let (current, dirty) = read_version(conn)?.unwrap_or((0, false));
    if dirty {
        return Err(Error::Database(format!(
            "Database has a dirty migration at level {}",
            current
        )));
    }
    if current > latest_version() {
        return Err(Error::Database(format!(
            "Database schema version {} is newer than supported version {}",
            current,
            latest_version()
        )));
    }

    let pending: Vec<_> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(());
    }
    info!("Applying migrations");
    let fts_table = fts_table_sql(stemmer);
    for migration in pending {
        debug!("Migration {} ({})", migration.version, migration.name);
        write_version(conn, migration.version, true)?;
        let sql = migration.sql.replace(FTS_TABLE_PLACEHOLDER, &fts_table);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        tx.execute_batch(&sql).map_err(|e| {
            Error::Database(format!("Migration {} failed: {}", migration.version, e))
        })?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        write_version(conn, migration.version, false)?;
    }
    Ok(())
}

/// Force the stored schema version down to `version` and clear the dirty
/// flag. No migrations are run; this is for backing out of a failed one.
pub fn reset_migration(db_path: impl AsRef<Path>, version: u32) -> Result<()> {
    let conn = Connection::open(db_path.as_ref()).map_err(|e| Error::Database(e.to_string()))?;
    let (current, _) = read_version(&conn)?
        .ok_or_else(|| Error::Database("database has no migration state".into()))?;
    if version > current {
        return Err(Error::Database(format!(
            "cannot reset migration forward from {} to {}",
            current, version
        )));
    }
    write_version(&conn, version, false)?;
    info!("Migration version reset from {} to {}", current, version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db"), StoreOptions::default()).unwrap();
        (store, dir)
    }

    fn at(nanos: i64) -> DateTime<Utc> {
        from_nanos(nanos)
    }

    fn reference(id: &str, nanos: i64) -> DocumentReference {
        DocumentReference {
            id: id.into(),
            updated: at(nanos),
        }
    }

    fn doc(id: &str, nanos: i64, text: &str) -> Document {
        Document {
            id: id.into(),
            updated: at(nanos),
            title: format!("Title {}", id),
            text: text.into(),
            alive: true,
        }
    }

    #[test]
    fn test_open_creates_schema_and_spaces() {
        let (store, dir) = test_store();
        assert_eq!(store.schema_version().unwrap(), (latest_version(), false));
        assert_eq!(store.spaces().unwrap(), vec!["docs"]);
        assert_eq!(store.document_count().unwrap(), 0);
        let id = store.index_id().to_string();
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        drop(store);

        let reopened =
            SqliteStore::open(dir.path().join("test.db"), StoreOptions::default()).unwrap();
        assert_eq!(reopened.index_id(), id);
    }

    #[test]
    fn test_unknown_space() {
        let (store, _dir) = test_store();
        assert!(matches!(
            store.interest_list("nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_set_interest_list_rejects_active_list() {
        let (store, _dir) = test_store();
        store
            .set_interest_list("docs", &[reference("a", 10), reference("b", 20)])
            .unwrap();

        let err = store.set_interest_list("docs", &[reference("c", 30)]);
        assert!(matches!(err, Err(Error::ActiveInterestList)));

        store.set_interest_state("docs", "a", InterestState::Requested).unwrap();
        store.set_interest_state("docs", "b", InterestState::Served).unwrap();
        assert!(matches!(
            store.set_interest_list("docs", &[reference("c", 30)]),
            Err(Error::ActiveInterestList)
        ));

        store.set_interest_state("docs", "a", InterestState::Served).unwrap();
        store.set_interest_list("docs", &[reference("c", 30)]).unwrap();
        let list = store.interest_list("docs").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].doc_id, "c");
        assert_eq!(list[0].state, InterestState::Pending);
        assert_eq!(list[0].updated_nanos, 30);
    }

    #[test]
    fn test_commit_interest_list_takes_max_position() {
        let (store, _dir) = test_store();
        let list = vec![reference("b", 20), reference("a", 20), reference("c", 10)];
        store.set_interest_list("docs", &list).unwrap();

        let docs: Vec<Document> = list.iter().map(|r| doc(&r.id, to_nanos(&r.updated), "x")).collect();
        let applied = store.add_document_updates("docs", &docs).unwrap();
        assert_eq!(applied.len(), 3);
        assert!(store
            .interest_list("docs")
            .unwrap()
            .iter()
            .all(|i| i.state == InterestState::Served));

        store.commit_interest_list("docs").unwrap();
        let state = store.interest_list_state("docs").unwrap();
        assert_eq!(state.last_updated_at_nanos, 20);
        assert_eq!(state.last_updated_doc_id, "b");
        assert!(state.created_at_nanos >= 20);
    }

    #[test]
    fn test_commit_without_served_entries_is_noop() {
        let (store, _dir) = test_store();
        store.set_interest_list("docs", &[reference("a", 10)]).unwrap();
        store.commit_interest_list("docs").unwrap();
        let state = store.interest_list_state("docs").unwrap();
        assert_eq!(state.last_updated_at_nanos, 0);
        assert_eq!(state.last_updated_doc_id, "");
    }

    #[test]
    fn test_updates_need_interest() {
        let (store, _dir) = test_store();
        store.set_interest_list("docs", &[reference("a", 100)]).unwrap();

        let applied = store
            .add_document_updates("docs", &[doc("a", 50, "old"), doc("z", 100, "other")])
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(store.document_count().unwrap(), 0);

        let applied = store.add_document_updates("docs", &[doc("a", 100, "new")]).unwrap();
        assert_eq!(applied, vec!["a"]);
        let stored = store.document("docs", "a").unwrap().unwrap();
        assert_eq!(stored.text, "new");
        assert!(store.has_document("docs", "a", 100).unwrap());
        assert!(!store.has_document("docs", "a", 50).unwrap());
    }

    #[test]
    fn test_dead_documents_are_stored_empty() {
        let (store, _dir) = test_store();
        store.set_interest_list("docs", &[reference("a", 1)]).unwrap();
        let mut dead = doc("a", 1, "secret text");
        dead.alive = false;
        store.add_document_updates("docs", &[dead]).unwrap();

        let stored = store.document("docs", "a").unwrap().unwrap();
        assert!(!stored.alive);
        assert_eq!(stored.title, "");
        assert_eq!(stored.text, "");
        assert_eq!(store.alive_document_count().unwrap(), 0);
    }

    #[test]
    fn test_reapplying_updates_replaces_document() {
        let (store, _dir) = test_store();
        store.set_interest_list("docs", &[reference("a", 1)]).unwrap();
        store.add_document_updates("docs", &[doc("a", 1, "first")]).unwrap();
        store.add_document_updates("docs", &[doc("a", 2, "second")]).unwrap();
        assert_eq!(store.document_count().unwrap(), 1);
        assert_eq!(store.document("docs", "a").unwrap().unwrap().text, "second");
    }

    #[test]
    fn test_requested_entries_reset_and_fake_serve() {
        let (store, _dir) = test_store();
        store
            .set_interest_list("docs", &[reference("a", 1), reference("b", 2)])
            .unwrap();
        store
            .set_interest_states("docs", &["a".into(), "b".into()], InterestState::Requested)
            .unwrap();
        assert_eq!(store.reset_requested("docs").unwrap(), 2);
        assert!(store
            .interest_list("docs")
            .unwrap()
            .iter()
            .all(|i| i.state == InterestState::Pending));

        store.set_interest_state("docs", "b", InterestState::Requested).unwrap();
        assert_eq!(store.fake_serve_requested("docs").unwrap(), 1);
        let list = store.interest_list("docs").unwrap();
        assert_eq!(list[0].state, InterestState::Pending);
        assert_eq!(list[1].state, InterestState::Served);
    }

    #[test]
    fn test_advance_index_position_only_moves_forward() {
        let (store, _dir) = test_store();
        store.advance_index_position("docs", 100, "m").unwrap();
        store.advance_index_position("docs", 50, "z").unwrap();
        store.advance_index_position("docs", 100, "a").unwrap();
        let state = store.interest_list_state("docs").unwrap();
        assert_eq!(state.last_updated_at_nanos, 100);
        assert_eq!(state.last_updated_doc_id, "m");
        assert!(state.created_at_nanos >= 100);

        store.advance_index_position("docs", 100, "n").unwrap();
        assert_eq!(store.interest_list_state("docs").unwrap().last_updated_doc_id, "n");
    }

    #[test]
    fn test_clear_and_has_interest() {
        let (store, _dir) = test_store();
        assert!(!store.has_interest().unwrap());
        store.set_interest_list("docs", &[reference("a", 1)]).unwrap();
        assert!(store.has_interest().unwrap());
        store.clear_interest_list("docs").unwrap();
        assert!(!store.has_interest().unwrap());
    }

    #[test]
    fn test_stemmer_mismatch_and_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stem.db");
        drop(SqliteStore::open(&path, StoreOptions::default()).unwrap());

        let mut swedish = StoreOptions::default();
        swedish.stemmer.languages = vec!["swedish".into()];
        assert!(matches!(
            SqliteStore::open(&path, swedish.clone()),
            Err(Error::StemmerSettingsMismatch)
        ));

        let store = SqliteStore::open_unchecked(&path, swedish.clone()).unwrap();
        store.force_stemmer_state().unwrap();
        let (state, _) = store.stemmer_state().unwrap().unwrap();
        assert_eq!(state.languages, vec!["swedish"]);
        drop(store);

        SqliteStore::open(&path, swedish).unwrap();
    }

    #[test]
    fn test_reset_migration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mig.db");
        drop(SqliteStore::open(&path, StoreOptions::default()).unwrap());

        let err = reset_migration(&path, latest_version() + 1).unwrap_err();
        assert!(err.to_string().contains("cannot reset migration forward"));

        reset_migration(&path, latest_version() - 1).unwrap();
        let store = SqliteStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.schema_version().unwrap(), (latest_version(), false));
    }
}
