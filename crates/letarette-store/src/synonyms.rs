//! Synonym groups. The whole set is replaced at once.

use rusqlite::params;

use crate::sqlite::SqliteStore;
use crate::types::Synonym;
use letarette_core::{Error, Result};

impl SqliteStore {
    /// Replace all synonym groups.
    pub fn set_synonyms(&self, synonyms: &[Synonym]) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute_batch("DELETE FROM synonym_words; DELETE FROM synonyms;")
            .map_err(|e| Error::Database(format!("failed to delete old synonym list: {}", e)))?;

        for synonym in synonyms {
            tx.execute(
                "INSERT INTO synonyms (description) VALUES (?1)",
                params![synonym.description],
            )
            .map_err(|e| Error::Database(format!("failed to insert new synonym: {}", e)))?;
            let id = tx.last_insert_rowid();
            for word in &synonym.words {
                tx.execute(
                    "INSERT INTO synonym_words (synonymId, word) VALUES (?1, ?2)",
                    params![id, word],
                )
                .map_err(|e| Error::Database(format!("failed to insert new word: {}", e)))?;
            }
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))
    }

    /// All synonym groups in insertion order.
    pub fn synonyms(&self) -> Result<Vec<Synonym>> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT synonyms.id, synonyms.description, synonym_words.word \
                 FROM synonyms LEFT JOIN synonym_words ON synonym_words.synonymId = synonyms.id \
                 ORDER BY synonyms.id, synonym_words.rowid",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut result: Vec<(i64, Synonym)> = Vec::new();
        for row in rows {
            let (id, description, word) = row.map_err(|e| Error::Database(e.to_string()))?;
            if result.last().map(|(last, _)| *last) != Some(id) {
                result.push((
                    id,
                    Synonym {
                        description,
                        words: Vec::new(),
                    },
                ));
            }
            if let (Some(word), Some((_, synonym))) = (word, result.last_mut()) {
                synonym.words.push(word);
            }
        }
        Ok(result.into_iter().map(|(_, s)| s).collect())
    }
}
