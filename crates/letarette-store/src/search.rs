//! Full-text search over the FTS5 index, with stopword filtering and
//! spelling correction.

use std::collections::HashSet;

use rusqlite::{params, params_from_iter, types::Value, OptionalExtension};
use tracing::debug;

use crate::sqlite::SqliteStore;
use letarette_core::protocol::{SearchHit, SearchResult};
use letarette_core::query::Phrase;
use letarette_core::{Error, Result};

/// Maximum token distance between included phrases in a strict query.
const NEAR_RANGE: u32 = 15;

/// Number of tokens in a result snippet.
const SNIPPET_TOKENS: u32 = 8;

/// Vocabulary needed before stopwords are derived from term frequencies.
const MIN_DOCS_FOR_STOPWORDS: i64 = 100;

const SEARCH_SQL: &str = r#"
WITH matches AS (
    SELECT fts.rowid AS id, fts.rank AS r
    FROM fts
    JOIN docs ON docs.id = fts.rowid
    JOIN spaces ON spaces.spaceID = docs.spaceID
    WHERE fts MATCH ?1 AND docs.alive AND spaces.space IN ({spaces})
    LIMIT ?2
),
stats AS (
    SELECT COUNT(*) AS cnt FROM matches
)
SELECT spaces.space, docs.docID, matches.r, stats.cnt, docs.id
FROM matches
JOIN docs ON docs.id = matches.id
JOIN spaces ON spaces.spaceID = docs.spaceID
CROSS JOIN stats
ORDER BY matches.r ASC
LIMIT ?3 OFFSET ?4
"#;

const SNIPPET_SQL: &str = "SELECT replace(snippet(fts, -1, ?1, ?2, '…', ?3), char(10), ' ') \
     FROM fts WHERE fts MATCH ?4 AND rowid = ?5";

fn phrase_expression(phrase: &Phrase) -> String {
    let mut expr = format!("\"{}\"", phrase.text.replace('"', "\"\""));
    if phrase.wildcard {
        expr.push('*');
    }
    expr
}

fn split_phrases(phrases: &[Phrase]) -> (Vec<String>, Vec<String>) {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for phrase in phrases {
        if phrase.exclude {
            excludes.push(phrase_expression(phrase));
        } else {
            includes.push(phrase_expression(phrase));
        }
    }
    (includes, excludes)
}

fn with_excludes(mut match_string: String, excludes: &[String]) -> String {
    if !excludes.is_empty() {
        match_string.push_str(&format!(" NOT ({})", excludes.join(" OR ")));
    }
    match_string
}

/// FTS5 match expression requiring all included phrases near each other.
/// `None` if nothing is included.
pub fn strict_match_string(phrases: &[Phrase]) -> Option<String> {
    let (includes, excludes) = split_phrases(phrases);
    let base = match includes.len() {
        0 => return None,
        1 => includes[0].clone(),
        _ => format!("NEAR({}, {})", includes.join(" "), NEAR_RANGE),
    };
    Some(with_excludes(base, &excludes))
}

/// FTS5 match expression requiring all included phrases anywhere in the document.
pub fn relaxed_match_string(phrases: &[Phrase]) -> Option<String> {
    let (includes, excludes) = split_phrases(phrases);
    let base = match includes.len() {
        0 => return None,
        1 => includes[0].clone(),
        _ => format!("({})", includes.join(" AND ")),
    };
    Some(with_excludes(base, &excludes))
}

impl SqliteStore {
    /// Search `spaces` for `phrases`.
    ///
    /// The strict form is tried first, then the relaxed form. If neither
    /// matches, misspelled terms are corrected; the corrected query is
    /// reported in `respelt` and re-run when `autocorrect` is set.
    pub fn search(
        &self,
        phrases: &[Phrase],
        spaces: &[String],
        page_limit: u16,
        page_offset: u16,
        autocorrect: bool,
    ) -> Result<SearchResult> {
        if phrases.is_empty() || spaces.is_empty() {
            return Ok(SearchResult::default());
        }

        let result = self.search_phrases(phrases, spaces, page_limit, page_offset)?;
        if result.total_hits != 0 {
            return Ok(result);
        }

        let Some((fixed, distance)) = self.fix_phrase_spelling(phrases)? else {
            return Ok(result);
        };
        let respelt = fixed
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Respelt query: {} ({})", respelt, distance);

        let mut result = if autocorrect {
            self.search_phrases(&fixed, spaces, page_limit, page_offset)?
        } else {
            result
        };
        result.respelt = respelt;
        result.respelt_distance = distance;
        Ok(result)
    }

    fn search_phrases(
        &self,
        phrases: &[Phrase],
        spaces: &[String],
        page_limit: u16,
        page_offset: u16,
    ) -> Result<SearchResult> {
        let mut filtered = self.stopword_filter(phrases)?;
        if filtered.iter().all(|p| p.exclude) {
            filtered = phrases.to_vec();
        }

        let Some(strict) = strict_match_string(&filtered) else {
            return Ok(SearchResult::default());
        };
        let result = self.execute_match(&strict, spaces, page_limit, page_offset)?;
        if result.total_hits != 0 {
            return Ok(result);
        }

        match relaxed_match_string(&filtered) {
            Some(relaxed) if relaxed != strict => {
                self.execute_match(&relaxed, spaces, page_limit, page_offset)
            }
            _ => Ok(result),
        }
    }

    /// Run one match expression, returning a page of hits ordered by rank.
    pub fn execute_match(
        &self,
        match_string: &str,
        spaces: &[String],
        page_limit: u16,
        page_offset: u16,
    ) -> Result<SearchResult> {
        let cap = self.options.result_cap;
        let placeholders: Vec<String> = (0..spaces.len()).map(|i| format!("?{}", i + 5)).collect();
        let sql = SEARCH_SQL.replace("{spaces}", &placeholders.join(", "));

        let mut args: Vec<Value> = vec![
            Value::Text(match_string.to_string()),
            Value::Integer(i64::from(cap) + 1),
            Value::Integer(i64::from(page_limit)),
            Value::Integer(i64::from(page_offset) * i64::from(page_limit)),
        ];
        args.extend(spaces.iter().map(|s| Value::Text(s.clone())));

        let conn = self.reader.lock();
        let rows: Vec<(String, String, f64, i64, i64)> = {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(|e| Error::Search(e.to_string()))?;
            let mapped = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(|e| Error::Search(e.to_string()))?;
            let collected: Vec<(String, String, f64, i64, i64)> = mapped
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Search(e.to_string()))?;
            collected
        };

        let mut result = SearchResult::default();
        if let Some((_, _, _, total, _)) = rows.first() {
            result.total_hits = *total as u32;
        }
        if result.total_hits > cap {
            result.total_hits = cap;
            result.capped = true;
        }

        let mut snippet_stmt = conn
            .prepare_cached(SNIPPET_SQL)
            .map_err(|e| Error::Search(e.to_string()))?;
        for (space, id, rank, _, rowid) in rows {
            let snippet: Option<String> = snippet_stmt
                .query_row(
                    params![
                        self.options.snippet_start,
                        self.options.snippet_end,
                        SNIPPET_TOKENS,
                        match_string,
                        rowid
                    ],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::Search(e.to_string()))?;
            result.hits.push(SearchHit {
                space,
                id,
                snippet: snippet.unwrap_or_default(),
                rank: rank as f32,
            });
        }
        Ok(result)
    }

    // ---------------------------------------------------------------
    // Spelling
    // ---------------------------------------------------------------

    /// Correct a single term. Returns `None` if the term is already in
    /// the index or no candidate is close enough.
    pub fn spell_fix_term(&self, term: &str) -> Result<Option<(String, f32)>> {
        let conn = self.reader.lock();
        let exists: bool = conn
            .prepare_cached("SELECT EXISTS (SELECT 1 FROM fts WHERE fts MATCH ?1)")
            .map_err(|e| Error::Search(e.to_string()))?
            .query_row(params![phrase_expression(&Phrase::new(term))], |row| row.get(0))
            .map_err(|e| Error::Search(e.to_string()))?;
        if exists {
            return Ok(None);
        }

        let wanted = term.to_lowercase();
        let length = wanted.chars().count();
        let max_distance = std::cmp::max(1, length / 3);

        let mut stmt = conn
            .prepare_cached("SELECT word, frequency FROM speling WHERE length BETWEEN ?1 AND ?2")
            .map_err(|e| Error::Search(e.to_string()))?;
        let candidates = stmt
            .query_map(
                params![
                    length.saturating_sub(max_distance) as i64,
                    (length + max_distance) as i64
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut best: Option<(String, usize, i64)> = None;
        for candidate in candidates {
            let (word, frequency) = candidate.map_err(|e| Error::Search(e.to_string()))?;
            let distance = strsim::levenshtein(&wanted, &word);
            if distance == 0 || distance > max_distance {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, best_distance, best_frequency)) => {
                    distance < *best_distance
                        || (distance == *best_distance && frequency > *best_frequency)
                }
            };
            if better {
                best = Some((word, distance, frequency));
            }
        }
        Ok(best.map(|(word, distance, _)| (word, distance as f32)))
    }

    /// Spell-fix every single-word, non-stopword included phrase.
    /// Returns the corrected list and the summed edit distance, or `None`
    /// if nothing changed.
    pub fn fix_phrase_spelling(&self, phrases: &[Phrase]) -> Result<Option<(Vec<Phrase>, f32)>> {
        let kept: HashSet<String> = self
            .stopword_filter(phrases)?
            .into_iter()
            .map(|p| p.text)
            .collect();

        let mut fixed = phrases.to_vec();
        let mut distance = 0.0;
        let mut changed = false;
        for phrase in fixed.iter_mut() {
            if phrase.exclude || phrase.is_multi_word() || !kept.contains(&phrase.text) {
                continue;
            }
            if let Some((word, d)) = self.spell_fix_term(&phrase.text)? {
                phrase.text = word;
                distance += d;
                changed = true;
            }
        }
        Ok(changed.then_some((fixed, distance)))
    }

    /// Number of frequent vocabulary terms missing from the spelling table.
    pub fn spelling_lag(&self, min_frequency: u32) -> Result<u64> {
        let conn = self.reader.lock();
        let lag: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM fts_vocab \
                 WHERE doc >= ?1 AND term NOT GLOB '*[0-9]*' \
                 AND term NOT IN (SELECT word FROM speling)",
                params![min_frequency],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(lag as u64)
    }

    /// Rebuild the spelling table from the index vocabulary.
    pub fn update_spelling(&self, min_frequency: u32) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        tx.execute("DELETE FROM speling", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        let words = tx
            .execute(
                "INSERT INTO speling (word, frequency, length) \
                 SELECT term, doc, length(term) FROM fts_vocab \
                 WHERE doc >= ?1 AND term NOT GLOB '*[0-9]*'",
                params![min_frequency],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        debug!("Spelling table rebuilt with {} words", words);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Stopwords
    // ---------------------------------------------------------------

    pub fn stopwords(&self) -> Result<HashSet<String>> {
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached("SELECT word FROM stopwords")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.collect::<std::result::Result<HashSet<String>, _>>()
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn is_stopword(&self, stopwords: &HashSet<String>, word: &str) -> bool {
        let word = word.to_lowercase();
        stopwords.contains(&word)
            || self
                .stemmers
                .iter()
                .any(|stemmer| stopwords.contains(stemmer.stem(&word).as_ref()))
    }

    /// Drop single-word phrases whose stem is a stopword.
    pub fn stopword_filter(&self, phrases: &[Phrase]) -> Result<Vec<Phrase>> {
        let stopwords = self.stopwords()?;
        if stopwords.is_empty() {
            return Ok(phrases.to_vec());
        }
        Ok(phrases
            .iter()
            .filter(|p| p.is_multi_word() || !self.is_stopword(&stopwords, &p.text))
            .cloned()
            .collect())
    }

    /// Recompute stopwords as the terms found in more than `cutoff` of the
    /// alive documents. Returns the number of stopwords.
    pub fn update_stopwords(&self, cutoff: f64) -> Result<usize> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        tx.execute("DELETE FROM stopwords", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        let alive: i64 = tx
            .query_row("SELECT COUNT(*) FROM docs WHERE alive", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        let mut count = 0;
        if alive >= MIN_DOCS_FOR_STOPWORDS {
            count = tx
                .execute(
                    "INSERT INTO stopwords (word) SELECT term FROM fts_vocab WHERE doc > ?1",
                    params![cutoff * alive as f64],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(count)
    }
}
