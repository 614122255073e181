//! Schema migrations.
//!
//! Migrations are applied in order and tracked in `schema_migrations`.
//! The full-text table definition depends on the tokenizer settings, so
//! it is generated from the stemmer configuration.

use letarette_core::config::StemmerConfig;

/// Placeholder replaced by the generated FTS table definition.
pub const FTS_TABLE_PLACEHOLDER: &str = "{fts_table}";

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER NOT NULL,
    dirty INTEGER NOT NULL
);
"#;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        sql: r#"
CREATE TABLE IF NOT EXISTS spaces (
    spaceID INTEGER PRIMARY KEY,
    space TEXT NOT NULL UNIQUE,
    lastUpdatedAtNanos INTEGER NOT NULL DEFAULT 0,
    lastUpdatedDocID TEXT NOT NULL DEFAULT '',
    listCreatedAtNanos INTEGER NOT NULL DEFAULT 0,
    CHECK (lastUpdatedAtNanos <= listCreatedAtNanos)
);

CREATE TABLE IF NOT EXISTS interest (
    spaceID INTEGER NOT NULL REFERENCES spaces(spaceID),
    docID TEXT NOT NULL,
    state INTEGER NOT NULL,
    updatedNanos INTEGER NOT NULL DEFAULT 0,
    UNIQUE (spaceID, docID)
);

CREATE TABLE IF NOT EXISTS docs (
    id INTEGER PRIMARY KEY,
    spaceID INTEGER NOT NULL REFERENCES spaces(spaceID),
    docID TEXT NOT NULL,
    updatedNanos INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    txt TEXT NOT NULL,
    alive INTEGER NOT NULL DEFAULT 1,
    UNIQUE (spaceID, docID)
);

CREATE INDEX IF NOT EXISTS docs_spaceindex ON docs(spaceID);

{fts_table}

CREATE TRIGGER IF NOT EXISTS docs_ai AFTER INSERT ON docs BEGIN
    INSERT INTO fts(rowid, title, txt) VALUES (new.id, new.title, new.txt);
END;

CREATE TRIGGER IF NOT EXISTS docs_ad AFTER DELETE ON docs BEGIN
    INSERT INTO fts(fts, rowid, title, txt) VALUES ('delete', old.id, old.title, old.txt);
END;

CREATE TRIGGER IF NOT EXISTS docs_au AFTER UPDATE ON docs BEGIN
    INSERT INTO fts(fts, rowid, title, txt) VALUES ('delete', old.id, old.title, old.txt);
    INSERT INTO fts(rowid, title, txt) VALUES (new.id, new.title, new.txt);
END;
"#,
    },
    Migration {
        version: 2,
        name: "stemmerstate",
        sql: r#"
CREATE TABLE IF NOT EXISTS stemmerstate (
    languages TEXT NOT NULL,
    removeDiacritics INTEGER NOT NULL,
    tokenCharacters TEXT NOT NULL,
    separators TEXT NOT NULL,
    updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: 3,
        name: "meta",
        sql: r#"
CREATE TABLE IF NOT EXISTS meta (
    indexID TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 4,
        name: "synonyms",
        sql: r#"
CREATE TABLE IF NOT EXISTS synonyms (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS synonym_words (
    synonymId INTEGER NOT NULL REFERENCES synonyms(id) ON DELETE CASCADE,
    word TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS synonym_words_word ON synonym_words(word);
"#,
    },
    Migration {
        version: 5,
        name: "spelling",
        sql: r#"
CREATE TABLE IF NOT EXISTS speling (
    word TEXT PRIMARY KEY,
    frequency INTEGER NOT NULL,
    length INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS speling_length ON speling(length);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_vocab USING fts5vocab('fts', 'row');
"#,
    },
    Migration {
        version: 6,
        name: "stopwords",
        sql: r#"
CREATE TABLE IF NOT EXISTS stopwords (
    word TEXT PRIMARY KEY
);
"#,
    },
];

/// Highest known schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn quote(value: &str, quote: char) -> String {
    let doubled = format!("{}{}", quote, quote);
    format!("{}{}{}", quote, value.replace(quote, &doubled), quote)
}

/// FTS5 `tokenize` argument for the given stemmer settings.
pub fn tokenizer_spec(stemmer: &StemmerConfig) -> String {
    let mut parts = Vec::new();
    if stemmer
        .languages
        .iter()
        .any(|l| l.eq_ignore_ascii_case("english"))
    {
        parts.push("porter".to_string());
    }
    parts.push("unicode61".to_string());
    parts.push(format!(
        "remove_diacritics {}",
        if stemmer.remove_diacritics { 2 } else { 0 }
    ));
    if !stemmer.token_characters.is_empty() {
        parts.push(format!("tokenchars {}", quote(&stemmer.token_characters, '\'')));
    }
    if !stemmer.separators.is_empty() {
        parts.push(format!("separators {}", quote(&stemmer.separators, '\'')));
    }
    parts.join(" ")
}

/// `CREATE VIRTUAL TABLE` statement for the document index.
pub fn fts_table_sql(stemmer: &StemmerConfig) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS fts USING fts5(\n    \
         title, txt, content='docs', content_rowid='id',\n    \
         tokenize={}, prefix='2 3 4'\n);",
        quote(&tokenizer_spec(stemmer), '"')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(latest_version(), 6);
        assert!(MIGRATIONS[0].sql.contains(FTS_TABLE_PLACEHOLDER));
    }

    #[test]
    fn test_tokenizer_spec() {
        let default = StemmerConfig::default();
        assert_eq!(tokenizer_spec(&default), "porter unicode61 remove_diacritics 2");

        let custom = StemmerConfig {
            languages: vec!["swedish".into()],
            remove_diacritics: false,
            token_characters: "#'".into(),
            separators: String::new(),
            stopword_cutoff: 0.3,
        };
        assert_eq!(
            tokenizer_spec(&custom),
            "unicode61 remove_diacritics 0 tokenchars '#'''"
        );
        assert!(fts_table_sql(&custom).contains(r#"tokenize="unicode61 remove_diacritics 0 tokenchars '#'''""#));
    }
}
