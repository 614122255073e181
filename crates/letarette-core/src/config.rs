//! Worker configuration, read from `LETARETTE_*` environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sharding::Shard;

/// Environment variable prefix for worker settings.
pub const ENV_PREFIX: &str = "LETARETTE_";

/// Message bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub urls: Vec<String>,
    /// Root of all subjects, e.g. `leta` gives `leta.q`, `leta.status`.
    pub topic: String,
    /// Nkey seed file for authentication.
    pub seed_file: Option<PathBuf>,
    /// Extra root certificates (PEM files).
    pub root_cas: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
    pub cache_size_mb: u32,
}

/// Indexer timing and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub spaces: Vec<String>,
    /// Maximum interest list length requested from a master.
    pub chunk_size: u16,
    /// Maximum number of documents requested at once.
    pub max_outstanding: u16,
    pub max_interest_wait: Duration,
    pub max_document_wait: Duration,
    pub empty_cycle_wait: Duration,
    /// Request rounds before a missing document is given up on.
    pub max_attempts: u32,
    pub disable: bool,
}

/// Tokenizer settings. Must match the state the index was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemmerConfig {
    pub languages: Vec<String>,
    pub remove_diacritics: bool,
    pub token_characters: String,
    pub separators: String,
    /// Terms found in more than this share of documents become stopwords.
    pub stopword_cutoff: f64,
}

impl Default for StemmerConfig {
    fn default() -> Self {
        Self {
            languages: vec!["english".into()],
            remove_diacritics: true,
            token_characters: String::new(),
            separators: String::new(),
            stopword_cutoff: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellingConfig {
    /// Minimum document frequency for a term to be a spelling candidate.
    pub min_frequency: u32,
    /// Number of new candidate terms that triggers a spelling table rebuild.
    pub max_lag: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub timeout: Duration,
    pub cache_ttl: Duration,
    /// Maximum number of matches counted per query.
    pub cap: u32,
    pub snippet_start: String,
    pub snippet_end: String,
    pub disable: bool,
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub nats: NatsConfig,
    pub db: DbConfig,
    pub shard: Shard,
    pub index: IndexConfig,
    pub stemmer: StemmerConfig,
    pub spelling: SpellingConfig,
    pub search: SearchConfig,
    /// Host name advertised in clone stream URLs. Empty means the local host name.
    pub cloning_host: String,
    /// Clone service port. Zero disables the service.
    pub cloning_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                urls: vec!["nats://localhost:4222".into()],
                topic: "leta".into(),
                seed_file: None,
                root_cas: Vec::new(),
            },
            db: DbConfig {
                path: PathBuf::from("letarette.db"),
                cache_size_mb: 1024,
            },
            shard: Shard::default(),
            index: IndexConfig {
                spaces: vec!["docs".into()],
                chunk_size: 100,
                max_outstanding: 10,
                max_interest_wait: Duration::from_secs(5),
                max_document_wait: Duration::from_secs(1),
                empty_cycle_wait: Duration::from_millis(100),
                max_attempts: 5,
                disable: false,
            },
            stemmer: StemmerConfig::default(),
            spelling: SpellingConfig {
                min_frequency: 5,
                max_lag: 100,
            },
            search: SearchConfig {
                timeout: Duration::from_secs(5),
                cache_ttl: Duration::from_secs(10),
                cap: 25000,
                snippet_start: String::new(),
                snippet_end: String::new(),
                disable: false,
            },
            cloning_host: String::new(),
            cloning_port: 8001,
        }
    }
}

impl Config {
    /// Create configuration from the process environment and defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Keys are given
    /// with the `LETARETTE_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut cfg = Self::default();

        if let Some(urls) = env.list("NATS_URLS") {
            cfg.nats.urls = urls;
        }
        env.set_string("NATS_TOPIC", &mut cfg.nats.topic);
        cfg.nats.seed_file = env.string("NATS_SEEDFILE").map(PathBuf::from);
        if let Some(cas) = env.list("NATS_ROOTCAS") {
            cfg.nats.root_cas = cas.into_iter().map(PathBuf::from).collect();
        }

        if let Some(path) = env.string("DB_PATH") {
            cfg.db.path = PathBuf::from(path);
        }
        env.set_parsed("DB_CACHESIZEMB", &mut cfg.db.cache_size_mb)?;

        if let Some(shard) = env.string("SHARD") {
            cfg.shard = shard.parse()?;
        }

        if let Some(spaces) = env.list("INDEX_SPACES") {
            cfg.index.spaces = spaces;
        }
        env.set_parsed("INDEX_CHUNKSIZE", &mut cfg.index.chunk_size)?;
        env.set_parsed("INDEX_MAXOUTSTANDING", &mut cfg.index.max_outstanding)?;
        env.set_duration("INDEX_MAXINTERESTWAIT", &mut cfg.index.max_interest_wait)?;
        env.set_duration("INDEX_MAXDOCUMENTWAIT", &mut cfg.index.max_document_wait)?;
        env.set_duration("INDEX_EMPTYCYCLEWAIT", &mut cfg.index.empty_cycle_wait)?;
        env.set_parsed("INDEX_MAXATTEMPTS", &mut cfg.index.max_attempts)?;
        env.set_parsed("INDEX_DISABLE", &mut cfg.index.disable)?;

        if let Some(languages) = env.list("STEMMER_LANGUAGES") {
            cfg.stemmer.languages = languages;
        }
        env.set_parsed("STEMMER_REMOVEDIACRITICS", &mut cfg.stemmer.remove_diacritics)?;
        env.set_string("STEMMER_TOKENCHARACTERS", &mut cfg.stemmer.token_characters);
        env.set_string("STEMMER_SEPARATORS", &mut cfg.stemmer.separators);
        env.set_parsed("STEMMER_STOPWORDCUTOFF", &mut cfg.stemmer.stopword_cutoff)?;

        env.set_parsed("SPELLING_MINFREQUENCY", &mut cfg.spelling.min_frequency)?;
        env.set_parsed("SPELLING_MAXLAG", &mut cfg.spelling.max_lag)?;

        env.set_duration("SEARCH_TIMEOUT", &mut cfg.search.timeout)?;
        env.set_duration("SEARCH_CACHETTL", &mut cfg.search.cache_ttl)?;
        env.set_parsed("SEARCH_CAP", &mut cfg.search.cap)?;
        env.set_string("SEARCH_SNIPPETSTART", &mut cfg.search.snippet_start);
        env.set_string("SEARCH_SNIPPETEND", &mut cfg.search.snippet_end);
        env.set_parsed("SEARCH_DISABLE", &mut cfg.search.disable)?;

        env.set_string("CLONINGHOST", &mut cfg.cloning_host);
        env.set_parsed("CLONINGPORT", &mut cfg.cloning_port)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.index.spaces.is_empty() {
            return Err(Error::Config("No spaces defined".into()));
        }
        if self.index.spaces.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config("Space names must not be empty".into()));
        }
        let unique: HashSet<&String> = self.index.spaces.iter().collect();
        if unique.len() != self.index.spaces.len() {
            return Err(Error::Config("Space names must be unique".into()));
        }
        if self.index.chunk_size == 0 || self.index.max_outstanding == 0 {
            return Err(Error::Config(
                "Chunk size and max outstanding must be positive".into(),
            ));
        }
        if self.index.max_attempts == 0 {
            return Err(Error::Config("Max attempts must be positive".into()));
        }
        if self.index.empty_cycle_wait >= self.index.max_interest_wait
            || self.index.max_document_wait.is_zero()
        {
            return Err(Error::Config("Invalid index timing settings".into()));
        }
        if self.stemmer.languages.is_empty() {
            return Err(Error::Config("No stemmer languages defined".into()));
        }
        if !(self.stemmer.stopword_cutoff > 0.0 && self.stemmer.stopword_cutoff <= 1.0) {
            return Err(Error::Config("Stopword cutoff must be in (0, 1]".into()));
        }
        if self.search.cap == 0 {
            return Err(Error::Config("Search cap must be positive".into()));
        }
        Ok(())
    }

    /// Queue group shared by the search responders of one shard index.
    pub fn search_group(&self) -> String {
        self.shard.index.to_string()
    }

    /// Subject under the configured root topic.
    pub fn subject(&self, suffix: &str) -> String {
        format!("{}.{}", self.nats.topic, suffix)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, key))
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    fn set_string(&self, key: &str, target: &mut String) {
        if let Some(v) = self.string(key) {
            *target = v;
        }
    }

    fn set_parsed<T: std::str::FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        if let Some(v) = self.string(key) {
            *target = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid value for {}{}: {:?}", ENV_PREFIX, key, v)))?;
        }
        Ok(())
    }

    fn set_duration(&self, key: &str, target: &mut Duration) -> Result<()> {
        if let Some(v) = self.string(key) {
            *target = parse_duration(&v).ok_or_else(|| {
                Error::Config(format!("Invalid duration for {}{}: {:?}", ENV_PREFIX, key, v))
            })?;
        }
        Ok(())
    }
}

/// Parse durations like `250ms`, `5s`, `1m` or `2h`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let seconds = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}
