//! Wire protocol between workers, document managers and search clients.
//!
//! Every bus message is the JSON encoding of one of the types below.
//! Timestamps travel as RFC 3339 date-times and are stored as nanoseconds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the wire protocol. Peers are compatible when major versions match.
pub const PROTOCOL_VERSION: Semver = Semver {
    major: 0,
    minor: 5,
    revision: 0,
};

/// Document ids are opaque strings: uuid, hash, number.
pub type DocumentId = String;

/// Nanoseconds since the epoch for a wire timestamp.
pub fn to_nanos(time: &DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Wire timestamp for nanoseconds since the epoch.
pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

pub fn epoch() -> DateTime<Utc> {
    from_nanos(0)
}

// ---------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------

/// Request for available updates, sent to `<topic>.index.request`.
///
/// The master returns up to `limit` references updated at or after
/// `start_time`, skipping `after_document` and everything before it
/// at the same timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexUpdateRequest {
    pub space: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub after_document: DocumentId,
    pub limit: u16,
}

/// One document at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub id: DocumentId,
    pub updated: DateTime<Utc>,
}

/// Reply to [`IndexUpdateRequest`], sorted ascending by `(updated, id)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexUpdate {
    pub space: String,
    #[serde(default)]
    pub updates: Vec<DocumentReference>,
}

/// A searchable item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    pub alive: bool,
}

/// Request for documents, sent to `<topic>.document.request`.
/// The answer is broadcast on `<topic>.document.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    pub space: String,
    pub wanted: Vec<DocumentId>,
}

/// Documents broadcast to all workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    pub space: String,
    #[serde(default)]
    pub documents: Vec<Document>,
}

// ---------------------------------------------------------------
// Searching
// ---------------------------------------------------------------

fn default_autocorrect() -> bool {
    true
}

/// Search request, sent to `<topic>.q`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub spaces: Vec<String>,
    pub query: String,
    /// Maximum number of hits in one page.
    pub page_limit: u16,
    /// Zero-based page number.
    #[serde(default)]
    pub page_offset: u16,
    /// Re-run spell-fixed queries automatically.
    #[serde(default = "default_autocorrect")]
    pub autocorrect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub space: String,
    pub id: DocumentId,
    pub snippet: String,
    pub rank: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(default)]
    pub hits: Vec<SearchHit>,
    /// The hit count reached the result cap; hits are only locally ranked.
    #[serde(default)]
    pub capped: bool,
    /// Spell-fixed version of a query that had no matches.
    #[serde(default)]
    pub respelt: String,
    #[serde(default)]
    pub respelt_distance: f32,
    #[serde(default)]
    pub total_hits: u32,
}

/// Search outcome. Higher codes win when shard responses are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SearchStatus {
    #[default]
    NoHit = 0,
    Partial = 1,
    Ok = 2,
    Error = 3,
}

impl From<SearchStatus> for u8 {
    fn from(status: SearchStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for SearchStatus {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        match code {
            0 => Ok(SearchStatus::NoHit),
            1 => Ok(SearchStatus::Partial),
            2 => Ok(SearchStatus::Ok),
            3 => Ok(SearchStatus::Error),
            other => Err(format!("unknown search status {}", other)),
        }
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SearchStatus::NoHit => "not found",
            SearchStatus::Partial => "partial result",
            SearchStatus::Ok => "found",
            SearchStatus::Error => "error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub result: SearchResult,
    /// Seconds spent answering.
    pub duration: f32,
    pub status: SearchStatus,
}

// ---------------------------------------------------------------
// Status
// ---------------------------------------------------------------

/// Worker health. Only one code applies at a time; higher codes override lower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IndexStatusCode {
    InSync = 72,
    #[default]
    StartingUp = 73,
    Syncing = 74,
    IncompleteShardgroup = 75,
    Incompatible = 76,
}

impl From<IndexStatusCode> for u8 {
    fn from(code: IndexStatusCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for IndexStatusCode {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        match code {
            72 => Ok(IndexStatusCode::InSync),
            73 => Ok(IndexStatusCode::StartingUp),
            74 => Ok(IndexStatusCode::Syncing),
            75 => Ok(IndexStatusCode::IncompleteShardgroup),
            76 => Ok(IndexStatusCode::Incompatible),
            other => Err(format!("unknown index status {}", other)),
        }
    }
}

impl fmt::Display for IndexStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IndexStatusCode::InSync => "in sync",
            IndexStatusCode::StartingUp => "starting up",
            IndexStatusCode::Syncing => "syncing",
            IndexStatusCode::IncompleteShardgroup => "incomplete shard group",
            IndexStatusCode::Incompatible => "incompatible protocol versions",
        };
        f.write_str(text)
    }
}

/// Regularly broadcast on `<topic>.status` by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    #[serde(rename = "indexID")]
    pub index_id: String,
    #[serde(default)]
    pub version: String,
    pub doc_count: u64,
    pub last_update: DateTime<Utc>,
    pub shardgroup_size: u16,
    /// Zero-based shard index.
    pub shardgroup: u16,
    pub status: IndexStatusCode,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Index@{}({}/{}): {} docs, last update: {}, status: {}",
            self.index_id,
            self.shardgroup + 1,
            self.shardgroup_size,
            self.doc_count,
            self.last_update,
            self.status
        )
    }
}

// ---------------------------------------------------------------
// Cloning
// ---------------------------------------------------------------

/// Sent to `<topic>.clone`, queue-grouped by source shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub source_shard: String,
    pub target_shard: String,
}

/// Reply to [`CloneRequest`]: where to fetch the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneStream {
    pub url: String,
}

// ---------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------

/// Broadcast on `<topic>.metrics.request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRequest {
    #[serde(rename = "requestID")]
    pub request_id: String,
}

/// Reply on `<topic>.metrics.reply`. `packed_json` is base64 of zlib-compressed JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "indexID")]
    pub index_id: String,
    pub updated: DateTime<Utc>,
    #[serde(rename = "packedJSON")]
    pub packed_json: String,
}

// ---------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Semver {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl Semver {
    /// Parse `major[.minor[.revision]]`.
    pub fn parse(version: &str) -> Option<Semver> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        let revision = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Semver {
            major,
            minor,
            revision,
        })
    }

    pub fn compatible_with(&self, other: &Semver) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_on_the_wire() {
        let response = SearchResponse {
            status: SearchStatus::Partial,
            ..Default::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], 1);
        assert!(json["result"]["totalHits"].is_number());

        let back: SearchResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, SearchStatus::Partial);
        assert!(serde_json::from_str::<SearchStatus>("9").is_err());
    }

    #[test]
    fn test_status_ordering() {
        assert!(SearchStatus::Ok > SearchStatus::NoHit);
        assert!(SearchStatus::Error > SearchStatus::Ok);
        assert!(IndexStatusCode::Syncing > IndexStatusCode::InSync);
        assert!(IndexStatusCode::IncompleteShardgroup > IndexStatusCode::Syncing);
        assert!(IndexStatusCode::Incompatible > IndexStatusCode::IncompleteShardgroup);
    }

    #[test]
    fn test_index_status_field_names() {
        let status = IndexStatus {
            index_id: "ABC".into(),
            version: PROTOCOL_VERSION.to_string(),
            doc_count: 3,
            last_update: epoch(),
            shardgroup_size: 2,
            shardgroup: 1,
            status: IndexStatusCode::InSync,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["indexID"], "ABC");
        assert_eq!(json["shardgroupSize"], 2);
        assert_eq!(json["version"], "0.5.0");
        assert_eq!(json["lastUpdate"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_search_request_defaults() {
        let req: SearchRequest =
            serde_json::from_str(r#"{"spaces":["docs"],"query":"cat","pageLimit":10}"#).unwrap();
        assert_eq!(req.page_offset, 0);
        assert!(req.autocorrect);
    }

    #[test]
    fn test_nanos_conversion() {
        let t = from_nanos(1_580_000_000_123_456_789);
        assert_eq!(to_nanos(&t), 1_580_000_000_123_456_789);
        assert_eq!(to_nanos(&epoch()), 0);
    }

    #[test]
    fn test_semver() {
        let v = Semver::parse("0.5.1").unwrap();
        assert!(v.compatible_with(&PROTOCOL_VERSION));
        assert!(!Semver::parse("1.0").unwrap().compatible_with(&PROTOCOL_VERSION));
        assert_eq!(Semver::parse("2").unwrap().to_string(), "2.0.0");
        assert!(Semver::parse("x.1").is_none());
        assert!(Semver::parse("1.2.3.4").is_none());
    }
}
