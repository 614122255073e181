//! Shard clone stream format.
//!
//! A clone stream is gzip-compressed bincode: a format version, then
//! `(space, document)` pairs until the end of the stream. An empty space
//! name means the same space as the previous document.

use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use letarette_core::protocol::{from_nanos, to_nanos, Document, DocumentId};
use letarette_core::{Error, Result, Shard};
use letarette_store::{BulkLoader, SqliteStore};

pub const CLONE_FORMAT_VERSION: u32 = 1;

/// Documents read from the index per cloning step.
pub const DOCS_PER_CLONE_STEP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloneDocument {
    id: DocumentId,
    updated_nanos: i64,
    title: String,
    text: String,
    alive: bool,
}

impl From<&Document> for CloneDocument {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            updated_nanos: to_nanos(&doc.updated),
            title: doc.title.clone(),
            text: doc.text.clone(),
            alive: doc.alive,
        }
    }
}

impl From<CloneDocument> for Document {
    fn from(doc: CloneDocument) -> Self {
        Self {
            id: doc.id,
            updated: from_nanos(doc.updated_nanos),
            title: doc.title,
            text: doc.text,
            alive: doc.alive,
        }
    }
}

fn encode_error(e: bincode::Error) -> Error {
    match *e {
        bincode::ErrorKind::Io(e) => Error::Io(e),
        other => Error::Protocol(format!("clone encoding failed: {}", other)),
    }
}

/// Writes the documents of one target shard as a clone stream.
pub struct ShardCloner<'a, W: Write> {
    encoder: GzEncoder<W>,
    store: &'a SqliteStore,
    target: Shard,
    after_rowid: i64,
    current_space: Option<String>,
    written: usize,
}

impl<'a, W: Write> ShardCloner<'a, W> {
    pub fn start(store: &'a SqliteStore, target: Shard, writer: W) -> Result<Self> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        bincode::serialize_into(&mut encoder, &CLONE_FORMAT_VERSION).map_err(encode_error)?;
        Ok(Self {
            encoder,
            store,
            target,
            after_rowid: 0,
            current_space: None,
            written: 0,
        })
    }

    /// Write the next batch. Returns true when all documents are written.
    pub fn step(&mut self) -> Result<bool> {
        let batch = self.store.document_batch(self.after_rowid, DOCS_PER_CLONE_STEP)?;
        let Some(last) = batch.last() else {
            return Ok(true);
        };
        self.after_rowid = last.rowid;

        for stored in &batch {
            if !self.target.owns(&stored.document.id) {
                continue;
            }
            let space = if self.current_space.as_deref() == Some(stored.space.as_str()) {
                ""
            } else {
                self.current_space = Some(stored.space.clone());
                stored.space.as_str()
            };
            bincode::serialize_into(&mut self.encoder, space).map_err(encode_error)?;
            bincode::serialize_into(&mut self.encoder, &CloneDocument::from(&stored.document))
                .map_err(encode_error)?;
            self.written += 1;
        }
        Ok(batch.len() < DOCS_PER_CLONE_STEP)
    }

    /// Flush the stream. Returns the number of documents written.
    pub fn finish(self) -> Result<usize> {
        let mut writer = self.encoder.finish()?;
        writer.flush()?;
        Ok(self.written)
    }
}

fn is_eof(e: &bincode::Error) -> bool {
    matches!(&**e, bincode::ErrorKind::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof)
}

/// Load a clone stream into the store, one transaction per space run.
/// A failed load rolls back the transaction in progress.
pub fn load_shard_clone<R: Read>(store: &SqliteStore, reader: R) -> Result<usize> {
    let mut reader = BufReader::new(GzDecoder::new(reader));

    let version: u32 = bincode::deserialize_from(&mut reader).map_err(encode_error)?;
    if version > CLONE_FORMAT_VERSION {
        return Err(Error::Protocol(format!(
            "incompatible clone format, version {}",
            version
        )));
    }

    let mut loader: Option<BulkLoader<'_>> = None;
    let mut loaded = 0;
    loop {
        let space: String = match bincode::deserialize_from(&mut reader) {
            Ok(space) => space,
            Err(e) if is_eof(&e) => break,
            Err(e) => return Err(encode_error(e)),
        };
        if !space.is_empty() {
            if let Some(current) = loader.take() {
                debug!("Committing {} bytes of cloned documents", current.loaded_bytes());
                current.commit()?;
            }
            loader = Some(store.start_bulk_load(&space)?);
        }
        let doc: CloneDocument = bincode::deserialize_from(&mut reader).map_err(encode_error)?;
        let Some(current) = loader.as_mut() else {
            return Err(Error::Protocol("unexpected clone format, missing space".into()));
        };
        current.load(&Document::from(doc))?;
        loaded += 1;
    }

    if let Some(current) = loader {
        current.commit()?;
    }
    Ok(loaded)
}

/// Fails reads once the token is cancelled.
struct CancellableRead<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("clone cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Fetch a clone stream over HTTP and load it.
pub async fn load_from_url(store: Arc<SqliteStore>, url: &str, cancel: CancellationToken) -> Result<usize> {
    info!("Loading clone from {}", url);
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Http(format!(
            "clone stream request failed: {}",
            response.status()
        )));
    }

    let stream = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
    let reader = CancellableRead {
        inner: SyncIoBridge::new(StreamReader::new(Box::pin(stream))),
        cancel: cancel.clone(),
    };
    let loaded = tokio::task::spawn_blocking(move || load_shard_clone(&store, reader))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    match loaded {
        Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letarette_store::StoreOptions;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, name: &str) -> SqliteStore {
        let options = StoreOptions {
            spaces: vec!["fruits".into(), "veggies".into()],
            ..Default::default()
        };
        SqliteStore::open(dir.path().join(name), options).unwrap()
    }

    fn load(store: &SqliteStore, space: &str, ids: impl Iterator<Item = usize>) {
        let mut loader = store.start_bulk_load(space).unwrap();
        for i in ids {
            loader
                .load(&Document {
                    id: i.to_string(),
                    updated: from_nanos(1_000 + i as i64),
                    title: format!("title {}", i),
                    text: format!("text {}", i),
                    alive: i % 7 != 0,
                })
                .unwrap();
        }
        loader.commit().unwrap();
    }

    fn clone_to_vec(store: &SqliteStore, target: Shard) -> (usize, Vec<u8>) {
        let mut buffer = Vec::new();
        let mut cloner = ShardCloner::start(store, target, &mut buffer).unwrap();
        while !cloner.step().unwrap() {}
        let written = cloner.finish().unwrap();
        (written, buffer)
    }

    #[test]
    fn test_clone_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = open_store(&dir, "source.db");
        load(&source, "fruits", 0..1500);
        load(&source, "veggies", 1500..1600);

        let (written, stream) = clone_to_vec(&source, Shard::default());
        assert_eq!(written, 1600);

        let target = open_store(&dir, "target.db");
        assert_eq!(load_shard_clone(&target, stream.as_slice()).unwrap(), 1600);
        assert_eq!(target.document_count().unwrap(), 1600);

        let doc = target.document("veggies", "1550").unwrap().unwrap();
        assert_eq!(doc.title, "title 1550");
        assert_eq!(doc.updated, from_nanos(2550));
        let dead = target.document("fruits", "14").unwrap().unwrap();
        assert!(!dead.alive);
    }

    #[test]
    fn test_clone_filters_by_target_shard() {
        let dir = TempDir::new().unwrap();
        let source = open_store(&dir, "source.db");
        load(&source, "fruits", 0..200);

        let shard = Shard::new(1, 2).unwrap();
        let (written, stream) = clone_to_vec(&source, shard);
        let expected = (0..200).filter(|i| shard.owns(&i.to_string())).count();
        assert_eq!(written, expected);

        let target = open_store(&dir, "target.db");
        load_shard_clone(&target, stream.as_slice()).unwrap();
        assert_eq!(target.document_count().unwrap(), expected as u64);
        for i in 0..200 {
            let id = i.to_string();
            assert_eq!(
                target.document("fruits", &id).unwrap().is_some(),
                shard.owns(&id)
            );
        }
    }

    #[test]
    fn test_newer_format_is_rejected() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        bincode::serialize_into(&mut encoder, &(CLONE_FORMAT_VERSION + 1)).unwrap();
        let stream = encoder.finish().unwrap();

        let dir = TempDir::new().unwrap();
        let target = open_store(&dir, "target.db");
        let err = load_shard_clone(&target, stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_truncated_stream_rolls_back() {
        let dir = TempDir::new().unwrap();
        let source = open_store(&dir, "source.db");
        load(&source, "fruits", 0..50);

        // Re-encode the stream without the last few bytes of the payload.
        let (_, stream) = clone_to_vec(&source, Shard::default());
        let mut raw = Vec::new();
        GzDecoder::new(stream.as_slice()).read_to_end(&mut raw).unwrap();
        raw.truncate(raw.len() - 3);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let broken = encoder.finish().unwrap();

        let target = open_store(&dir, "target.db");
        assert!(load_shard_clone(&target, broken.as_slice()).is_err());
        assert_eq!(target.document_count().unwrap(), 0);
    }
}
