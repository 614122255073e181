//! Clone service: hands out single-use HTTP stream URLs on `<topic>.clone`
//! and streams the requested shard from the local index.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cloning::ShardCloner;
use crate::state::WorkerState;
use letarette_bus::BusExt;
use letarette_core::protocol::{CloneRequest, CloneStream};
use letarette_core::{Error, Result, Shard};
use letarette_store::SqliteStore;

const STREAM_TTL: Duration = Duration::from_secs(15 * 60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const STREAM_NAME_BYTES: usize = 48;
const CHUNK_SIZE: usize = 64 * 1024;

struct StreamEntry {
    started: Instant,
    target: Shard,
}

/// Provisioned clone streams, by URL path name.
#[derive(Clone)]
pub struct CloneRegistry {
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
    ttl: Duration,
}

impl CloneRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Register a stream for `target` and return its name.
    pub fn register(&self, target: Shard) -> String {
        let mut bytes = [0u8; STREAM_NAME_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let name = URL_SAFE_NO_PAD.encode(bytes);
        self.streams.lock().insert(
            name.clone(),
            StreamEntry {
                started: Instant::now(),
                target,
            },
        );
        name
    }

    /// Claim a stream. Each name can be used once.
    pub fn take(&self, name: &str) -> Option<Shard> {
        let entry = self.streams.lock().remove(name)?;
        (entry.started.elapsed() <= self.ttl).then_some(entry.target)
    }

    /// Drop expired streams. Returns the number removed.
    pub fn housekeep(&self) -> usize {
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|_, entry| entry.started.elapsed() <= self.ttl);
        before - streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct CloneService {
    pub registry: CloneRegistry,
    pub store: Arc<SqliteStore>,
    pub shutdown: CancellationToken,
}

pub fn router(service: CloneService) -> Router {
    Router::new()
        .route("/{name}", get(get_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn get_stream(State(service): State<CloneService>, Path(name): Path<String>) -> Response {
    let Some(target) = service.registry.take(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    info!("Streaming shard {} clone", target);

    let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>(16);
    let store = service.store.clone();
    let cancel = service.shutdown.clone();
    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter { tx: tx.clone() };
        match stream_shard(&store, target, writer, &cancel) {
            Ok(count) => info!("Streamed {} documents to shard {}", count, target),
            Err(e) => {
                warn!("Clone stream failed: {}", e);
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "application/gzip")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

fn stream_shard<W: Write>(store: &SqliteStore, target: Shard, writer: W, cancel: &CancellationToken) -> Result<usize> {
    let mut cloner = ShardCloner::start(store, target, BufWriter::with_capacity(CHUNK_SIZE, writer))?;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if cloner.step()? {
            break;
        }
    }
    cloner.finish()
}

/// Feeds written bytes into the response body channel.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "clone client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Start the HTTP listener, the `<topic>.clone` responder and registry
/// housekeeping.
pub async fn start_cloner(state: Arc<WorkerState>) -> Result<Vec<JoinHandle<()>>> {
    let port = state.config.cloning_port;
    let host = if state.config.cloning_host.is_empty() {
        hostname()
    } else {
        state.config.cloning_host.clone()
    };

    let service = CloneService {
        registry: CloneRegistry::new(STREAM_TTL),
        store: state.store.clone(),
        shutdown: state.shutdown.clone(),
    };

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Clone service listening on {}", addr);

    let server = {
        let app = router(service.clone());
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("Clone service stopped: {}", e);
            }
        })
    };

    let local_shard = state.config.shard;
    let mut requests = state
        .bus
        .queue_subscribe(&state.subject("clone"), &local_shard.to_string())
        .await?;
    let responder = {
        let state = state.clone();
        let registry = service.registry.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    msg = requests.next_message() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let req: CloneRequest = match msg.decode() {
                    Ok(req) => req,
                    Err(e) => {
                        warn!("Bad clone request: {}", e);
                        continue;
                    }
                };
                let source: Shard = match req.source_shard.parse() {
                    Ok(shard) => shard,
                    Err(e) => {
                        warn!("Bad clone request: {}", e);
                        continue;
                    }
                };
                if source != local_shard {
                    debug!("Ignoring clone request for shard {}", source);
                    continue;
                }
                let target: Shard = match req.target_shard.parse() {
                    Ok(shard) => shard,
                    Err(e) => {
                        warn!("Bad clone request: {}", e);
                        continue;
                    }
                };

                let name = registry.register(target);
                let reply = CloneStream {
                    url: format!("http://{}:{}/{}", host, port, name),
                };
                info!("Provisioned clone stream for shard {}", target);
                if let Err(e) = state.bus.reply_json(&msg, &reply).await {
                    warn!("Failed to answer clone request: {}", e);
                }
            }
        })
    };

    let housekeeping = {
        let registry = service.registry.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.housekeep();
                        if removed > 0 {
                            debug!("Removed {} expired clone streams", removed);
                        }
                    }
                }
            }
        })
    };

    Ok(vec![server, responder, housekeeping])
}
