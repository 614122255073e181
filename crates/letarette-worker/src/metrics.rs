//! Worker metrics, and the responder that publishes them on request.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::WorkerState;
use letarette_bus::BusExt;
use letarette_core::protocol::{Metrics as MetricsReply, MetricsRequest};
use letarette_core::{Error, Result};

/// Histogram windows, named after their length and resolution.
const WINDOWS: [(&str, Duration); 3] = [
    ("1m5s", Duration::from_secs(60)),
    ("5m10s", Duration::from_secs(300)),
    ("15m10s", Duration::from_secs(900)),
];

const MAX_SAMPLES: usize = 100_000;

#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.add(-1);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Sliding window histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        self.observe_at(Instant::now(), value);
    }

    fn observe_at(&self, at: Instant, value: f64) {
        let mut samples = self.samples.lock();
        samples.push_back((at, value));
        if samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    fn prune(samples: &mut VecDeque<(Instant, f64)>, now: Instant) {
        let longest = WINDOWS[WINDOWS.len() - 1].1;
        while let Some((at, _)) = samples.front() {
            if now.saturating_duration_since(*at) > longest {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Stats for samples observed within `window` before `now`.
    pub fn window(&self, window: Duration, now: Instant) -> WindowStats {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now);
        let mut values: Vec<f64> = samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, v)| *v)
            .collect();
        drop(samples);

        if values.is_empty() {
            return WindowStats::default();
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| {
            let rank = ((values.len() - 1) as f64 * p).round() as usize;
            values[rank]
        };
        WindowStats {
            count: values.len(),
            min: values[0],
            max: values[values.len() - 1],
            mean: values.iter().sum::<f64>() / values.len() as f64,
            p50: percentile(0.5),
            p90: percentile(0.9),
            p99: percentile(0.99),
        }
    }

    fn snapshot(&self, now: Instant) -> serde_json::Map<String, serde_json::Value> {
        WINDOWS
            .iter()
            .map(|(name, window)| {
                let stats = self.window(*window, now);
                (
                    name.to_string(),
                    serde_json::to_value(stats).unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub doc_requests: Counter,
    pub update_queue: Counter,
    pub pending_docs: Counter,
    pub served_docs: Counter,
    pub query_queue: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub reconnects: Counter,
    /// Seconds.
    pub search_duration: Histogram,
    /// Documents per request.
    pub document_request_size: Histogram,
}

impl Metrics {
    pub fn snapshot(&self) -> serde_json::Value {
        let now = Instant::now();
        serde_json::json!({
            "docRequests": self.doc_requests.get(),
            "updateQueue": self.update_queue.get(),
            "pendingDocs": self.pending_docs.get(),
            "servedDocs": self.served_docs.get(),
            "queryQueue": self.query_queue.get(),
            "cacheHits": self.cache_hits.get(),
            "cacheMisses": self.cache_misses.get(),
            "reconnects": self.reconnects.get(),
            "searchDuration": self.search_duration.snapshot(now),
            "documentRequestSize": self.document_request_size.snapshot(now),
        })
    }

    /// Snapshot as base64 of zlib-compressed JSON.
    pub fn packed(&self) -> Result<String> {
        let json = serde_json::to_vec(&self.snapshot())?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(STANDARD.encode(compressed))
    }
}

/// Decode a packed snapshot.
pub fn unpack(packed: &str) -> Result<serde_json::Value> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let compressed = STANDARD
        .decode(packed)
        .map_err(|e| Error::Protocol(format!("bad metrics encoding: {}", e)))?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Answer `<topic>.metrics.request` broadcasts on `<topic>.metrics.reply`.
pub async fn start_metrics_responder(state: Arc<WorkerState>) -> Result<JoinHandle<()>> {
    let mut requests = state.bus.subscribe(&state.subject("metrics.request")).await?;
    let reply_subject = state.subject("metrics.reply");

    Ok(tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                msg = requests.next_message() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let req: MetricsRequest = match msg.decode() {
                Ok(req) => req,
                Err(e) => {
                    warn!("Bad metrics request: {}", e);
                    continue;
                }
            };
            state.metrics.reconnects.set(state.bus.reconnects() as i64);

            let reply = match state.metrics.packed() {
                Ok(packed_json) => MetricsReply {
                    request_id: req.request_id,
                    index_id: state.index_id().to_string(),
                    updated: Utc::now(),
                    packed_json,
                },
                Err(e) => {
                    warn!("Failed to pack metrics: {}", e);
                    continue;
                }
            };
            debug!("Answering metrics request {}", reply.request_id);
            if let Err(e) = state.bus.publish_json(&reply_subject, &reply).await {
                warn!("Failed to publish metrics: {}", e);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        c.dec();
        assert_eq!(c.get(), 4);
        c.set(-2);
        assert_eq!(c.get(), -2);
    }

    #[test]
    fn test_histogram_windows() {
        let h = Histogram::default();
        let now = Instant::now();
        let Some(old) = now.checked_sub(Duration::from_secs(120)) else {
            return;
        };
        h.observe_at(old, 100.0);
        for v in 1..=10 {
            h.observe_at(now, f64::from(v));
        }

        let short = h.window(Duration::from_secs(60), now);
        assert_eq!(short.count, 10);
        assert_eq!(short.min, 1.0);
        assert_eq!(short.max, 10.0);
        assert_eq!(short.mean, 5.5);

        let long = h.window(Duration::from_secs(300), now);
        assert_eq!(long.count, 11);
        assert_eq!(long.max, 100.0);
    }

    #[test]
    fn test_packed_snapshot() {
        let m = Metrics::default();
        m.cache_hits.add(3);
        m.search_duration.observe(0.25);

        let value = unpack(&m.packed().unwrap()).unwrap();
        assert_eq!(value["cacheHits"], 3);
        assert_eq!(value["searchDuration"]["1m5s"]["count"], 1);
        assert_eq!(value["documentRequestSize"]["15m10s"]["count"], 0);
    }
}
