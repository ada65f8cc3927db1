//! Ingest pipeline: per-label-set buffering, size-triggered and periodic
//! flushing, and publishing newly ingested entries to the live-tail hub.
//!
//! The buffer map is sharded by the first byte of each stream's
//! fingerprint so that ingest into unrelated streams does not contend on
//! a single lock (see the "per-fingerprint buffer map with lock
//! granularity" redesign note). Each shard guards its own
//! `HashMap<fingerprint, Buffer>`; a buffer carries a `flushing` flag so a
//! given stream never has two flushes in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::chunk_store::writer::Writer;
use crate::chunk_store::LogEntry;
use crate::config::{Config, TimestampPolicy};
use crate::index::Index;
use crate::labels::LabelSet;
use crate::tail::TailHub;
use crate::time::{now_ms, parse_best_effort_ms, parse_rfc3339_ms};

const NUM_SHARDS: usize = 16;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub streams: Vec<StreamRequest>,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub labels: LabelSet,
    pub entries: Vec<EntryRequest>,
}

#[derive(Debug, Deserialize)]
pub struct EntryRequest {
    pub ts: String,
    pub line: String,
}

struct Buffer {
    labels: LabelSet,
    entries: Vec<LogEntry>,
    byte_size: usize,
    flushing: bool,
}

impl Buffer {
    fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            entries: Vec::new(),
            byte_size: 0,
            flushing: false,
        }
    }
}

type Shard = Mutex<HashMap<String, Buffer>>;

#[derive(Default)]
pub struct IngestMetrics {
    pub lines: AtomicU64,
    pub bytes: AtomicU64,
    /// Entries the flush worker failed to persist (the discrepancy
    /// counter required by §8's invariant 6).
    pub flush_failures: AtomicU64,
}

pub struct Pipeline {
    config: Config,
    writer: Arc<Writer>,
    index: Arc<Index>,
    tail_hub: Arc<TailHub>,
    shards: Vec<Shard>,
    metrics: IngestMetrics,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

fn shard_index(fingerprint: &str) -> usize {
    u8::from_str_radix(&fingerprint[0..2], 16).unwrap_or(0) as usize % NUM_SHARDS
}

impl Pipeline {
    pub fn new(config: Config, writer: Arc<Writer>, index: Arc<Index>, tail_hub: Arc<TailHub>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for _ in 0..NUM_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }

        Arc::new(Self {
            config,
            writer,
            index,
            tail_hub,
            shards,
            metrics: IngestMetrics::default(),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Launches the background flush timer. Calling `ingest` before
    /// `start` is allowed (buffers just accumulate until the first tick
    /// or a size trigger); calling it after `stop` is not.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let pipeline = Arc::clone(self);
        let interval = self.config.flush_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pipeline.flush_all();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });
    }

    /// Signals the flush timer to exit, then performs one final
    /// `flush_all`. `ingest` must not be called after this returns.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        // Give the background task a chance to observe the signal and
        // exit before we run the final flush, so we don't race it.
        tokio::task::yield_now().await;
        self.flush_all();
    }

    /// Ingests every stream in `request`, validating and buffering each
    /// independently: a stream that fails validation is logged and
    /// skipped, and subsequent streams in the same request still run.
    /// Returns the total number of entries accepted across all streams
    /// that passed validation.
    pub fn ingest(&self, request: IngestRequest) -> u64 {
        let mut accepted = 0u64;

        for stream in request.streams {
            if let Err(err) = self.validate_stream(&stream) {
                warn!("ingest: skipping stream: {}", err);
                continue;
            }

            accepted += self.ingest_stream(stream.labels, stream.entries);
        }

        accepted
    }

    fn validate_stream(&self, stream: &StreamRequest) -> Result<(), crate::error::AppError> {
        if stream.labels.is_empty() {
            return Err(crate::error::AppError::InvalidInput(
                "stream labels must not be empty".to_string(),
            ));
        }
        if stream.entries.is_empty() {
            return Err(crate::error::AppError::InvalidInput(
                "stream entries must not be empty".to_string(),
            ));
        }
        stream.labels.validate()
    }

    fn ingest_stream(&self, labels: LabelSet, entries: Vec<EntryRequest>) -> u64 {
        let fingerprint = labels.fingerprint();
        let shard = &self.shards[shard_index(&fingerprint)];
        let mut to_flush: Option<(LabelSet, Vec<LogEntry>)> = None;
        let mut accepted = 0u64;

        {
            let mut buffers = shard.lock().expect("ingest shard lock poisoned");
            let buffer = buffers
                .entry(fingerprint.clone())
                .or_insert_with(|| Buffer::new(labels.clone()));

            for entry_req in entries {
                let timestamp_ms = match self.resolve_timestamp(&entry_req.ts) {
                    Some(ms) => ms,
                    None => {
                        warn!("ingest: rejecting entry with unparseable timestamp {:?}", entry_req.ts);
                        continue;
                    }
                };
                let entry = LogEntry {
                    id: LogEntry::next_id(),
                    timestamp_ms,
                    line: entry_req.line,
                    labels: labels.clone(),
                };

                buffer.byte_size += entry.line.len();
                self.metrics.bytes.fetch_add(entry.line.len() as u64, Ordering::Relaxed);
                self.metrics.lines.fetch_add(1, Ordering::Relaxed);

                self.tail_hub.broadcast(&entry);
                buffer.entries.push(entry);
                accepted += 1;

                let over_count = buffer.entries.len() >= self.config.buffer_size;
                let over_bytes = buffer.byte_size >= self.config.chunk_size_bytes;
                if (over_count || over_bytes) && !buffer.flushing {
                    buffer.flushing = true;
                    let drained = std::mem::take(&mut buffer.entries);
                    buffer.byte_size = 0;
                    to_flush = Some((buffer.labels.clone(), drained));
                }
            }

            if to_flush.is_some() {
                if let Some(buffer) = buffers.get_mut(&fingerprint) {
                    buffer.flushing = false;
                }
            }
        }

        if let Some((labels, entries)) = to_flush {
            self.flush_buffer(&fingerprint, &labels, entries);
        }

        accepted
    }

    /// `None` means the entry must be dropped rather than assigned a
    /// timestamp (only possible under `TimestampPolicy::Reject`).
    fn resolve_timestamp(&self, ts: &str) -> Option<i64> {
        match self.config.timestamp_policy {
            TimestampPolicy::Reject => parse_rfc3339_ms(ts),
            TimestampPolicy::Now => Some(parse_rfc3339_ms(ts).unwrap_or_else(now_ms)),
            TimestampPolicy::BestEffort => Some(parse_best_effort_ms(ts).unwrap_or_else(now_ms)),
        }
    }

    /// Flushes every non-empty buffer across all shards. Used by the
    /// periodic timer and by `stop`'s final drain.
    pub fn flush_all(&self) {
        for shard in &self.shards {
            let drained: Vec<(String, LabelSet, Vec<LogEntry>)> = {
                let mut buffers = shard.lock().expect("ingest shard lock poisoned");
                let mut drained = Vec::new();
                for (fingerprint, buffer) in buffers.iter_mut() {
                    if buffer.entries.is_empty() || buffer.flushing {
                        continue;
                    }
                    buffer.flushing = true;
                    let entries = std::mem::take(&mut buffer.entries);
                    buffer.byte_size = 0;
                    drained.push((fingerprint.clone(), buffer.labels.clone(), entries));
                }
                drained
            };

            for (fingerprint, labels, entries) in drained {
                self.flush_buffer(&fingerprint, &labels, entries);
                if let Ok(mut buffers) = shard.lock() {
                    if let Some(buffer) = buffers.get_mut(&fingerprint) {
                        buffer.flushing = false;
                    }
                }
            }
        }
    }

    /// Writes `entries` to a new chunk and registers it with the index.
    /// On failure the entries are put back into the buffer (reset on
    /// success only) and the discrepancy counter is left untouched since
    /// the data is still in memory, not lost; a true loss (process
    /// killed with a non-empty buffer) is what the counter tracks.
    fn flush_buffer(&self, fingerprint: &str, labels: &LabelSet, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len() as u64;

        match self.writer.write_chunk(labels, &entries) {
            Ok((chunk_id, start_ms, end_ms)) => {
                self.index.add_chunk(chunk_id.clone(), labels.clone(), start_ms, end_ms, count);
                info!(
                    "flushed stream={} chunk={} entries={}",
                    labels, chunk_id, count
                );
            }
            Err(err) => {
                error!("flush failed for stream {} ({} entries): {}", labels, count, err);
                self.metrics.flush_failures.fetch_add(count, Ordering::Relaxed);
                let shard = &self.shards[shard_index(fingerprint)];
                if let Ok(mut buffers) = shard.lock() {
                    let buffer = buffers
                        .entry(fingerprint.to_string())
                        .or_insert_with(|| Buffer::new(labels.clone()));
                    for entry in entries.into_iter().rev() {
                        buffer.byte_size += entry.line.len();
                        buffer.entries.insert(0, entry);
                    }
                }
            }
        }
    }
}
