//! Chunk storage: append-only per-stream chunk files plus sidecar
//! metadata, directory layout derived from labels, background retention
//! sweeping.
//!
//! This module only defines the shared [`LogEntry`] and [`ChunkMeta`]
//! types; the writer, reader and retention sweeper each live in their own
//! submodule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

pub mod reader;
pub mod retention;
pub mod writer;

pub use reader::Reader;
pub use retention::RetentionSweeper;
pub use writer::Writer;

static ENTRY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A single immutable observation, created by the ingest pipeline and
/// destroyed only when its containing chunk is swept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub line: String,
    pub labels: LabelSet,
}

impl LogEntry {
    /// Allocates a fresh, process-wide monotonically increasing id. The
    /// low bits come from a counter rather than the clock so two entries
    /// minted within the same millisecond still sort distinctly.
    pub fn next_id() -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let seq = ENTRY_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFFFF;
        (now_ms << 20) | seq
    }
}

/// The in-memory / on-disk descriptor of a chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMeta {
    pub id: String,
    pub labels: LabelSet,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub entry_count: u64,
}

impl ChunkMeta {
    /// Whether this chunk's time range intersects `[start, end]`.
    pub fn intersects(&self, start_ms: i64, end_ms: i64) -> bool {
        self.start_time_ms <= end_ms && self.end_time_ms >= start_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_are_monotonic() {
        let a = LogEntry::next_id();
        let b = LogEntry::next_id();
        assert!(b > a);
    }

    #[test]
    fn chunk_meta_intersection() {
        let meta = ChunkMeta {
            id: "chunk_1_1".to_string(),
            labels: LabelSet::new(),
            start_time_ms: 1000,
            end_time_ms: 2000,
            entry_count: 1,
        };
        assert!(meta.intersects(1500, 2500));
        assert!(meta.intersects(500, 1000));
        assert!(!meta.intersects(2001, 3000));
    }
}
