use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AppError;
use crate::labels::LabelSet;

use super::LogEntry;

/// Process-wide chunk id sequence. Guarantees the writer never reuses a
/// chunk id within a single process lifetime, even if two chunks are
/// created within the same wall-clock second.
static CHUNK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Creates, appends to, and closes chunk files plus their `.meta`
/// sidecars under a single base directory.
pub struct Writer {
    base_path: PathBuf,
}

impl Writer {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn stream_dir(&self, labels: &LabelSet) -> PathBuf {
        self.base_path.join(labels.path_segment())
    }

    fn generate_chunk_id() -> String {
        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sequence = CHUNK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("chunk_{}_{}", unix_seconds, sequence)
    }

    /// Writes every entry (in caller-supplied order) as one JSON object
    /// per line, then the `.meta` sidecar, then fsyncs both. Returns the
    /// chunk id and observed `[start, end]` time range. On any failure the
    /// incomplete `.log`/`.meta` pair is left on disk for the next
    /// retention sweep to collect; it is never reported to the index.
    pub fn write_chunk(
        &self,
        labels: &LabelSet,
        entries: &[LogEntry],
    ) -> Result<(String, i64, i64), AppError> {
        let dir = self.stream_dir(labels);
        fs::create_dir_all(&dir)?;

        let chunk_id = Self::generate_chunk_id();
        let log_path = dir.join(format!("{}.log", chunk_id));
        let meta_path = dir.join(format!("{}.meta", chunk_id));

        let mut start_time_ms = i64::MAX;
        let mut end_time_ms = i64::MIN;

        {
            let file = File::create(&log_path)?;
            let mut writer = BufWriter::new(file);
            for entry in entries {
                start_time_ms = start_time_ms.min(entry.timestamp_ms);
                end_time_ms = end_time_ms.max(entry.timestamp_ms);
                let line = serde_json::to_string(entry)?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if entries.is_empty() {
            start_time_ms = 0;
            end_time_ms = 0;
        }

        let meta = super::ChunkMeta {
            id: chunk_id.clone(),
            labels: labels.clone(),
            start_time_ms,
            end_time_ms,
            entry_count: entries.len() as u64,
        };

        let meta_json = serde_json::to_string(&meta)?;
        let meta_file = File::create(&meta_path)?;
        let mut meta_writer = BufWriter::new(meta_file);
        meta_writer.write_all(meta_json.as_bytes())?;
        meta_writer.flush()?;
        meta_writer.get_ref().sync_all()?;

        Ok((chunk_id, start_time_ms, end_time_ms))
    }

    /// Total bytes under the base path. Approximate under concurrent
    /// writes; monotone over ingestion + retention combined only modulo
    /// retention sweeps.
    pub fn storage_size(&self) -> u64 {
        walkdir::WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Number of `.log` files under the base path.
    pub fn chunk_count(&self) -> u64 {
        walkdir::WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry
                        .path()
                        .extension()
                        .map(|ext| ext == "log")
                        .unwrap_or(false)
            })
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelSet;

    fn entry(id: u64, ts: i64, line: &str, labels: &LabelSet) -> LogEntry {
        LogEntry {
            id,
            timestamp_ms: ts,
            line: line.to_string(),
            labels: labels.clone(),
        }
    }

    #[test]
    fn write_chunk_creates_log_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let labels =
            LabelSet::from_pairs(vec![("service".to_string(), "api".to_string())]);
        let entries = vec![
            entry(1, 1000, "hello", &labels),
            entry(2, 2000, "world", &labels),
        ];

        let (chunk_id, start, end) = writer.write_chunk(&labels, &entries).unwrap();
        assert_eq!(start, 1000);
        assert_eq!(end, 2000);

        let stream_dir = dir.path().join(labels.path_segment());
        assert!(stream_dir.join(format!("{}.log", chunk_id)).exists());
        assert!(stream_dir.join(format!("{}.meta", chunk_id)).exists());
        assert_eq!(writer.chunk_count(), 1);
    }

    #[test]
    fn chunk_ids_never_collide_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let labels =
            LabelSet::from_pairs(vec![("service".to_string(), "api".to_string())]);
        let entries = vec![entry(1, 1000, "hello", &labels)];

        let (id1, _, _) = writer.write_chunk(&labels, &entries).unwrap();
        let (id2, _, _) = writer.write_chunk(&labels, &entries).unwrap();
        assert_ne!(id1, id2);
    }
}
