use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::AppError;
use crate::labels::LabelSet;

use super::{ChunkMeta, LogEntry};

/// Reads chunk files and their sidecars back out of a [`super::writer::Writer`]'s
/// base directory.
pub struct Reader {
    base_path: PathBuf,
}

impl Reader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn stream_dir(&self, labels: &LabelSet) -> PathBuf {
        self.base_path.join(labels.path_segment())
    }

    fn log_path(&self, labels: &LabelSet, chunk_id: &str) -> PathBuf {
        self.stream_dir(labels).join(format!("{}.log", chunk_id))
    }

    fn meta_path(&self, labels: &LabelSet, chunk_id: &str) -> PathBuf {
        self.stream_dir(labels).join(format!("{}.meta", chunk_id))
    }

    /// Parses every line as JSON, dropping (and warning about) any line
    /// that fails to parse rather than failing the whole read.
    pub fn read_chunk(&self, labels: &LabelSet, chunk_id: &str) -> Result<Vec<LogEntry>, AppError> {
        let path = self.log_path(labels, chunk_id);
        let file = File::open(&path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    "chunk {} line {}: malformed entry dropped: {}",
                    chunk_id,
                    lineno + 1,
                    err
                ),
            }
        }
        Ok(entries)
    }

    /// Like [`Reader::read_chunk`] but filters to `[start_ms, end_ms]`
    /// during the scan, returning the surviving entries plus the number
    /// of lines scanned (used for query statistics).
    pub fn read_chunk_filtered(
        &self,
        labels: &LabelSet,
        chunk_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(Vec<LogEntry>, u64), AppError> {
        let path = self.log_path(labels, chunk_id);
        let file = File::open(&path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut scanned = 0u64;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            scanned += 1;
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => {
                    if entry.timestamp_ms >= start_ms && entry.timestamp_ms <= end_ms {
                        entries.push(entry);
                    }
                }
                Err(err) => warn!(
                    "chunk {} line {}: malformed entry dropped: {}",
                    chunk_id,
                    lineno + 1,
                    err
                ),
            }
        }
        Ok((entries, scanned))
    }

    /// Enumerates the `.log` files under `labels`'s stream directory,
    /// returning their chunk ids (without extension).
    pub fn list_chunks(&self, labels: &LabelSet) -> Result<Vec<String>, AppError> {
        let dir = self.stream_dir(labels);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "log").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub fn get_chunk_meta(&self, labels: &LabelSet, chunk_id: &str) -> Result<ChunkMeta, AppError> {
        let path = self.meta_path(labels, chunk_id);
        let contents = std::fs::read_to_string(&path)?;
        let meta: ChunkMeta = serde_json::from_str(&contents)?;
        Ok(meta)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::writer::Writer;

    fn entry(id: u64, ts: i64, line: &str, labels: &LabelSet) -> LogEntry {
        LogEntry {
            id,
            timestamp_ms: ts,
            line: line.to_string(),
            labels: labels.clone(),
        }
    }

    #[test]
    fn read_chunk_round_trips_write() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let reader = Reader::new(dir.path());
        let labels = LabelSet::from_pairs(vec![("service".to_string(), "api".to_string())]);
        let entries = vec![
            entry(1, 1000, "hello", &labels),
            entry(2, 2000, "world", &labels),
        ];

        let (chunk_id, _, _) = writer.write_chunk(&labels, &entries).unwrap();
        let read_back = reader.read_chunk(&labels, &chunk_id).unwrap();
        assert_eq!(read_back, entries);
    }

    #[test]
    fn read_chunk_filtered_applies_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let reader = Reader::new(dir.path());
        let labels = LabelSet::from_pairs(vec![("service".to_string(), "api".to_string())]);
        let entries = vec![
            entry(1, 1000, "a", &labels),
            entry(2, 2000, "b", &labels),
            entry(3, 3000, "c", &labels),
        ];
        let (chunk_id, _, _) = writer.write_chunk(&labels, &entries).unwrap();

        let (filtered, scanned) = reader
            .read_chunk_filtered(&labels, &chunk_id, 1500, 2500)
            .unwrap();
        assert_eq!(scanned, 3);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].line, "b");
    }

    #[test]
    fn malformed_lines_are_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let labels = LabelSet::from_pairs(vec![("service".to_string(), "api".to_string())]);
        let stream_dir = dir.path().join(labels.path_segment());
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(
            stream_dir.join("chunk_1_1.log"),
            "not json\n{\"id\":1,\"timestamp_ms\":1,\"line\":\"ok\",\"labels\":{}}\n",
        )
        .unwrap();

        let reader = Reader::new(dir.path());
        let entries = reader.read_chunk(&labels, "chunk_1_1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line, "ok");
    }
}
