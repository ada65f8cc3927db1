use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::index::Index;

/// Periodically deletes chunk (and sidecar) files older than a retention
/// horizon, then removes directories that became empty as a result.
pub struct RetentionSweeper {
    base_path: PathBuf,
    horizon: Duration,
    index: std::sync::Arc<Index>,
}

impl RetentionSweeper {
    pub fn new(base_path: impl Into<PathBuf>, horizon: Duration, index: std::sync::Arc<Index>) -> Self {
        Self {
            base_path: base_path.into(),
            horizon,
            index,
        }
    }

    /// Runs one sweep pass, returning the number of files removed.
    pub fn sweep_once(&self) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(self.horizon)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let mut removed_chunk_ids = Vec::new();

        for entry in walkdir::WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // File vanished between the directory scan and stat: fine.
                Err(_) => continue,
            };
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }

            if let Some(stem) = chunk_id_of(entry.path()) {
                removed_chunk_ids.push(stem);
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    // Another sweep or process already removed it.
                }
                Err(err) => warn!("retention sweep: failed to remove {:?}: {}", entry.path(), err),
            }
        }

        for chunk_id in removed_chunk_ids {
            self.index.remove_chunk(&chunk_id);
        }

        remove_empty_dirs(&self.base_path);

        if removed > 0 {
            info!("retention sweep removed {} file(s)", removed);
        } else {
            debug!("retention sweep removed no files");
        }

        removed
    }

    /// Runs `sweep_once` every `interval` until `shutdown` fires.
    pub async fn run(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }
}

fn chunk_id_of(path: &Path) -> Option<String> {
    if path.extension().map(|e| e == "log").unwrap_or(false) {
        path.file_stem().and_then(|s| s.to_str()).map(String::from)
    } else {
        None
    }
}

/// Recursively removes directories under `root` (but never `root` itself)
/// that have become empty. Tolerates directories that vanish concurrently.
fn remove_empty_dirs(root: &Path) {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.path().to_path_buf())
        .collect();

    // Remove deepest directories first so a now-empty parent is also
    // caught in the same pass.
    dirs.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

    for dir in dirs {
        if let Ok(mut entries) = std::fs::read_dir(&dir) {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(&dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    #[test]
    fn sweep_removes_old_files_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("service=api");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let log_path = stream_dir.join("chunk_1_1.log");
        let meta_path = stream_dir.join("chunk_1_1.meta");
        std::fs::write(&log_path, "{}\n").unwrap();
        std::fs::write(&meta_path, "{}\n").unwrap();

        let old_time = FileTime::from_unix_time(0, 0);
        filetime::set_file_mtime(&log_path, old_time).unwrap();
        filetime::set_file_mtime(&meta_path, old_time).unwrap();

        let index = std::sync::Arc::new(Index::new());
        let sweeper = RetentionSweeper::new(dir.path(), Duration::from_secs(86400), index);
        let removed = sweeper.sweep_once();

        assert_eq!(removed, 2);
        assert!(!log_path.exists());
        assert!(!stream_dir.exists());
    }

    #[test]
    fn sweep_keeps_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("service=api");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let log_path = stream_dir.join("chunk_1_1.log");
        std::fs::write(&log_path, "{}\n").unwrap();

        let index = std::sync::Arc::new(Index::new());
        let sweeper = RetentionSweeper::new(dir.path(), Duration::from_secs(86400), index);
        let removed = sweeper.sweep_once();

        assert_eq!(removed, 0);
        assert!(log_path.exists());
    }
}
