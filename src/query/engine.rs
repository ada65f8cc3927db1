//! Query execution: chunk selection, per-entry filtering, aggregation,
//! sort and limit.

use std::collections::HashMap;
use std::time::Instant;

use log::warn;
use serde::Serialize;

use crate::chunk_store::reader::Reader;
use crate::error::AppError;
use crate::index::Index;
use crate::labels::LabelSet;
use crate::time::format_timestamp_ms;

use super::parser::{self, AggFunc, ParsedQuery};

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub id: u64,
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub queried_chunks: u64,
    pub scanned_lines: u64,
    pub matched_lines: u64,
    #[serde(rename = "executionTime")]
    pub execution_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub bucket_start_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupValue {
    pub labels: LabelSet,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    pub scalar: Option<f64>,
    pub series: Option<Vec<SeriesPoint>>,
    pub groups: Option<Vec<GroupValue>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub logs: Vec<LogLine>,
    pub stats: QueryStats,
    pub aggregation: Option<AggregationResult>,
}

struct MatchedEntry {
    id: u64,
    timestamp_ms: i64,
    line: String,
    labels: LabelSet,
}

/// Parses and runs `query_text` over `[start_ms, end_ms]`, returning at
/// most `limit` log lines (non-positive `limit` means unbounded) unless
/// the query carries an aggregation, in which case `limit` is ignored.
pub fn execute(
    query_text: &str,
    start_ms: i64,
    end_ms: i64,
    limit: i64,
    index: &Index,
    reader: &Reader,
) -> Result<QueryResult, AppError> {
    let started = Instant::now();
    let parsed = parser::parse(query_text)?;

    let exact_labels = parsed.exact_match_labels();
    let chunk_ids = index.find_chunks(&exact_labels, start_ms, end_ms);
    let queried_chunks = chunk_ids.len() as u64;

    let mut scanned_lines = 0u64;
    let mut matched: Vec<MatchedEntry> = Vec::new();

    for chunk_id in &chunk_ids {
        let meta = match index.get_chunk_meta(chunk_id) {
            Some(meta) => meta,
            None => continue,
        };

        let (entries, scanned) =
            match reader.read_chunk_filtered(&meta.labels, chunk_id, start_ms, end_ms) {
                Ok(result) => result,
                Err(err) => {
                    warn!("query: skipping chunk {} after read error: {}", chunk_id, err);
                    continue;
                }
            };
        scanned_lines += scanned;

        for entry in entries {
            if !parsed.matches_labels(&entry.labels) {
                continue;
            }
            if !parsed.matches_line(&entry.line) {
                continue;
            }
            matched.push(MatchedEntry {
                id: entry.id,
                timestamp_ms: entry.timestamp_ms,
                line: entry.line,
                labels: entry.labels,
            });
        }
    }

    let matched_lines = matched.len() as u64;

    let aggregation = parsed
        .aggregation
        .as_ref()
        .map(|agg| compute_aggregation(agg, &matched, start_ms, end_ms));

    let logs = if aggregation.is_some() {
        Vec::new()
    } else {
        matched.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        let truncated: Vec<MatchedEntry> = if limit > 0 {
            matched.into_iter().take(limit as usize).collect()
        } else {
            matched
        };
        truncated.into_iter().map(to_log_line).collect()
    };

    let stats = QueryStats {
        queried_chunks,
        scanned_lines,
        matched_lines,
        execution_ms: started.elapsed().as_millis() as u64,
    };

    Ok(QueryResult {
        logs,
        stats,
        aggregation,
    })
}

fn to_log_line(entry: MatchedEntry) -> LogLine {
    let level = entry
        .labels
        .get("level")
        .map(|s| s.to_string())
        .unwrap_or_else(|| "info".to_string());
    LogLine {
        id: entry.id,
        timestamp: format_timestamp_ms(entry.timestamp_ms),
        level,
        message: entry.line,
        labels: entry.labels,
    }
}

fn metric_value(func: AggFunc, entries: &[&MatchedEntry], window_secs: f64) -> f64 {
    match func {
        AggFunc::CountOverTime | AggFunc::Sum | AggFunc::Avg | AggFunc::Min | AggFunc::Max => {
            entries.len() as f64
        }
        AggFunc::Rate => {
            if window_secs > 0.0 {
                entries.len() as f64 / window_secs
            } else {
                0.0
            }
        }
        AggFunc::BytesOverTime => entries.iter().map(|e| e.line.len() as f64).sum(),
        AggFunc::BytesRate => {
            let bytes: f64 = entries.iter().map(|e| e.line.len() as f64).sum();
            if window_secs > 0.0 {
                bytes / window_secs
            } else {
                0.0
            }
        }
    }
}

fn compute_aggregation(
    agg: &parser::Aggregation,
    matched: &[MatchedEntry],
    start_ms: i64,
    end_ms: i64,
) -> AggregationResult {
    let window_secs = ((end_ms - start_ms).max(0) as f64) / 1000.0;
    let all_refs: Vec<&MatchedEntry> = matched.iter().collect();
    let scalar = metric_value(agg.func, &all_refs, window_secs);

    if let Some(by_keys) = &agg.by {
        let mut groups: HashMap<Vec<(String, String)>, Vec<&MatchedEntry>> = HashMap::new();
        for entry in matched {
            let key: Vec<(String, String)> = by_keys
                .iter()
                .map(|k| (k.clone(), entry.labels.get(k).unwrap_or("").to_string()))
                .collect();
            groups.entry(key).or_default().push(entry);
        }

        let mut group_values: Vec<GroupValue> = groups
            .into_iter()
            .map(|(key, entries)| {
                let mut labels = LabelSet::new();
                for (k, v) in key {
                    labels.insert(k, v);
                }
                GroupValue {
                    value: metric_value(agg.func, &entries, window_secs),
                    labels,
                }
            })
            .collect();
        group_values.sort_by(|a, b| a.labels.cmp(&b.labels));

        return AggregationResult {
            scalar: Some(scalar),
            series: None,
            groups: Some(group_values),
        };
    }

    let step_ms = (agg.duration.as_millis() as i64).max(1);
    let mut series = Vec::new();
    let mut bucket_start = start_ms;
    while bucket_start < end_ms {
        let bucket_end = (bucket_start + step_ms).min(end_ms);
        let bucket_entries: Vec<&MatchedEntry> = matched
            .iter()
            .filter(|e| e.timestamp_ms >= bucket_start && e.timestamp_ms < bucket_end)
            .collect();
        series.push(SeriesPoint {
            bucket_start_ms: bucket_start,
            value: metric_value(agg.func, &bucket_entries, agg.duration.as_secs_f64()),
        });
        bucket_start += step_ms;
    }

    AggregationResult {
        scalar: Some(scalar),
        series: Some(series),
        groups: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::writer::Writer;
    use crate::chunk_store::LogEntry;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    fn setup() -> (tempfile::TempDir, Index, Reader) {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let reader = Reader::new(dir.path());
        let index = Index::new();

        let l1 = labels(&[("service", "api"), ("env", "prod")]);
        let entries = vec![LogEntry {
            id: 1,
            timestamp_ms: 1_705_315_800_000,
            line: "hello".to_string(),
            labels: l1.clone(),
        }];
        let (id, start, end) = writer.write_chunk(&l1, &entries).unwrap();
        index.add_chunk(id, l1, start, end, entries.len() as u64);

        (dir, index, reader)
    }

    #[test]
    fn basic_ingest_and_query_scenario() {
        let (_dir, index, reader) = setup();
        let result = execute(
            r#"{service="api"}"#,
            1_705_315_200_000,
            1_705_318_800_000,
            10,
            &index,
            &reader,
        )
        .unwrap();

        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].message, "hello");
        assert!(result.stats.queried_chunks >= 1);
    }

    #[test]
    fn line_filter_narrows_results() {
        let (_dir, index, reader) = setup();
        let matched = execute(
            r#"{service="api"} |= "hell""#,
            0,
            i64::MAX,
            10,
            &index,
            &reader,
        )
        .unwrap();
        assert_eq!(matched.logs.len(), 1);

        let unmatched = execute(
            r#"{service="api"} |= "nope""#,
            0,
            i64::MAX,
            10,
            &index,
            &reader,
        )
        .unwrap();
        assert_eq!(unmatched.logs.len(), 0);
    }

    #[test]
    fn invalid_query_is_surfaced() {
        let (_dir, index, reader) = setup();
        let result = execute("{service=", 0, i64::MAX, 10, &index, &reader);
        assert!(result.is_err());
    }

    #[test]
    fn non_positive_limit_means_unbounded() {
        let (_dir, index, reader) = setup();
        let result = execute(r#"{service="api"}"#, 0, i64::MAX, 0, &index, &reader).unwrap();
        assert_eq!(result.logs.len(), 1);
    }

    #[test]
    fn aggregation_produces_a_series() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(dir.path());
        let reader = Reader::new(dir.path());
        let index = Index::new();

        let l1 = labels(&[("service", "x")]);
        let base = 0i64;
        let entries: Vec<LogEntry> = (0..10)
            .map(|i| LogEntry {
                id: i,
                timestamp_ms: base + i as i64 * 30_000,
                line: "x".to_string(),
                labels: l1.clone(),
            })
            .collect();
        let (id, start, end) = writer.write_chunk(&l1, &entries).unwrap();
        index.add_chunk(id, l1, start, end, entries.len() as u64);

        let result = execute(
            r#"count_over_time({service="x"}[1m])"#,
            0,
            300_000,
            0,
            &index,
            &reader,
        )
        .unwrap();

        let agg = result.aggregation.unwrap();
        assert_eq!(agg.scalar, Some(10.0));
        let series = agg.series.unwrap();
        assert_eq!(series.len(), 5);
        for point in series {
            assert_eq!(point.value, 2.0);
        }
    }
}
