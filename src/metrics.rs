//! Prometheus text-format exposition and the rolling one-minute bucket
//! counter that backs the `/health` endpoint's ingestion rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

const RATE_BUCKET_SECS: u64 = 60;

/// A single fixed-width time bucket used to compute a trailing ingestion
/// rate without keeping a full history of individual timestamps.
struct RateBucket {
    started_at: Instant,
    count: AtomicU64,
}

/// Tracks lines ingested in the current and previous minute so `/health`
/// can report a rate without scanning the chunk store.
pub struct RateCounter {
    current: std::sync::Mutex<RateBucket>,
    previous_count: AtomicU64,
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            current: std::sync::Mutex::new(RateBucket {
                started_at: Instant::now(),
                count: AtomicU64::new(0),
            }),
            previous_count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, n: u64) {
        self.roll_if_needed();
        let bucket = self.current.lock().expect("rate counter lock poisoned");
        bucket.count.fetch_add(n, Ordering::Relaxed);
    }

    fn roll_if_needed(&self) {
        let mut bucket = self.current.lock().expect("rate counter lock poisoned");
        if bucket.started_at.elapsed().as_secs() >= RATE_BUCKET_SECS {
            let finished = bucket.count.swap(0, Ordering::Relaxed);
            self.previous_count.store(finished, Ordering::Relaxed);
            bucket.started_at = Instant::now();
        }
    }

    /// Lines per second averaged over the last fully-elapsed minute. Zero
    /// until at least one bucket has rolled over.
    pub fn lines_per_second(&self) -> f64 {
        self.previous_count.load(Ordering::Relaxed) as f64 / RATE_BUCKET_SECS as f64
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime: u64,
    #[serde(rename = "ingestionRate")]
    pub ingestion_rate: f64,
    #[serde(rename = "storageUsed")]
    pub storage_used: u64,
    #[serde(rename = "chunksCount")]
    pub chunks_count: u64,
    pub tail_subscribers: usize,
}

/// Renders the service's counters in Prometheus text exposition format
/// (the `# TYPE` / `name value` lines Prometheus's text parser expects;
/// no proc-macro registry, just the six gauges/counters this service
/// exposes).
pub fn render_prometheus_text(
    ingested_lines_total: u64,
    ingested_bytes_total: u64,
    chunks_total: u64,
    storage_bytes: u64,
    uptime_secs: u64,
    tail_subscribers: usize,
) -> String {
    let mut out = String::new();

    out.push_str("# HELP logloom_ingested_lines_total Total log lines accepted by ingest.\n");
    out.push_str("# TYPE logloom_ingested_lines_total counter\n");
    out.push_str(&format!("logloom_ingested_lines_total {}\n", ingested_lines_total));

    out.push_str("# HELP logloom_ingested_bytes_total Total log line bytes accepted by ingest.\n");
    out.push_str("# TYPE logloom_ingested_bytes_total counter\n");
    out.push_str(&format!("logloom_ingested_bytes_total {}\n", ingested_bytes_total));

    out.push_str("# HELP logloom_chunks_total Number of chunk files currently on disk.\n");
    out.push_str("# TYPE logloom_chunks_total gauge\n");
    out.push_str(&format!("logloom_chunks_total {}\n", chunks_total));

    out.push_str("# HELP logloom_storage_bytes Total bytes occupied by chunk files.\n");
    out.push_str("# TYPE logloom_storage_bytes gauge\n");
    out.push_str(&format!("logloom_storage_bytes {}\n", storage_bytes));

    out.push_str("# HELP logloom_uptime_seconds Seconds since process start.\n");
    out.push_str("# TYPE logloom_uptime_seconds counter\n");
    out.push_str(&format!("logloom_uptime_seconds {}\n", uptime_secs));

    out.push_str("# HELP logloom_tail_subscribers Currently connected live-tail subscribers.\n");
    out.push_str("# TYPE logloom_tail_subscribers gauge\n");
    out.push_str(&format!("logloom_tail_subscribers {}\n", tail_subscribers));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_starts_at_zero() {
        let counter = RateCounter::new();
        assert_eq!(counter.lines_per_second(), 0.0);
        counter.record(120);
        // Still zero: the current bucket hasn't rolled over yet.
        assert_eq!(counter.lines_per_second(), 0.0);
    }

    #[test]
    fn prometheus_text_includes_all_six_series() {
        let text = render_prometheus_text(10, 200, 3, 4096, 60, 2);
        assert!(text.contains("logloom_ingested_lines_total 10"));
        assert!(text.contains("logloom_ingested_bytes_total 200"));
        assert!(text.contains("logloom_chunks_total 3"));
        assert!(text.contains("logloom_storage_bytes 4096"));
        assert!(text.contains("logloom_uptime_seconds 60"));
        assert!(text.contains("logloom_tail_subscribers 2"));
    }
}
