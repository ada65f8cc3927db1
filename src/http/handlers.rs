//! Per-route handlers. Each returns a ready-to-send `Response<Body>` or
//! an `AppError` that the caller (`super::server::route`) renders as a
//! uniform `{"error": "..."}` body with the matching status code.

use std::collections::HashMap;
use std::convert::Infallible;

use bytes::Bytes;
use http::{Response, StatusCode};
use hyper::body::HttpBody;
use hyper::{Body, Request};
use log::warn;

use crate::error::AppError;
use crate::ingest::IngestRequest;
use crate::labels::LabelSet;
use crate::metrics::{render_prometheus_text, HealthReport};
use crate::query;
use crate::tail::{ControlMessage, SubscriberId, TailHub};
use crate::time::parse_rfc3339_ms;

use super::server::AppState;
use std::sync::Arc;

const DEFAULT_QUERY_LIMIT: i64 = 100;

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response<Body> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let query = match query {
        Some(q) => q,
        None => return params,
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        let key = percent_encoding::percent_decode_str(key)
            .decode_utf8_lossy()
            .into_owned();
        let value = percent_encoding::percent_decode_str(value)
            .decode_utf8_lossy()
            .into_owned();
        params.insert(key, value);
    }
    params
}

pub fn health(state: &AppState) -> Response<Body> {
    let report = HealthReport {
        status: "healthy",
        uptime: state.started_at.elapsed().as_secs(),
        ingestion_rate: state.rate_counter.lines_per_second(),
        storage_used: state.writer.storage_size(),
        chunks_count: state.writer.chunk_count(),
        tail_subscribers: state.tail_hub.subscriber_count(),
    };
    json_response(StatusCode::OK, &report)
}

pub fn metrics_text(state: &AppState) -> Response<Body> {
    let metrics = state.pipeline.metrics();
    let text = render_prometheus_text(
        metrics.lines.load(std::sync::atomic::Ordering::Relaxed),
        metrics.bytes.load(std::sync::atomic::Ordering::Relaxed),
        state.writer.chunk_count(),
        state.writer.storage_size(),
        state.started_at.elapsed().as_secs(),
        state.tail_hub.subscriber_count(),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(text))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub async fn ingest(state: &AppState, req: Request<Body>) -> Result<Response<Body>, AppError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| AppError::InvalidInput(err.to_string()))?;

    let request: IngestRequest = serde_json::from_slice(&bytes)?;

    let pipeline = Arc::clone(&state.pipeline);
    let accepted = tokio::task::spawn_blocking(move || pipeline.ingest(request))
        .await
        .map_err(|err| AppError::Fatal(format!("ingest task panicked: {}", err)))?;

    state.rate_counter.record(accepted);

    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "accepted": accepted }),
    ))
}

pub fn query(state: &AppState, req: &Request<Body>) -> Result<Response<Body>, AppError> {
    let params = parse_query_string(req.uri().query());

    let query_text = params.get("query").cloned().unwrap_or_default();

    let start_ms = match params.get("start") {
        Some(text) => parse_rfc3339_ms(text)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid start timestamp {:?}", text)))?,
        None => 0,
    };
    let end_ms = match params.get("end") {
        Some(text) => parse_rfc3339_ms(text)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid end timestamp {:?}", text)))?,
        None => crate::time::now_ms(),
    };
    let limit = match params.get("limit") {
        Some(text) => text
            .parse::<i64>()
            .map_err(|_| AppError::InvalidInput(format!("invalid limit {:?}", text)))?,
        None => DEFAULT_QUERY_LIMIT,
    };

    let result = query::execute(&query_text, start_ms, end_ms, limit, &state.index, &state.reader)?;
    Ok(json_response(StatusCode::OK, &result))
}

pub fn labels(state: &AppState) -> Response<Body> {
    json_response(StatusCode::OK, &state.index.get_all_labels())
}

pub fn label_values(state: &AppState, name: &str) -> Response<Body> {
    let name = percent_encoding::percent_decode_str(name)
        .decode_utf8_lossy()
        .into_owned();
    json_response(StatusCode::OK, &state.index.get_label_values(&name))
}

/// Drops the subscriber from the hub once the connection's body stream
/// is torn down, whichever end initiates the close.
struct TailGuard {
    id: SubscriberId,
    hub: Arc<TailHub>,
}

impl Drop for TailGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

/// Everything in the query string except `query` (reserved for a future
/// LogQL selector on this route) becomes an initial label filter.
fn initial_filter(params: &HashMap<String, String>) -> Result<LabelSet, AppError> {
    let mut filter = LabelSet::new();
    for (key, value) in params {
        if key == "query" {
            continue;
        }
        filter.insert(key.clone(), value.clone());
    }
    filter.validate()?;
    Ok(filter)
}

/// Reads `{"type":"filter","labels":{...}}` control frames off the
/// inbound request body, one NDJSON line at a time, applying each as a
/// filter replacement via `TailHub::update_filter`. Runs for the life of
/// the connection; ends when the body is exhausted or the peer hangs up.
async fn read_control_frames(mut body: Body, id: SubscriberId, hub: Arc<TailHub>) {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("live-tail subscriber {} request body error: {}", id, err);
                break;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(newline_pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline_pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            match serde_json::from_slice::<ControlMessage>(line) {
                Ok(ControlMessage::Filter { labels }) => hub.update_filter(id, labels),
                Err(err) => warn!(
                    "live-tail subscriber {} sent a malformed control message: {}",
                    id, err
                ),
            }
        }
    }
}

pub fn stream(state: &AppState, req: Request<Body>) -> Result<Response<Body>, AppError> {
    let params = parse_query_string(req.uri().query());
    let filter = initial_filter(&params)?;

    let (id, rx) = state.tail_hub.register(filter);
    let guard = TailGuard {
        id,
        hub: Arc::clone(&state.tail_hub),
    };

    tokio::spawn(read_control_frames(
        req.into_body(),
        id,
        Arc::clone(&state.tail_hub),
    ));

    let body_stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        match rx.recv().await {
            Some(message) => {
                let mut line = serde_json::to_string(&message).unwrap_or_default();
                line.push('\n');
                Some((Ok::<Bytes, Infallible>(Bytes::from(line)), (rx, guard)))
            }
            None => {
                warn!("live-tail subscriber {} channel closed", guard.id);
                None
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::wrap_stream(body_stream))
        .map_err(|err| AppError::Fatal(err.to_string()))
}
