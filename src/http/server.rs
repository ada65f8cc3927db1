//! Process-wide shared state and the top-level `hyper` service: CORS,
//! API-key enforcement, and dispatch to `super::handlers`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use http::{HeaderValue, Method, StatusCode};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::{error, info};
use tokio::sync::broadcast;

use crate::chunk_store::reader::Reader;
use crate::chunk_store::writer::Writer;
use crate::config::Config;
use crate::error::AppError;
use crate::index::Index;
use crate::ingest::Pipeline;
use crate::metrics::RateCounter;
use crate::tail::TailHub;

use super::handlers;

pub struct AppState {
    pub config: Config,
    pub index: Arc<Index>,
    pub reader: Arc<Reader>,
    pub writer: Arc<Writer>,
    pub pipeline: Arc<Pipeline>,
    pub tail_hub: Arc<TailHub>,
    pub rate_counter: RateCounter,
    pub started_at: Instant,
}

const CORS_METHODS: &str = "GET, POST, PATCH, DELETE, OPTIONS";
const CORS_HEADERS: &str = "Content-Type, X-API-Key, Authorization";

fn apply_cors(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(CORS_HEADERS),
    );
}

fn error_response(err: &AppError) -> Response<Body> {
    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    Response::builder()
        .status(err.status_code())
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("{\"error\":\"internal error\"}")))
}

fn unauthorized() -> Response<Body> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("content-type", "application/json")
        .body(Body::from("{\"error\":\"missing or invalid X-API-Key\"}"))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

/// The live-tail upgrade handshake is the one request exempt from the
/// API-key check (browsers cannot attach custom headers to the transport
/// this service uses for `/stream`).
fn requires_auth(path: &str) -> bool {
    path != "/stream"
}

fn check_auth(state: &AppState, req: &Request<Body>) -> bool {
    match &state.config.api_key {
        None => true,
        Some(expected) => {
            if !requires_auth(req.uri().path()) {
                return true;
            }
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == expected)
                .unwrap_or(false)
        }
    }
}

async fn route(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        apply_cors(&mut response);
        return Ok(response);
    }

    if !check_auth(&state, &req) {
        let mut response = unauthorized();
        apply_cors(&mut response);
        return Ok(response);
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (method.clone(), path.as_str()) {
        (Method::GET, "/health") => Ok(handlers::health(&state)),
        (Method::POST, "/ingest") => handlers::ingest(&state, req).await,
        (Method::GET, "/query") => handlers::query(&state, &req),
        (Method::GET, "/labels") => Ok(handlers::labels(&state)),
        (Method::GET, "/metrics") => Ok(handlers::metrics_text(&state)),
        (Method::GET, "/stream") => handlers::stream(&state, req),
        (Method::GET, path) if path.starts_with("/labels/") && path.ends_with("/values") => {
            let name = &path["/labels/".len()..path.len() - "/values".len()];
            Ok(handlers::label_values(&state, name))
        }
        _ => Err(AppError::InvalidInput(format!(
            "no route for {} {}",
            method, path
        ))),
    };

    let mut response = match result {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };
    apply_cors(&mut response);
    Ok(response)
}

/// Runs the HTTP server until `shutdown_rx` fires, then returns once the
/// in-flight connections have drained.
pub async fn serve(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), AppError> {
    let addr = state
        .config
        .http_addr
        .parse()
        .map_err(|err| AppError::Fatal(format!("invalid http_addr {:?}: {}", state.config.http_addr, err)))?;

    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(service_fn(move |req| route(Arc::clone(&state), req))) }
    });

    info!("listening on {}", addr);
    let server = Server::bind(&addr).serve(make_svc);
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });

    if let Err(err) = graceful.await {
        error!("http server error: {}", err);
        return Err(AppError::Fatal(err.to_string()));
    }
    Ok(())
}
