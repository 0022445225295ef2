// Axum request handlers: translate player and controller HTTP requests into session operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::engine::{SessionManager, StatusSnapshot};
use crate::error::StreamError;
use crate::transfer::TransferEngine;

pub struct StreamServer {
    port: u16,
    manager: SessionManager,
    grace: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Bind `127.0.0.1:<config.port>` and start serving. Port 0 picks an ephemeral port.
    pub async fn start(config: StreamConfig, engine: Arc<dyn TransferEngine>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", config.port))
            .await
            .with_context(|| format!("failed to bind 127.0.0.1:{}", config.port))?;
        let port = listener.local_addr()?.port();
        let grace = config.shutdown_grace();

        let manager = SessionManager::new(
            engine,
            config,
            format!("http://127.0.0.1:{}/stream", port),
        );
        let app = router(manager.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("stream server error: {}", e);
            }
        });
        info!("stream server listening on 127.0.0.1:{}", port);

        Ok(Self {
            port,
            manager,
            grace,
            shutdown_tx: Some(shutdown_tx),
            serve: Some(serve),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn stream_url(&self) -> &str {
        self.manager.stream_url()
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Stop accepting connections and release the active session. Responses still running
    /// after the grace period are dropped.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.manager.stop();

        if let Some(mut serve) = self.serve.take() {
            match tokio::time::timeout(self.grace, &mut serve).await {
                Ok(_) => info!("stream server on port {} stopped", self.port),
                Err(_) => {
                    warn!(
                        "connections still open after {:?}, closing them",
                        self.grace
                    );
                    serve.abort();
                }
            }
        }
    }

    /// Serve until `signal` resolves, then shut down.
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("shutdown requested");
        self.shutdown().await;
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/add", post(add_handler))
        .route("/status", get(status_handler))
        .route("/stream", get(stream_handler))
        .route("/stop", post(stop_handler))
        .route("/health", get(health_handler))
        .with_state(manager)
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            StreamError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::RangeNotSatisfiable { length } => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", length))],
                    self.to_string(),
                )
                    .into_response();
            }
            StreamError::NoActiveSession | StreamError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StreamError::ReadTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            StreamError::Engine(_) => StatusCode::BAD_GATEWAY,
            StreamError::Resolution(_) | StreamError::NoPlayableFile => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct AddParams {
    magnet: Option<String>,
}

/// POST /add: `magnet` from the query string, else from a form body.
async fn add_handler(
    State(manager): State<SessionManager>,
    Query(query): Query<AddParams>,
    body: Bytes,
) -> Result<Json<Value>, StreamError> {
    let magnet = query
        .magnet
        .or_else(|| {
            serde_urlencoded::from_bytes::<AddParams>(&body)
                .ok()
                .and_then(|form| form.magnet)
        })
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| StreamError::BadRequest("missing magnet parameter".to_string()))?;

    manager.start(&magnet)?;
    Ok(Json(json!({ "status": "loading" })))
}

async fn status_handler(State(manager): State<SessionManager>) -> Json<StatusSnapshot> {
    Json(manager.snapshot())
}

async fn stop_handler(State(manager): State<SessionManager>) -> &'static str {
    manager.stop();
    "stopped"
}

async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

impl ParsedRange {
    /// Byte span `[start, end)` within a file of `total` bytes, or None when unsatisfiable.
    fn resolve(&self, total: u64) -> Option<(u64, u64)> {
        match *self {
            ParsedRange::StartEnd {
                start,
                end_inclusive,
            } => {
                if start >= total {
                    return None;
                }
                let end = end_inclusive.map_or(total, |e| e.saturating_add(1).min(total));
                Some((start, end))
            }
            ParsedRange::Suffix { len } => {
                // A zero-length suffix selects nothing.
                if total == 0 || len == 0 {
                    return None;
                }
                Some((total - len.min(total), total))
            }
        }
    }
}

/// Parse a single-range Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
///
/// Anything else, including multiple ranges, yields None and the header is ignored.
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            let end = end_str.parse::<u64>().ok()?;
            if end < start {
                return None;
            }
            Some(end)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// A Range only applies when If-Range is absent or names the current entity.
fn if_range_matches(headers: &HeaderMap, etag: &str) -> bool {
    match headers.get(header::IF_RANGE) {
        None => true,
        Some(value) => value.to_str().map(|v| v.trim() == etag).unwrap_or(false),
    }
}

/// GET /stream: serve the selected file with Range support. HEAD is answered from the same
/// route without a body.
async fn stream_handler(
    State(manager): State<SessionManager>,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    let reader = manager.open_reader()?;
    let total = reader.len();
    let etag = reader.etag();
    let content_type = reader.file().content_type();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|_| if_range_matches(&headers, &etag))
        .and_then(parse_range_header);

    let (start, end, is_partial) = match range {
        Some(range) => match range.resolve(total) {
            Some((start, end)) => (start, end, true),
            None => return Err(StreamError::RangeNotSatisfiable { length: total }),
        },
        None => (0, total, false),
    };

    debug!(
        "stream request {} range=[{}, {}) partial={}",
        reader.file().display_name(),
        start,
        end,
        is_partial
    );

    let chunk = manager.config().stream_chunk_bytes.max(1);
    let body = Body::from_stream(stream::unfold(
        (reader, start),
        move |(mut reader, pos)| async move {
            if pos >= end {
                return None;
            }
            let want = (end - pos).min(chunk) as usize;
            match reader.read_at(pos, want).await {
                Ok(data) if data.is_empty() => None,
                Ok(data) => {
                    let next = pos + data.len() as u64;
                    Some((Ok(data), (reader, next)))
                }
                Err(e) => {
                    warn!("stream aborted at byte {}: {}", pos, e);
                    Some((Err(e), (reader, end)))
                }
            }
        },
    ));

    let status = if is_partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    resp_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&etag) {
        resp_headers.insert(header::ETAG, value);
    }
    if is_partial {
        // Content-Range: bytes start-end/total (end is inclusive in HTTP).
        let content_range = format!("bytes {}-{}/{}", start, end - 1, total);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            resp_headers.insert(header::CONTENT_RANGE, value);
        }
    }

    Ok((status, resp_headers, body).into_response())
}
