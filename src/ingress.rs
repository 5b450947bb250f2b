//! HTTP Ingress
//!
//! `POST` or `PUT` to any path appends the request body to the buffer and
//! answers `200 OK` only once the body is durably on disk.
//!
//! | Condition | Status |
//! |-----------|--------|
//! | appended | 200 |
//! | empty body | 400 |
//! | other method | 405 |
//! | body over limit | 413 |
//! | storage failure | 500 |
//! | buffer closed (shutting down) | 503 |
//!
//! `GET /health` reports buffer statistics, with 503 once the buffer is closed.

use crate::spool::buffer::Buffer;
use crate::spool::config::IngressConfig;
use crate::spool::error::SpoolError;
use crate::spool::segment_store::SegmentFs;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{error, warn};

struct IngressState<F: SegmentFs> {
    buffer: Arc<Buffer<F>>,
    newline_delimited: bool,
}

/// Build the ingress router
pub fn router<F: SegmentFs>(buffer: Arc<Buffer<F>>, config: &IngressConfig) -> Router {
    let state = Arc::new(IngressState {
        buffer,
        newline_delimited: config.newline_delimited,
    });

    Router::new()
        .route("/health", get(health::<F>))
        .fallback(write::<F>)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state)
}

async fn write<F: SegmentFs>(
    State(state): State<Arc<IngressState<F>>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST && method != Method::PUT {
        return (StatusCode::METHOD_NOT_ALLOWED, "use POST or PUT\n").into_response();
    }
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty body\n").into_response();
    }

    let payload = if state.newline_delimited && !body.ends_with(b"\n") {
        let mut framed = BytesMut::with_capacity(body.len() + 1);
        framed.extend_from_slice(&body);
        framed.extend_from_slice(b"\n");
        framed.freeze()
    } else {
        body
    };

    let buffer = state.buffer.clone();
    match tokio::task::spawn_blocking(move || buffer.append(&payload)).await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(SpoolError::BufferClosed)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting down\n").into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "Write rejected");
            (StatusCode::INTERNAL_SERVER_ERROR, "write failed\n").into_response()
        }
        Err(e) => {
            error!(error = %e, "Write task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health<F: SegmentFs>(State(state): State<Arc<IngressState<F>>>) -> Response {
    let buffer = state.buffer.clone();
    let stats = match tokio::task::spawn_blocking(move || buffer.stats()).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            warn!(error = %e, "Health check could not read buffer stats");
            return (StatusCode::INTERNAL_SERVER_ERROR, "buffer unavailable\n").into_response();
        }
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let (status, label) = if stats.closed {
        (StatusCode::SERVICE_UNAVAILABLE, "closed")
    } else if stats.degraded {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    let body = serde_json::json!({
        "status": label,
        "buffer": stats,
    });
    (status, Json(body)).into_response()
}
