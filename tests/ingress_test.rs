//! HTTP ingress tests
//!
//! Requests are driven straight into the router with `tower::ServiceExt`, no
//! socket involved.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use s3_spool::router;
use s3_spool::spool::{
    Buffer, BufferConfig, FsyncPolicy, InMemorySegmentFs, IngressConfig, ManualClock,
    SegmentStore,
};
use std::sync::Arc;
use tower::ServiceExt;

fn setup(config: IngressConfig) -> (Arc<Buffer<InMemorySegmentFs>>, InMemorySegmentFs, Router) {
    let fs = InMemorySegmentFs::new();
    let (store, _) =
        SegmentStore::open(fs.clone(), FsyncPolicy::Always, Arc::new(ManualClock::new(1))).unwrap();
    let buffer_config = BufferConfig {
        max_segment_bytes: 1 << 20,
        ..BufferConfig::test("unused")
    };
    let buffer = Arc::new(Buffer::open(Arc::new(store), buffer_config).unwrap());
    let app = router(buffer.clone(), &config);
    (buffer, fs, app)
}

fn request(method: Method, uri: &str, body: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

fn sealed_contents(buffer: &Buffer<InMemorySegmentFs>) -> Vec<Bytes> {
    buffer
        .drain()
        .unwrap()
        .iter()
        .map(|s| buffer.store().read(s).unwrap())
        .collect()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_post_and_put_on_any_path_are_appended() {
    let (buffer, _, app) = setup(IngressConfig::default());

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", b"first"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request(Method::PUT, "/some/deep/path", b"second"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(
        sealed_contents(&buffer),
        vec![Bytes::from_static(b"firstsecond")]
    );
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let (buffer, _, app) = setup(IngressConfig::default());
    let response = app.oneshot(request(Method::POST, "/", b"")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(sealed_contents(&buffer).is_empty());
}

#[tokio::test]
async fn test_other_methods_are_not_allowed() {
    let (_, _, app) = setup(IngressConfig::default());
    for method in [Method::GET, Method::DELETE, Method::PATCH] {
        let response = app
            .clone()
            .oneshot(request(method, "/data", b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

#[tokio::test]
async fn test_body_over_limit_is_rejected() {
    let config = IngressConfig {
        max_body_bytes: 8,
        ..IngressConfig::default()
    };
    let (buffer, _, app) = setup(config);

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", b"way more than eight bytes"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = app
        .oneshot(request(Method::POST, "/", b"fits"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sealed_contents(&buffer), vec![Bytes::from_static(b"fits")]);
}

#[tokio::test]
async fn test_newline_delimited_mode_terminates_bodies() {
    let config = IngressConfig {
        newline_delimited: true,
        ..IngressConfig::default()
    };
    let (buffer, _, app) = setup(config);

    for body in [&b"one"[..], b"two\n"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::from(body.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(
        sealed_contents(&buffer),
        vec![Bytes::from_static(b"one\ntwo\n")]
    );
}

#[tokio::test]
async fn test_storage_failure_is_server_error() {
    let (buffer, fs, app) = setup(IngressConfig::default());
    fs.set_fail_appends(true);

    let response = app
        .oneshot(request(Method::POST, "/", b"doomed"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    fs.set_fail_appends(false);
    assert!(sealed_contents(&buffer).is_empty());
}

#[tokio::test]
async fn test_closed_buffer_is_unavailable() {
    let (buffer, _, app) = setup(IngressConfig::default());
    buffer.force_flush().unwrap();

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", b"late"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app
        .oneshot(request(Method::GET, "/health", b""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "closed");
}

#[tokio::test]
async fn test_health_reports_buffer_stats() {
    let (_, _, app) = setup(IngressConfig::default());
    app.clone()
        .oneshot(request(Method::POST, "/", b"12345"))
        .await
        .unwrap();

    let response = app
        .oneshot(request(Method::GET, "/health", b""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["buffer"]["open_segment_bytes"], 5);
    assert_eq!(json["buffer"]["sealed_segments"], 0);
    assert_eq!(json["buffer"]["closed"], false);
}
