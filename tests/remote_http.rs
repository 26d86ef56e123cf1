//! The HTTP remote client against an in-process stand-in for the conversion
//! API.

mod common;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{config, leftovers};
use docrelay::engines::{HttpRemoteClient, JobStatus, RemoteClient, RemoteEngine};
use docrelay::{
    BackendHealthRegistry, BackendKind, Backends, CapabilityTable, ConversionEngine,
    ConversionRequest, FailureKind, Format,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "secret";

#[derive(Clone)]
struct MockApi {
    /// Status returned by submit instead of creating a job.
    submit_status: Option<StatusCode>,
    polls: Arc<AtomicUsize>,
    submits: Arc<AtomicUsize>,
}

impl MockApi {
    fn new(submit_status: Option<StatusCode>) -> Self {
        Self {
            submit_status,
            polls: Arc::new(AtomicUsize::new(0)),
            submits: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == format!("Bearer {}", KEY))
}

async fn submit(
    State(api): State<MockApi>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    api.submits.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Some(status) = api.submit_status {
        return status.into_response();
    }
    if body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({ "id": format!("{}-to-{}", query["source"], query["target"]) })).into_response()
}

async fn status(State(api): State<MockApi>, Path(id): Path<String>) -> Response {
    if id == "garbage" {
        return "not json".into_response();
    }
    // Processing on the first poll, finished afterwards.
    let status = if api.polls.fetch_add(1, Ordering::SeqCst) == 0 {
        "processing"
    } else {
        "finished"
    };
    Json(json!({ "status": status })).into_response()
}

async fn output(Path(id): Path<String>) -> Vec<u8> {
    format!("%PDF converted by {}", id).into_bytes()
}

async fn serve(api: MockApi) -> String {
    let router = Router::new()
        .route("/jobs", post(submit))
        .route("/jobs/:id", get(status))
        .route("/jobs/:id/output", get(output))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{}", addr)
}

#[tokio::test]
async fn submit_poll_fetch_over_http() {
    let base = serve(MockApi::new(None)).await;
    let client = HttpRemoteClient::new(format!("{}/", base), KEY);

    let id = client
        .submit(Bytes::from_static(b"PK.."), Format::Docx, Format::Pdf)
        .await
        .unwrap();
    assert_eq!(id, "docx-to-pdf");
    assert_eq!(client.poll(&id).await.unwrap(), JobStatus::Pending);
    assert_eq!(client.poll(&id).await.unwrap(), JobStatus::Finished);
    assert_eq!(client.fetch(&id).await.unwrap(), b"%PDF converted by docx-to-pdf");
}

#[tokio::test]
async fn http_statuses_map_to_failure_kinds() {
    let cases = [
        (StatusCode::PAYMENT_REQUIRED, FailureKind::QuotaExceeded),
        (StatusCode::TOO_MANY_REQUESTS, FailureKind::QuotaExceeded),
        (StatusCode::FORBIDDEN, FailureKind::Unauthorized),
        (StatusCode::SERVICE_UNAVAILABLE, FailureKind::Transient),
        (StatusCode::NOT_FOUND, FailureKind::BackendUnavailable),
    ];
    for (status, expected) in cases {
        let base = serve(MockApi::new(Some(status))).await;
        let client = HttpRemoteClient::new(base, KEY);
        let err = client
            .submit(Bytes::from_static(b"PK.."), Format::Docx, Format::Pdf)
            .await
            .unwrap_err();
        assert_eq!(err.kind, expected, "for {}", status);
    }
}

#[tokio::test]
async fn wrong_key_is_unauthorized() {
    let base = serve(MockApi::new(None)).await;
    let client = HttpRemoteClient::new(base, "wrong");
    let err = client
        .submit(Bytes::from_static(b"PK.."), Format::Docx, Format::Pdf)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FailureKind::Unauthorized);
}

#[tokio::test]
async fn malformed_response_is_unavailable() {
    let base = serve(MockApi::new(None)).await;
    let client = HttpRemoteClient::new(base, KEY);
    let err = client.poll("garbage").await.unwrap_err();
    assert_eq!(err.kind, FailureKind::BackendUnavailable);
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    // Bind then drop to get a port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpRemoteClient::new(format!("http://{}", addr), KEY);
    let err = client.poll("job").await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Transient);
}

fn engine_with_remote(root: &std::path::Path, base: String) -> ConversionEngine {
    let config = config(root);
    let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(base, KEY));
    let remote = RemoteEngine::new(Some(client))
        .with_retries(2, Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(20));
    ConversionEngine::with_parts(
        CapabilityTable::from_config(&config),
        Backends::from_config(&config).with(Arc::new(remote)),
        Arc::new(BackendHealthRegistry::new()),
        config,
    )
}

#[tokio::test]
async fn docx_to_pdf_through_the_remote_api() {
    let root = tempfile::tempdir().unwrap();
    let base = serve(MockApi::new(None)).await;
    let engine = engine_with_remote(root.path(), base);

    let request = ConversionRequest::new(&b"PK\x03\x04"[..], Format::Docx, Format::Pdf);
    let converted = engine.convert(&request).await.unwrap();

    assert_eq!(converted.backend, BackendKind::Remote);
    assert_eq!(converted.data, b"%PDF converted by docx-to-pdf");
    let tried: Vec<_> = converted.attempts.iter().map(|a| (a.backend, a.failure)).collect();
    assert_eq!(
        tried,
        [
            (BackendKind::Office, Some(FailureKind::BackendUnavailable)),
            (BackendKind::Remote, None),
        ]
    );
    assert_eq!(leftovers(root.path()), 0);
}

#[tokio::test]
async fn exhausted_quota_disables_the_remote_backend() {
    let root = tempfile::tempdir().unwrap();
    let api = MockApi::new(Some(StatusCode::PAYMENT_REQUIRED));
    let submits = Arc::clone(&api.submits);
    let base = serve(api).await;
    let engine = engine_with_remote(root.path(), base);

    let request = ConversionRequest::new(&b"PK.."[..], Format::Docx, Format::Pdf);
    let err = engine.convert(&request).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::AllBackendsExhausted);
    assert_eq!(submits.load(Ordering::SeqCst), 1);

    let again = engine.convert(&request).await.unwrap_err();
    assert_eq!(again.attempts.len(), 1);
    assert_eq!(submits.load(Ordering::SeqCst), 1);
    assert_eq!(engine.health().reason(BackendKind::Remote), Some(FailureKind::QuotaExceeded));
}

#[tokio::test]
async fn server_errors_are_retried_then_given_up() {
    let root = tempfile::tempdir().unwrap();
    let api = MockApi::new(Some(StatusCode::BAD_GATEWAY));
    let submits = Arc::clone(&api.submits);
    let base = serve(api).await;
    let engine = engine_with_remote(root.path(), base);

    let request = ConversionRequest::new(&b"PK.."[..], Format::Docx, Format::Pdf);
    let err = engine.convert(&request).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::AllBackendsExhausted);
    assert_eq!(err.attempts[1].failure, Some(FailureKind::BackendUnavailable));
    // One call plus two retries.
    assert_eq!(submits.load(Ordering::SeqCst), 3);
    assert!(!engine.health().is_disabled(BackendKind::Remote));
}
