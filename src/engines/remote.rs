//! Remote conversion API.
//!
//! The service is addressed through three calls (submit, poll, fetch),
//! abstracted by [`RemoteClient`]. [`RemoteEngine`] owns the retry policy:
//! transient failures are retried with exponential backoff
//! (`retry_backoff * 2^n`), never sleeping past the attempt deadline, and
//! folded into `BackendUnavailable` once retries run out. Credential and quota
//! rejections are returned immediately so the engine can take the backend
//! out of rotation.

use super::{Attempt, BackendKind, ConvertBackend};
use crate::config::EngineConfig;
use crate::error::{BackendError, FailureKind};
use crate::formats::Format;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Finished,
    Failed(String),
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Upload the input and start a job. Returns the job id.
    async fn submit(&self, input: Bytes, source: Format, target: Format) -> Result<String, BackendError>;

    async fn poll(&self, job_id: &str) -> Result<JobStatus, BackendError>;

    /// Download the finished job's output.
    async fn fetch(&self, job_id: &str) -> Result<Vec<u8>, BackendError>;
}

// ── HTTP client ─────────────────────────────────────────────────────────────

pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct JobCreated {
    id: String,
}

#[derive(Deserialize)]
struct JobState {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{}", self.base_url, job_id)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn submit(&self, input: Bytes, source: Format, target: Format) -> Result<String, BackendError> {
        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("source", source.extension()), ("target", target.extension())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(input)
            .send()
            .await
            .map_err(transport_error)?;

        let job: JobCreated = check_status(response)?
            .json()
            .await
            .map_err(|e| BackendError::unavailable(format!("malformed submit response: {}", e)))?;
        Ok(job.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let response = self
            .http
            .get(self.job_url(job_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let state: JobState = check_status(response)?
            .json()
            .await
            .map_err(|e| BackendError::unavailable(format!("malformed job status: {}", e)))?;

        match state.status.as_str() {
            "queued" | "pending" | "processing" => Ok(JobStatus::Pending),
            "finished" => Ok(JobStatus::Finished),
            "error" | "failed" => Ok(JobStatus::Failed(
                state.message.unwrap_or_else(|| "no details".to_string()),
            )),
            other => Err(BackendError::unavailable(format!(
                "unexpected job status {:?}",
                other
            ))),
        }
    }

    async fn fetch(&self, job_id: &str) -> Result<Vec<u8>, BackendError> {
        let response = self
            .http
            .get(format!("{}/output", self.job_url(job_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let body = check_status(response)?
            .bytes()
            .await
            .map_err(transport_error)?;
        Ok(body.to_vec())
    }
}

/// Map HTTP error statuses onto the failure taxonomy.
fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = format!("remote API returned {}", status);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::new(FailureKind::Unauthorized, message)
        }
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::new(FailureKind::QuotaExceeded, message)
        }
        StatusCode::REQUEST_TIMEOUT => BackendError::transient(message),
        s if s.is_server_error() => BackendError::transient(message),
        _ => BackendError::unavailable(message),
    })
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_decode() {
        BackendError::unavailable(format!("malformed remote response: {}", e))
    } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        BackendError::transient(format!("network error: {}", e))
    } else {
        BackendError::unavailable(format!("remote API error: {}", e))
    }
}

// ── Backend ─────────────────────────────────────────────────────────────────

pub struct RemoteEngine {
    /// `None` when no API key is configured.
    client: Option<Arc<dyn RemoteClient>>,
    max_retries: u32,
    retry_backoff: Duration,
    poll_interval: Duration,
}

impl RemoteEngine {
    pub fn new(client: Option<Arc<dyn RemoteClient>>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            client,
            max_retries: defaults.max_retries,
            retry_backoff: Duration::from_millis(defaults.retry_backoff_ms),
            poll_interval: defaults.poll_interval,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let client = config.remote_api_key.as_ref().map(|key| {
            Arc::new(HttpRemoteClient::new(config.remote_api_url.clone(), key.clone()))
                as Arc<dyn RemoteClient>
        });
        Self::new(client)
            .with_retries(config.max_retries, Duration::from_millis(config.retry_backoff_ms))
            .with_poll_interval(config.poll_interval)
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `call` until it succeeds, fails non-transiently, or retries run out.
    async fn retrying<T, F, Fut>(&self, op: &str, deadline: Instant, mut call: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut retries = 0u32;
        loop {
            let result = tokio::time::timeout_at(deadline, call())
                .await
                .map_err(|_| BackendError::timeout(format!("remote {} exceeded the deadline", op)))?;

            let err = match result {
                Err(e) if e.kind == FailureKind::Transient => e,
                other => return other,
            };

            if retries >= self.max_retries {
                return Err(BackendError::unavailable(format!(
                    "remote {} failed after {} retries: {}",
                    op, self.max_retries, err.message
                )));
            }
            retries += 1;

            let backoff = backoff_delay(self.retry_backoff, retries);
            if past(Instant::now().checked_add(backoff), deadline) {
                return Err(BackendError::timeout(format!(
                    "no time left to retry remote {}",
                    op
                )));
            }
            warn!(
                "Remote {}: retry {}/{} after {:?} ({})",
                op, retries, self.max_retries, backoff, err.message
            );
            sleep(backoff).await;
        }
    }
}

/// Delay before the `retry`-th retry: `base * 2^(retry - 1)`, saturating.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}

fn past(at: Option<Instant>, deadline: Instant) -> bool {
    at.map_or(true, |at| at >= deadline)
}

#[async_trait]
impl ConvertBackend for RemoteEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn is_available(&self) -> bool {
        self.client.is_some()
    }

    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BackendError::unavailable("remote API key not configured"))?;
        let (source, target, deadline) = (attempt.source, attempt.target, attempt.deadline);

        let job_id = self
            .retrying("submit", deadline, move || {
                client.submit(attempt.input.clone(), source, target)
            })
            .await?;
        info!("Remote job {} submitted ({} -> {})", job_id, source, target);
        let job = job_id.as_str();

        loop {
            match self.retrying("poll", deadline, move || client.poll(job)).await? {
                JobStatus::Finished => break,
                JobStatus::Failed(reason) => {
                    return Err(BackendError::unavailable(format!(
                        "remote job {} failed: {}",
                        job_id, reason
                    )))
                }
                JobStatus::Pending => {
                    debug!("Remote job {} still running", job_id);
                    if past(Instant::now().checked_add(self.poll_interval), deadline) {
                        return Err(BackendError::timeout(format!(
                            "remote job {} did not finish before the deadline",
                            job_id
                        )));
                    }
                    sleep(self.poll_interval).await;
                }
            }
        }

        self.retrying("fetch", deadline, move || client.fetch(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::ConvertOptions;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeClient {
        submits: Mutex<VecDeque<Result<String, BackendError>>>,
        polls: Mutex<VecDeque<Result<JobStatus, BackendError>>>,
        submit_calls: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    impl FakeClient {
        fn submits(self, results: Vec<Result<String, BackendError>>) -> Self {
            *self.submits.lock() = results.into();
            self
        }

        fn polls(self, results: Vec<Result<JobStatus, BackendError>>) -> Self {
            *self.polls.lock() = results.into();
            self
        }
    }

    #[async_trait]
    impl RemoteClient for FakeClient {
        async fn submit(&self, _: Bytes, _: Format, _: Format) -> Result<String, BackendError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submits.lock().pop_front().unwrap_or(Ok("job-1".into()))
        }

        async fn poll(&self, _: &str) -> Result<JobStatus, BackendError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.polls.lock().pop_front().unwrap_or(Ok(JobStatus::Finished))
        }

        async fn fetch(&self, job_id: &str) -> Result<Vec<u8>, BackendError> {
            Ok(format!("output of {}", job_id).into_bytes())
        }
    }

    fn engine(client: &Arc<FakeClient>) -> RemoteEngine {
        RemoteEngine::new(Some(Arc::clone(client) as Arc<dyn RemoteClient>))
            .with_retries(2, Duration::from_millis(5))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn run(engine: &RemoteEngine, timeout: Duration) -> Result<Vec<u8>, BackendError> {
        let dir = tempfile::tempdir().unwrap();
        let input = Bytes::from_static(b"%PDF-1.4");
        let options = ConvertOptions::default();
        let attempt = Attempt {
            input: &input,
            source: Format::Docx,
            target: Format::Pdf,
            deadline: Instant::now() + timeout,
            work_dir: dir.path(),
            options: &options,
        };
        engine.attempt(&attempt).await
    }

    #[tokio::test]
    async fn unconfigured_remote_is_unavailable() {
        let engine = RemoteEngine::new(None);
        let err = run(&engine, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::BackendUnavailable);
        assert!(!engine.is_available().await);
    }

    #[tokio::test]
    async fn submit_poll_fetch() {
        let client = Arc::new(FakeClient::default().polls(vec![
            Ok(JobStatus::Pending),
            Ok(JobStatus::Pending),
            Ok(JobStatus::Finished),
        ]));
        let out = run(&engine(&client), Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, b"output of job-1");
        assert_eq!(client.poll_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Arc::new(FakeClient::default().submits(vec![
            Err(BackendError::transient("connection reset")),
            Err(BackendError::transient("connection reset")),
        ]));
        assert!(run(&engine(&client), Duration::from_secs(5)).await.is_ok());
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_unavailable() {
        let client = Arc::new(FakeClient::default().submits(vec![
            Err(BackendError::transient("503")),
            Err(BackendError::transient("503")),
            Err(BackendError::transient("503")),
        ]));
        let err = run(&engine(&client), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::BackendUnavailable);
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_rejections_are_not_retried() {
        for kind in [FailureKind::Unauthorized, FailureKind::QuotaExceeded] {
            let client = Arc::new(
                FakeClient::default().submits(vec![Err(BackendError::new(kind, "rejected"))]),
            );
            let err = run(&engine(&client), Duration::from_secs(5)).await.unwrap_err();
            assert_eq!(err.kind, kind);
            assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 40), Duration::MAX);
        assert_eq!(backoff_delay(Duration::ZERO, 40), Duration::ZERO);
    }

    #[tokio::test]
    async fn many_retries_with_zero_backoff() {
        let client = Arc::new(FakeClient::default().submits(
            (0..50).map(|_| Err(BackendError::transient("503"))).collect(),
        ));
        let engine = RemoteEngine::new(Some(Arc::clone(&client) as Arc<dyn RemoteClient>))
            .with_retries(40, Duration::ZERO);
        let err = run(&engine, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::BackendUnavailable);
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 41);
    }

    #[tokio::test]
    async fn huge_backoff_gives_up_at_the_deadline() {
        let client = Arc::new(
            FakeClient::default().submits(vec![Err(BackendError::transient("503"))]),
        );
        let engine = RemoteEngine::new(Some(Arc::clone(&client) as Arc<dyn RemoteClient>))
            .with_retries(3, Duration::MAX);
        let err = run(&engine, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_job_is_unavailable() {
        let client = Arc::new(
            FakeClient::default().polls(vec![Ok(JobStatus::Failed("bad input".into()))]),
        );
        let err = run(&engine(&client), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::BackendUnavailable);
        assert!(err.message.contains("bad input"));
    }

    #[tokio::test]
    async fn polling_stops_at_the_deadline() {
        let client = Arc::new(
            FakeClient::default().polls((0..1000).map(|_| Ok(JobStatus::Pending)).collect()),
        );
        let started = std::time::Instant::now();
        let err = run(&engine(&client), Duration::from_millis(150)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
