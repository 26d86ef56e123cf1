//! The conversion engine.
//!
//! [`ConversionEngine::convert`] validates a request, acquires a private
//! working area, and walks the capability table's backend list for the pair
//! in order. The first backend to produce output wins. Every attempt is
//! bounded by `min(remaining budget, backend ceiling)`, and the working area
//! is released before the call returns, whatever the outcome.

use crate::config::EngineConfig;
use crate::engines::{remaining, Attempt, BackendKind, Backends, ConvertOptions};
use crate::error::{BackendAttempt, BackendError, ConversionError, FailureKind};
use crate::formats::Format;
use crate::health::BackendHealthRegistry;
use crate::router::CapabilityTable;
use crate::workspace::{WorkingArea, Workspace};
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// One conversion job. Immutable once built.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    id: Uuid,
    input: Bytes,
    source: Format,
    target: Format,
    max_size: Option<usize>,
    deadline: Option<Duration>,
    options: ConvertOptions,
}

impl ConversionRequest {
    pub fn new(input: impl Into<Bytes>, source: Format, target: Format) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            source,
            target,
            max_size: None,
            deadline: None,
            options: ConvertOptions::default(),
        }
    }

    /// Caller-side size cap. The engine's configured maximum still applies.
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Total time budget for the whole request, capped by configuration.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_options(mut self, options: ConvertOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input(&self) -> &Bytes {
        &self.input
    }

    pub fn source(&self) -> Format {
        self.source
    }

    pub fn target(&self) -> Format {
        self.target
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }
}

/// Successful conversion.
#[derive(Debug, Clone)]
pub struct Converted {
    pub data: Vec<u8>,
    pub target: Format,
    /// The backend that produced `data`.
    pub backend: BackendKind,
    pub attempts: Vec<BackendAttempt>,
}

impl Converted {
    pub fn content_type(&self) -> String {
        self.target.content_type()
    }

    /// `stem` with the target's extension.
    pub fn filename(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.target.extension())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub backend: BackendKind,
    pub available: bool,
    /// Set once a fatal failure took the backend out of rotation.
    pub disabled: Option<FailureKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub backends: Vec<BackendStatus>,
}

pub struct ConversionEngine {
    table: CapabilityTable,
    backends: Backends,
    health: Arc<BackendHealthRegistry>,
    workspace: Workspace,
    config: EngineConfig,
}

impl ConversionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            CapabilityTable::from_config(&config),
            Backends::from_config(&config),
            Arc::new(BackendHealthRegistry::new()),
            config,
        )
    }

    pub fn with_parts(
        table: CapabilityTable,
        backends: Backends,
        health: Arc<BackendHealthRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            table,
            backends,
            health,
            workspace: Workspace::new(config.work_root.clone()),
            config,
        }
    }

    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }

    pub fn health(&self) -> &Arc<BackendHealthRegistry> {
        &self.health
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn convert(&self, request: &ConversionRequest) -> Result<Converted, ConversionError> {
        self.convert_with_cancel(request, CancellationToken::new()).await
    }

    /// Like [`convert`](Self::convert), but gives up with `Cancelled` as soon
    /// as `cancel` fires. The in-flight attempt is dropped, which terminates
    /// its subprocess or network call, and the working area is released.
    pub async fn convert_with_cancel(
        &self,
        request: &ConversionRequest,
        cancel: CancellationToken,
    ) -> Result<Converted, ConversionError> {
        let span = info_span!(
            "convert",
            id = %request.id(),
            source = %request.source(),
            target = %request.target()
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        cancel: CancellationToken,
    ) -> Result<Converted, ConversionError> {
        let started = Instant::now();
        let backends = self.validate(request)?;

        let budget = request
            .deadline()
            .map_or(self.config.max_total_deadline, |d| d.min(self.config.max_total_deadline));
        let deadline = started + budget;

        let area = self.workspace.acquire(request.id()).map_err(|e| {
            error!("Failed to create working area: {}", e);
            ConversionError::rejected(FailureKind::Internal)
        })?;

        info!(
            "Converting {} bytes, candidates: {:?}",
            request.input().len(),
            backends
        );

        let mut attempts = Vec::new();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            won = self.try_in_order(request, backends, &area, started, deadline, &mut attempts) => Some(won),
        };

        if let Err(e) = area.release() {
            warn!("Failed to release working area: {}", e);
        }

        match outcome {
            None => {
                warn!("Conversion cancelled after {} attempt(s)", attempts.len());
                Err(ConversionError {
                    kind: FailureKind::Cancelled,
                    attempts,
                })
            }
            Some(Some((backend, data))) => {
                info!(
                    "Converted with {} in {:?} ({} bytes)",
                    backend,
                    started.elapsed(),
                    data.len()
                );
                Ok(Converted {
                    data,
                    target: request.target(),
                    backend,
                    attempts,
                })
            }
            Some(None) => {
                let kind = exhausted_kind(&attempts);
                warn!("Conversion failed ({}) after {} attempt(s)", kind, attempts.len());
                Err(ConversionError { kind, attempts })
            }
        }
    }

    /// Reject requests that must not allocate anything.
    fn validate(&self, request: &ConversionRequest) -> Result<&[BackendKind], ConversionError> {
        let (source, target) = (request.source(), request.target());
        if !self.table.knows(source) || !self.table.knows(target) {
            debug!("Rejecting unknown format pair");
            return Err(ConversionError::rejected(FailureKind::InvalidRequest));
        }

        let max_size = request
            .max_size()
            .map_or(self.config.max_file_size, |m| m.min(self.config.max_file_size));
        let size = request.input().len();
        if size == 0 || size > max_size {
            debug!("Rejecting input of {} bytes (limit {})", size, max_size);
            return Err(ConversionError::rejected(FailureKind::InvalidRequest));
        }

        self.table
            .lookup(source, target)
            .map_err(ConversionError::rejected)
    }

    /// Returns the winning backend and its output, or `None` once every
    /// candidate failed or the budget ran out.
    async fn try_in_order(
        &self,
        request: &ConversionRequest,
        backends: &[BackendKind],
        area: &WorkingArea,
        started: Instant,
        deadline: Instant,
        log: &mut Vec<BackendAttempt>,
    ) -> Option<(BackendKind, Vec<u8>)> {
        for (index, &kind) in backends.iter().enumerate() {
            if let Some(reason) = self.health.reason(kind) {
                debug!("Skipping {} backend (disabled: {})", kind, reason);
                continue;
            }
            let Some(left) = remaining(deadline) else {
                warn!("Total deadline elapsed before trying {}", kind);
                break;
            };

            let attempt_started = Instant::now();
            let attempt_deadline = attempt_started + left.min(self.config.timeout_for(kind));
            debug!("Trying {} backend", kind);

            let result = self
                .attempt(kind, index, request, area, attempt_deadline)
                .await;
            let mut entry = BackendAttempt {
                backend: kind,
                started_at: attempt_started - started,
                elapsed: attempt_started.elapsed(),
                failure: None,
                message: None,
            };

            match result {
                Ok(data) => {
                    log.push(entry);
                    return Some((kind, data));
                }
                Err(e) => {
                    warn!("{} backend failed after {:?}: {}", kind, entry.elapsed, e);
                    if e.kind.disables_backend() {
                        self.health.disable(kind, e.kind);
                    }
                    entry.failure = Some(e.kind);
                    entry.message = Some(e.message);
                    log.push(entry);
                }
            }
        }
        None
    }

    /// One backend try in its own directory. Panics, overruns and output that
    /// is not a file of the target format are turned into failures here so
    /// they never escape the engine.
    async fn attempt(
        &self,
        kind: BackendKind,
        index: usize,
        request: &ConversionRequest,
        area: &WorkingArea,
        deadline: Instant,
    ) -> Result<Vec<u8>, BackendError> {
        let work_dir = area.attempt_dir(kind.as_str(), index)?;
        let attempt = Attempt {
            input: request.input(),
            source: request.source(),
            target: request.target(),
            deadline,
            work_dir: &work_dir,
            options: request.options(),
        };

        let call = AssertUnwindSafe(self.backends.get(kind).attempt(&attempt)).catch_unwind();
        let data = match tokio::time::timeout_at(deadline, call).await {
            Err(_) => {
                return Err(BackendError::timeout(format!(
                    "{} attempt exceeded its deadline",
                    kind
                )))
            }
            Ok(Err(panic)) => {
                error!("{} backend panicked: {}", kind, panic_message(&*panic));
                return Err(BackendError::unavailable(format!(
                    "{} backend panicked: {}",
                    kind,
                    panic_message(&*panic)
                )));
            }
            Ok(Ok(result)) => result?,
        };

        if data.is_empty() {
            return Err(BackendError::unavailable(format!("{} produced empty output", kind)));
        }
        if !request.target().matches_signature(&data) {
            return Err(BackendError::unavailable(format!(
                "{} output is not a valid {} file",
                kind,
                request.target()
            )));
        }
        Ok(data)
    }

    /// Probe every backend. The engine is ready when the native backend is.
    pub async fn readiness(&self) -> Readiness {
        let checks = BackendKind::ALL
            .into_iter()
            .map(|kind| async move { (kind, self.backends.get(kind).is_available().await) });
        let backends: Vec<BackendStatus> = futures::future::join_all(checks)
            .await
            .into_iter()
            .map(|(backend, available)| BackendStatus {
                backend,
                available,
                disabled: self.health.reason(backend),
            })
            .collect();

        let ready = backends
            .iter()
            .any(|b| b.backend == BackendKind::Native && b.available && b.disabled.is_none());
        Readiness { ready, backends }
    }
}

/// `InvalidInput` when every backend rejected the bytes themselves.
fn exhausted_kind(attempts: &[BackendAttempt]) -> FailureKind {
    let all_invalid = !attempts.is_empty()
        && attempts
            .iter()
            .all(|a| a.failure == Some(FailureKind::InvalidInput));
    if all_invalid {
        FailureKind::InvalidInput
    } else {
        FailureKind::AllBackendsExhausted
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
