//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use docrelay::{
    Attempt, BackendError, BackendHealthRegistry, BackendKind, Backends, CapabilityTable,
    ConversionEngine, ConvertBackend, EngineConfig, FailureKind,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a [`Scripted`] backend does when invoked.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(&'static [u8]),
    Fail(FailureKind),
    Panic,
    /// Never finishes on its own.
    Hang,
}

/// Test double that counts invocations and leaves a file in its scratch
/// directory before acting, so cleanup can be checked.
pub struct Scripted {
    kind: BackendKind,
    outcome: Outcome,
    available: bool,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn new(kind: BackendKind, outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcome,
            available: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unavailable(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcome: Outcome::Fail(FailureKind::BackendUnavailable),
            available: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConvertBackend for Scripted {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(attempt.work_dir.join("partial.out"), b"partial").await?;

        match &self.outcome {
            Outcome::Succeed(data) => Ok(data.to_vec()),
            Outcome::Fail(kind) => Err(BackendError::new(*kind, "scripted failure")),
            Outcome::Panic => panic!("scripted panic in {}", self.kind),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Config whose working areas live under `root`, with real external
/// backends switched off.
pub fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        work_root: root.to_path_buf(),
        office_enabled: false,
        html_render_enabled: false,
        remote_api_key: None,
        ..EngineConfig::default()
    }
}

/// Engine over the default table and `config`, with each double replacing
/// the backend of its kind.
pub fn engine(config: EngineConfig, doubles: &[Arc<Scripted>]) -> ConversionEngine {
    let backends = doubles
        .iter()
        .fold(Backends::from_config(&config), |backends, double| {
            backends.with(Arc::clone(double) as Arc<dyn ConvertBackend>)
        });
    ConversionEngine::with_parts(
        CapabilityTable::from_config(&config),
        backends,
        Arc::new(BackendHealthRegistry::new()),
        config,
    )
}

/// Number of entries left directly under `root`.
pub fn leftovers(root: &Path) -> usize {
    std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}
