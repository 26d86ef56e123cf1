mod chromium;
mod libreoffice;
mod native;
mod ooxml;
mod process;
mod remote;

pub use chromium::ChromiumEngine;
pub use libreoffice::LibreOfficeEngine;
pub use native::NativeEngine;
pub use remote::{HttpRemoteClient, JobStatus, RemoteClient, RemoteEngine};

use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::formats::Format;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

/// Conversion options passed to engines
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Page width (e.g., "8.5in", "210mm")
    pub page_width: Option<String>,
    /// Page height (e.g., "11in", "297mm")
    pub page_height: Option<String>,
    /// Landscape orientation
    pub landscape: bool,
    /// Print background
    pub print_background: bool,
}

/// The closed set of backend kinds, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Office,
    HtmlRender,
    Remote,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Native,
        BackendKind::Office,
        BackendKind::HtmlRender,
        BackendKind::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Office => "office",
            BackendKind::HtmlRender => "html_render",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs for one try.
pub struct Attempt<'a> {
    pub input: &'a Bytes,
    pub source: Format,
    pub target: Format,
    /// Hard deadline; past it the backend must give up with `Timeout`.
    pub deadline: Instant,
    /// Private scratch directory. Backends never write outside it.
    pub work_dir: &'a Path,
    pub options: &'a ConvertOptions,
}

/// Trait that all conversion backends must implement
#[async_trait]
pub trait ConvertBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Check if the backend is operational (dependencies installed, configured)
    async fn is_available(&self) -> bool;

    /// Convert `attempt.input` from `attempt.source` to `attempt.target`.
    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError>;
}

/// One backend per kind.
#[derive(Clone)]
pub struct Backends {
    native: Arc<dyn ConvertBackend>,
    office: Arc<dyn ConvertBackend>,
    html_render: Arc<dyn ConvertBackend>,
    remote: Arc<dyn ConvertBackend>,
}

impl Backends {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            native: Arc::new(NativeEngine::new()),
            office: Arc::new(LibreOfficeEngine::from_config(config)),
            html_render: Arc::new(ChromiumEngine::from_config(config)),
            remote: Arc::new(RemoteEngine::from_config(config)),
        }
    }

    pub fn get(&self, kind: BackendKind) -> &Arc<dyn ConvertBackend> {
        match kind {
            BackendKind::Native => &self.native,
            BackendKind::Office => &self.office,
            BackendKind::HtmlRender => &self.html_render,
            BackendKind::Remote => &self.remote,
        }
    }

    /// Replace the slot matching `backend.kind()`.
    pub fn with(mut self, backend: Arc<dyn ConvertBackend>) -> Self {
        let slot = match backend.kind() {
            BackendKind::Native => &mut self.native,
            BackendKind::Office => &mut self.office,
            BackendKind::HtmlRender => &mut self.html_render,
            BackendKind::Remote => &mut self.remote,
        };
        *slot = backend;
        self
    }
}

/// Remaining time until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<std::time::Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}
