use super::process::{check_version, spawn_grouped};
use super::{Attempt, BackendKind, ConvertBackend};
use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::formats::Format;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct LibreOfficeEngine {
    enabled: bool,
    /// Path to LibreOffice/soffice executable
    soffice_path: Option<String>,
    /// Arguments placed before the conversion flags (e.g. `run org.libreoffice.LibreOffice` for flatpak)
    leading_args: Vec<String>,
    /// The suite is a single shared instance per host. At most one
    /// invocation runs at a time; waiters are served in arrival order.
    gate: Mutex<()>,
    version_check_timeout: Duration,
    /// Outcome of the last completed `--version` check.
    availability: parking_lot::Mutex<Option<bool>>,
}

impl LibreOfficeEngine {
    pub fn new() -> Self {
        Self {
            enabled: true,
            soffice_path: None,
            leading_args: Vec::new(),
            gate: Mutex::new(()),
            version_check_timeout: EngineConfig::default().version_check_timeout,
            availability: parking_lot::Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let engine = Self::new()
            .enabled(config.office_enabled)
            .with_version_check_timeout(config.version_check_timeout);
        match &config.soffice_path {
            Some(path) => engine.with_soffice_path(path.clone()),
            None => engine,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_soffice_path(mut self, path: String) -> Self {
        self.soffice_path = Some(path);
        self
    }

    pub fn with_version_check_timeout(mut self, timeout: Duration) -> Self {
        self.version_check_timeout = timeout;
        self
    }

    pub fn with_command(mut self, program: impl Into<String>, leading_args: Vec<String>) -> Self {
        self.soffice_path = Some(program.into());
        self.leading_args = leading_args;
        self
    }

    fn get_soffice_path(&self) -> String {
        // First check instance config
        if let Some(path) = &self.soffice_path {
            return path.clone();
        }

        // Then check environment variable
        if let Ok(path) = std::env::var("SOFFICE_PATH") {
            return path;
        }

        // Fall back to OS-specific defaults
        if cfg!(target_os = "macos") {
            "/Applications/LibreOffice.app/Contents/MacOS/soffice".to_string()
        } else if cfg!(target_os = "windows") {
            r"C:\Program Files\LibreOffice\program\soffice.exe".to_string()
        } else {
            for path in &["/usr/bin/soffice", "/usr/bin/libreoffice"] {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }
            "soffice".to_string()
        }
    }

    async fn run_soffice(
        &self,
        input_path: &Path,
        output_dir: &Path,
        profile_dir: &Path,
        target: Format,
        deadline: Instant,
    ) -> Result<(), BackendError> {
        let soffice_path = self.get_soffice_path();

        let mut command = Command::new(&soffice_path);
        command
            .args(&self.leading_args)
            .arg("--headless")
            .arg("--norestore")
            // Private profile so runs never touch the user's installation.
            .arg(format!("-env:UserInstallation=file://{}", profile_dir.display()))
            .arg("--convert-to")
            .arg(target.extension())
            .arg("--outdir")
            .arg(output_dir)
            .arg(input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // soffice forks helpers; the guard kills the whole group on every
        // return path, including the future being dropped.
        let (child, _group) = spawn_grouped(&mut command).map_err(|e| {
            BackendError::unavailable(format!("LibreOffice not found at {}: {}", soffice_path, e))
        })?;

        let output = match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(BackendError::timeout(
                    "LibreOffice conversion timed out; process terminated",
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::unavailable(format!(
                "LibreOffice conversion failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        debug!("LibreOffice stdout: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}

impl Default for LibreOfficeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConvertBackend for LibreOfficeEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Office
    }

    async fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let known = *self.availability.lock();
        if let Some(known) = known {
            return known;
        }

        // The version check is an invocation like any other and takes a turn
        // at the gate.
        let deadline = Instant::now() + self.version_check_timeout;
        let Ok(_turn) = tokio::time::timeout_at(deadline, self.gate.lock()).await else {
            warn!("Office engine busy; availability unknown");
            return false;
        };
        let left = deadline.saturating_duration_since(Instant::now());

        let mut command = Command::new(self.get_soffice_path());
        command.args(&self.leading_args).arg("--version");
        let available = check_version(command, left).await;
        *self.availability.lock() = Some(available);
        available
    }

    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError> {
        if !self.enabled {
            return Err(BackendError::unavailable(
                "office suite is not installed on this host",
            ));
        }

        let _turn = tokio::time::timeout_at(attempt.deadline, self.gate.lock())
            .await
            .map_err(|_| BackendError::timeout("timed out waiting for the office engine"))?;

        let input_path = attempt
            .work_dir
            .join(format!("input.{}", attempt.source.extension()));
        let output_dir = attempt.work_dir.join("out");
        let profile_dir = attempt.work_dir.join("profile");
        tokio::fs::write(&input_path, attempt.input).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        info!(
            "Converting {} -> {} using LibreOffice",
            attempt.source, attempt.target
        );
        self.run_soffice(
            &input_path,
            &output_dir,
            &profile_dir,
            attempt.target,
            attempt.deadline,
        )
        .await?;

        // LibreOffice names the output after the input's stem
        let output_path = output_dir.join(format!("input.{}", attempt.target.extension()));
        let data = tokio::fs::read(&output_path).await.map_err(|_| {
            BackendError::unavailable("LibreOffice finished but produced no output file")
        })?;
        if data.is_empty() {
            return Err(BackendError::unavailable("LibreOffice produced an empty file"));
        }

        Ok(data)
    }
}
