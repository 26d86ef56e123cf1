use super::native::markdown_document;
use super::process::check_version;
use super::{Attempt, BackendKind, ConvertBackend, ConvertOptions};
use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::formats::Format;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

pub struct ChromiumEngine {
    enabled: bool,
    chrome_path: Option<String>,
    version_check_timeout: Duration,
}

impl ChromiumEngine {
    pub fn new() -> Self {
        Self {
            enabled: true,
            chrome_path: None,
            version_check_timeout: EngineConfig::default().version_check_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            enabled: config.html_render_enabled,
            chrome_path: config.chrome_path.clone(),
            version_check_timeout: config.version_check_timeout,
        }
    }

    pub fn with_chrome_path(mut self, path: impl Into<String>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_version_check_timeout(mut self, timeout: Duration) -> Self {
        self.version_check_timeout = timeout;
        self
    }

    fn chrome_path(&self) -> String {
        self.chrome_path.clone().unwrap_or_else(get_chrome_path)
    }

    /// Launch a browser private to this attempt, render, and shut it down.
    ///
    /// The browser's profile lives in `work_dir`. If the surrounding future
    /// is dropped (deadline, cancellation) the `Browser` is dropped with it,
    /// which kills the Chromium process.
    async fn render(
        &self,
        html_path: &Path,
        work_dir: &Path,
        target: Format,
        options: &ConvertOptions,
    ) -> Result<Vec<u8>, BackendError> {
        let config = BrowserConfig::builder()
            .chrome_executable(self.chrome_path())
            .user_data_dir(work_dir.join("chromium-profile"))
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--disable-default-apps")
            .arg("--headless")
            .build()
            .map_err(|e| BackendError::unavailable(format!("Failed to build browser config: {}", e)))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BackendError::unavailable(format!("Failed to launch browser: {}", e)))?;

        let events = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let result = render_page(&browser, html_path, target, options).await;

        if let Err(e) = browser.close().await {
            warn!("Chromium did not close cleanly: {}", e);
        }
        if let Err(e) = browser.wait().await {
            warn!("Failed to reap Chromium: {}", e);
        }
        events.abort();

        result
    }
}

async fn render_page(
    browser: &Browser,
    html_path: &Path,
    target: Format,
    options: &ConvertOptions,
) -> Result<Vec<u8>, BackendError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| BackendError::unavailable(format!("Failed to create new tab: {}", e)))?;

    // goto waits for load to complete
    let input_url = format!("file://{}", html_path.canonicalize()?.display());
    page.goto(&input_url)
        .await
        .map_err(|e| BackendError::invalid_input(format!("Failed to load document: {}", e)))?;

    match target {
        Format::Pdf => print_pdf(&page, options).await,
        Format::Png | Format::Jpg => {
            let format = if target == Format::Png {
                CaptureScreenshotFormat::Png
            } else {
                CaptureScreenshotFormat::Jpeg
            };
            let params = ScreenshotParams::builder()
                .format(format)
                .full_page(true)
                .build();
            page.screenshot(params)
                .await
                .map_err(|e| BackendError::unavailable(format!("Screenshot failed: {}", e)))
        }
        other => Err(BackendError::unavailable(format!(
            "html renderer cannot produce {}",
            other
        ))),
    }
}

async fn print_pdf(page: &Page, options: &ConvertOptions) -> Result<Vec<u8>, BackendError> {
    let mut params = PrintToPdfParams::default();
    params.landscape = Some(options.landscape);
    params.print_background = Some(options.print_background);

    if let Some(ref width) = options.page_width {
        if let Some(inches) = parse_to_inches(width) {
            params.paper_width = Some(inches);
        }
    }
    if let Some(ref height) = options.page_height {
        if let Some(inches) = parse_to_inches(height) {
            params.paper_height = Some(inches);
        }
    }

    page.pdf(params)
        .await
        .map_err(|e| BackendError::unavailable(format!("PDF generation failed: {}", e)))
}

impl Default for ChromiumEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConvertBackend for ChromiumEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::HtmlRender
    }

    async fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut command = Command::new(self.chrome_path());
        command.arg("--version");
        check_version(command, self.version_check_timeout).await
    }

    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError> {
        if !self.enabled {
            return Err(BackendError::unavailable("html renderer is disabled on this host"));
        }

        let html_path = write_html_input(attempt).await?;

        info!(
            "Converting {} -> {} using Chromium (CDP)",
            attempt.source, attempt.target
        );
        let render = self.render(&html_path, attempt.work_dir, attempt.target, attempt.options);
        tokio::time::timeout_at(attempt.deadline, render)
            .await
            .map_err(|_| BackendError::timeout("Chromium rendering timed out; browser terminated"))?
    }
}

/// Write the source as an HTML file in the scratch directory, converting
/// markdown first.
async fn write_html_input(attempt: &Attempt<'_>) -> Result<PathBuf, BackendError> {
    let html_path = attempt.work_dir.join("input.html");
    match attempt.source {
        Format::Html => tokio::fs::write(&html_path, attempt.input).await?,
        Format::Md => {
            let md = std::str::from_utf8(attempt.input)
                .map_err(|e| BackendError::invalid_input(format!("markdown is not UTF-8: {}", e)))?;
            tokio::fs::write(&html_path, markdown_document(md)).await?
        }
        other => {
            return Err(BackendError::unavailable(format!(
                "html renderer cannot read {}",
                other
            )))
        }
    }
    Ok(html_path)
}

fn get_chrome_path() -> String {
    // Check environment variable first
    if let Ok(path) = std::env::var("CHROME_PATH") {
        return path;
    }

    // Fall back to OS-specific defaults
    if cfg!(target_os = "macos") {
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".to_string()
    } else if cfg!(target_os = "windows") {
        r"C:\Program Files\Google\Chrome\Application\chrome.exe".to_string()
    } else {
        for path in &["/usr/bin/chromium", "/usr/bin/chromium-browser", "/usr/bin/google-chrome"] {
            if Path::new(path).exists() {
                return path.to_string();
            }
        }
        "chromium".to_string()
    }
}

/// Parse dimension string (e.g., "8.5in", "210mm") to inches
fn parse_to_inches(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(val) = s.strip_suffix("in") {
        val.trim().parse::<f64>().ok()
    } else if let Some(val) = s.strip_suffix("mm") {
        val.trim().parse::<f64>().ok().map(|v| v / 25.4)
    } else if let Some(val) = s.strip_suffix("cm") {
        val.trim().parse::<f64>().ok().map(|v| v / 2.54)
    } else {
        s.parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use bytes::Bytes;
    use tokio::time::Instant;

    #[test]
    fn parses_page_dimensions() {
        assert_eq!(parse_to_inches("8.5in"), Some(8.5));
        assert!((parse_to_inches("210mm").unwrap() - 8.2677).abs() < 1e-3);
        assert!((parse_to_inches(" 2.54cm ").unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(parse_to_inches("11"), Some(11.0));
        assert_eq!(parse_to_inches("wide"), None);
    }

    #[tokio::test]
    async fn markdown_is_written_as_html() {
        let dir = tempfile::tempdir().unwrap();
        let input = Bytes::from_static(b"# Heading\n\nbody");
        let options = ConvertOptions::default();
        let attempt = Attempt {
            input: &input,
            source: Format::Md,
            target: Format::Pdf,
            deadline: Instant::now() + Duration::from_secs(5),
            work_dir: dir.path(),
            options: &options,
        };
        let path = write_html_input(&attempt).await.unwrap();
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("<h1>Heading</h1>"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_version_check_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("chromium");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let engine = ChromiumEngine::new()
            .with_chrome_path(script.display().to_string())
            .with_version_check_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(!engine.is_available().await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn disabled_renderer_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ChromiumEngine::from_config(&EngineConfig {
            html_render_enabled: false,
            ..EngineConfig::default()
        });
        let input = Bytes::from_static(b"<p>x</p>");
        let options = ConvertOptions::default();
        let attempt = Attempt {
            input: &input,
            source: Format::Html,
            target: Format::Pdf,
            deadline: Instant::now() + Duration::from_secs(5),
            work_dir: dir.path(),
            options: &options,
        };
        let err = engine.attempt(&attempt).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::BackendUnavailable);
        assert!(!engine.is_available().await);
    }
}
