//! Engine configuration.
//!
//! Every knob lives in [`EngineConfig`]. Defaults follow what the service has
//! always shipped with; [`EngineConfig::from_env`] overrides them from the
//! process environment at startup.

use crate::engines::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Is the office-suite engine installed on this host.
    pub office_enabled: bool,
    /// Explicit path to `soffice`; resolved from `SOFFICE_PATH` or OS defaults when unset.
    pub soffice_path: Option<String>,

    pub html_render_enabled: bool,
    /// Explicit path to Chromium; resolved from `CHROME_PATH` or OS defaults when unset.
    pub chrome_path: Option<String>,

    pub remote_api_url: String,
    #[serde(skip_serializing)]
    pub remote_api_key: Option<String>,

    /// Try the html-render engine before the office suite when both serve a pair.
    pub prefer_html_render: bool,

    pub native_timeout: Duration,
    pub office_timeout: Duration,
    pub html_render_timeout: Duration,
    pub remote_timeout: Duration,

    /// Upper bound for any request's total deadline.
    pub max_total_deadline: Duration,
    /// Maximum accepted input size in bytes.
    pub max_file_size: usize,

    /// Transient-failure retries per remote API call.
    pub max_retries: u32,
    /// Initial retry delay; doubles after each retry.
    pub retry_backoff_ms: u64,
    /// Delay between remote job status polls.
    pub poll_interval: Duration,

    /// Bound on a single external-engine availability check.
    pub version_check_timeout: Duration,

    /// Directory under which per-request working areas are created.
    pub work_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            office_enabled: true,
            soffice_path: None,
            html_render_enabled: true,
            chrome_path: None,
            remote_api_url: "https://api.docrelay.io/v1".to_string(),
            remote_api_key: None,
            prefer_html_render: true,
            native_timeout: Duration::from_secs(30),
            office_timeout: Duration::from_secs(90),
            html_render_timeout: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(300),
            max_total_deadline: Duration::from_secs(300),
            max_file_size: 50 * 1024 * 1024,
            max_retries: 3,
            retry_backoff_ms: 500,
            poll_interval: Duration::from_secs(5),
            version_check_timeout: Duration::from_secs(10),
            work_root: std::env::temp_dir(),
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<bool>("DOCRELAY_OFFICE_ENABLED") {
            config.office_enabled = v;
        }
        config.soffice_path = std::env::var("SOFFICE_PATH").ok();
        if let Some(v) = env_parse::<bool>("DOCRELAY_HTML_RENDER_ENABLED") {
            config.html_render_enabled = v;
        }
        config.chrome_path = std::env::var("CHROME_PATH").ok();

        if let Ok(url) = std::env::var("DOCRELAY_REMOTE_API_URL") {
            config.remote_api_url = url;
        }
        config.remote_api_key = std::env::var("DOCRELAY_REMOTE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        if let Some(v) = env_parse::<bool>("DOCRELAY_PREFER_HTML_RENDER") {
            config.prefer_html_render = v;
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_NATIVE_TIMEOUT_SECS") {
            config.native_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_OFFICE_TIMEOUT_SECS") {
            config.office_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_HTML_RENDER_TIMEOUT_SECS") {
            config.html_render_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_REMOTE_TIMEOUT_SECS") {
            config.remote_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_MAX_DEADLINE_SECS") {
            config.max_total_deadline = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<usize>("DOCRELAY_MAX_FILE_SIZE") {
            config.max_file_size = bytes;
        }
        if let Some(n) = env_parse::<u32>("DOCRELAY_REMOTE_MAX_RETRIES") {
            config.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("DOCRELAY_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("DOCRELAY_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("DOCRELAY_VERSION_CHECK_TIMEOUT_SECS") {
            config.version_check_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("DOCRELAY_WORK_DIR") {
            config.work_root = PathBuf::from(dir);
        }

        config
    }

    /// Per-attempt ceiling for a backend.
    pub fn timeout_for(&self, kind: BackendKind) -> Duration {
        match kind {
            BackendKind::Native => self.native_timeout,
            BackendKind::Office => self.office_timeout,
            BackendKind::HtmlRender => self.html_render_timeout,
            BackendKind::Remote => self.remote_timeout,
        }
    }

    pub fn remote_configured(&self) -> bool {
        self.remote_api_key.is_some()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.timeout_for(BackendKind::Office), Duration::from_secs(90));
        assert!(config.prefer_html_render);
        assert!(!config.remote_configured());
    }

    #[test]
    fn timing_knobs_come_from_the_environment() {
        std::env::set_var("DOCRELAY_NATIVE_TIMEOUT_SECS", "7");
        std::env::set_var("DOCRELAY_RETRY_BACKOFF_MS", "25");
        std::env::set_var("DOCRELAY_POLL_INTERVAL_MS", "250");
        std::env::set_var("DOCRELAY_VERSION_CHECK_TIMEOUT_SECS", "not a number");
        let config = EngineConfig::from_env();
        std::env::remove_var("DOCRELAY_NATIVE_TIMEOUT_SECS");
        std::env::remove_var("DOCRELAY_RETRY_BACKOFF_MS");
        std::env::remove_var("DOCRELAY_POLL_INTERVAL_MS");
        std::env::remove_var("DOCRELAY_VERSION_CHECK_TIMEOUT_SECS");

        assert_eq!(config.timeout_for(BackendKind::Native), Duration::from_secs(7));
        assert_eq!(config.retry_backoff_ms, 25);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.version_check_timeout, EngineConfig::default().version_check_timeout);
    }

    #[test]
    fn api_key_is_never_serialized() {
        let config = EngineConfig {
            remote_api_key: Some("secret".into()),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
