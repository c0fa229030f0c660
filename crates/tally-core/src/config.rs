//! Configuration management for Tally
//!
//! Process-wide settings read once at startup: default portal credentials, storage
//! directories, browser launch options, workflow timeouts, and token expiry policy.
//! Values come from a TOML file (every field has a default) and are then overlaid by
//! `TALLY_*` environment variables, with a `.env` file honoured when present.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Credentials, Result, TallyError};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "tally.toml";

/// Top-level Tally configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    /// HTTP listener and public URL
    #[serde(default)]
    pub server: ServerSettings,

    /// Credentials used when a request omits them
    #[serde(default)]
    pub defaults: DefaultCredentials,

    /// Managed storage directories
    #[serde(default)]
    pub storage: StorageSettings,

    /// Headless browser launch options
    #[serde(default)]
    pub browser: BrowserSettings,

    /// Timeouts and concurrency for workflow runs
    #[serde(default)]
    pub workflow: WorkflowSettings,

    /// Download token expiry policy
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Which portal the report workflow targets
    #[serde(default)]
    pub portal: PortalSelection,

    /// Optional second portal used for cookie capture
    #[serde(default)]
    pub cookie_portal: Option<CookiePortalSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL for `report_url` / `view_all_url`; derived from host/port if unset
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Process-wide fallback credentials
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DefaultCredentials {
    #[serde(default)]
    pub company_code: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root for `downloads/`, `artifacts/` and `debug/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: Option<String>,

    /// Chrome/Chromium binary; auto-detected when unset
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,

    /// Pass `--disable-dev-shm-usage` (small /dev/shm in containers)
    #[serde(default = "default_true")]
    pub disable_dev_shm: bool,

    #[serde(default)]
    pub sandbox: bool,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// All workflow timeouts are in milliseconds unless the name says otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Wait for a form field or control to appear
    #[serde(default = "default_element_wait_ms")]
    pub element_wait_ms: u64,

    /// Wait for the post-login landing indicator
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,

    #[serde(default = "default_new_window_timeout_ms")]
    pub new_window_timeout_ms: u64,

    #[serde(default = "default_url_change_timeout_ms")]
    pub url_change_timeout_ms: u64,

    #[serde(default = "default_dom_marker_timeout_ms")]
    pub dom_marker_timeout_ms: u64,

    #[serde(default = "default_detection_poll_ms")]
    pub detection_poll_ms: u64,

    /// Wait for an export control in the result context
    #[serde(default = "default_export_wait_ms")]
    pub export_wait_ms: u64,

    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,

    #[serde(default = "default_download_poll_ms")]
    pub download_poll_ms: u64,

    /// Per-capture limit when recording a failed run
    #[serde(default = "default_debug_capture_timeout_ms")]
    pub debug_capture_timeout_ms: u64,

    /// Hard deadline for a whole run, in seconds
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,

    /// Maximum simultaneous browser sessions; extra requests queue
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Portal time zone for "today"; host local time when unset
    #[serde(default)]
    pub portal_utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,

    /// How long an expired entry keeps answering `Expired` before it is purged
    #[serde(default = "default_retention_after_expiry_secs")]
    pub retention_after_expiry_secs: u64,

    #[serde(default = "default_true")]
    pub delete_files_on_purge: bool,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSelection {
    /// Built-in profile name
    #[serde(default = "default_profile")]
    pub profile: String,

    /// TOML file with a full profile; overrides `profile`
    #[serde(default)]
    pub profile_file: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CookiePortalSettings {
    #[serde(default = "default_cookie_profile")]
    pub profile: String,

    /// Page to open after login before reading cookies
    pub target_url: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub password: String,
}

// Default value providers
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

fn default_user_agent() -> Option<String> {
    Some(
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/120.0.0.0 Safari/537.36"
            .to_string(),
    )
}

fn default_page_load_timeout_secs() -> u64 {
    30
}

fn default_element_wait_ms() -> u64 {
    10_000
}

fn default_login_timeout_ms() -> u64 {
    15_000
}

fn default_new_window_timeout_ms() -> u64 {
    5_000
}

fn default_url_change_timeout_ms() -> u64 {
    3_000
}

fn default_dom_marker_timeout_ms() -> u64 {
    15_000
}

fn default_detection_poll_ms() -> u64 {
    250
}

fn default_export_wait_ms() -> u64 {
    15_000
}

fn default_download_timeout_ms() -> u64 {
    30_000
}

fn default_download_poll_ms() -> u64 {
    500
}

fn default_debug_capture_timeout_ms() -> u64 {
    10_000
}

fn default_request_deadline_secs() -> u64 {
    180
}

fn default_max_concurrent_runs() -> usize {
    2
}

fn default_artifact_ttl_secs() -> u64 {
    3600
}

fn default_retention_after_expiry_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_profile() -> String {
    "sekure-id".to_string()
}

fn default_cookie_profile() -> String {
    "vollna".to_string()
}

impl TallyConfig {
    /// Load configuration from `path` or use defaults, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        // A missing .env is normal.
        dotenvy::dotenv().ok();

        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file or use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| TallyError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| TallyError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `TALLY_*` variables looked up through `var`
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("TALLY_COMPANY_CODE") {
            self.defaults.company_code = v;
        }
        if let Some(v) = var("TALLY_USERNAME") {
            self.defaults.username = v;
        }
        if let Some(v) = var("TALLY_PASSWORD") {
            self.defaults.password = v;
        }
        if let Some(v) = var("TALLY_BASE_URL") {
            self.server.base_url = Some(v);
        }
        if let Some(v) = var("TALLY_PORT") {
            self.server.port = v
                .trim()
                .parse()
                .map_err(|_| TallyError::Config(format!("TALLY_PORT is not a valid port: {:?}", v)))?;
        }
        if let Some(v) = var("TALLY_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TALLY_CHROME_PATH") {
            self.browser.chrome_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject values that would make every run fail
    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_concurrent_runs == 0 {
            return Err(TallyError::Config(
                "workflow.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.workflow.detection_poll_ms == 0 || self.workflow.download_poll_ms == 0 {
            return Err(TallyError::Config(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if self.registry.artifact_ttl_secs == 0 {
            return Err(TallyError::Config(
                "registry.artifact_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerSettings {
    /// Address to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL used when building links in responses, without trailing slash
    pub fn public_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

impl DefaultCredentials {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.company_code, &self.username, &self.password)
    }
}

impl std::fmt::Debug for DefaultCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultCredentials")
            .field("company_code", &self.company_code)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

impl std::fmt::Debug for CookiePortalSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookiePortalSettings")
            .field("profile", &self.profile)
            .field("target_url", &self.target_url)
            .field("email", &self.email)
            .field("password", &"****")
            .finish()
    }
}

impl StorageSettings {
    /// Per-run browser download directories live here
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Completed artifacts are moved here
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    /// Debug sessions are written here
    pub fn debug_dir(&self) -> PathBuf {
        self.data_dir.join("debug")
    }
}

impl WorkflowSettings {
    pub fn element_wait(&self) -> Duration {
        Duration::from_millis(self.element_wait_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn detection_poll(&self) -> Duration {
        Duration::from_millis(self.detection_poll_ms)
    }

    pub fn export_wait(&self) -> Duration {
        Duration::from_millis(self.export_wait_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn download_poll(&self) -> Duration {
        Duration::from_millis(self.download_poll_ms)
    }

    pub fn debug_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.debug_capture_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

impl RegistrySettings {
    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn retention_after_expiry(&self) -> Duration {
        Duration::from_secs(self.retention_after_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: default_window_width(),
            window_height: default_window_height(),
            user_agent: default_user_agent(),
            chrome_path: None,
            page_load_timeout_secs: default_page_load_timeout_secs(),
            disable_dev_shm: true,
            sandbox: false,
            extra_args: Vec::new(),
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            element_wait_ms: default_element_wait_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            new_window_timeout_ms: default_new_window_timeout_ms(),
            url_change_timeout_ms: default_url_change_timeout_ms(),
            dom_marker_timeout_ms: default_dom_marker_timeout_ms(),
            detection_poll_ms: default_detection_poll_ms(),
            export_wait_ms: default_export_wait_ms(),
            download_timeout_ms: default_download_timeout_ms(),
            download_poll_ms: default_download_poll_ms(),
            debug_capture_timeout_ms: default_debug_capture_timeout_ms(),
            request_deadline_secs: default_request_deadline_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            portal_utc_offset_minutes: None,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            artifact_ttl_secs: default_artifact_ttl_secs(),
            retention_after_expiry_secs: default_retention_after_expiry_secs(),
            delete_files_on_purge: true,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for PortalSelection {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            profile_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TallyConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.portal.profile, "sekure-id");
        assert_eq!(config.registry.artifact_ttl_secs, 3600);
        assert_eq!(config.workflow.max_concurrent_runs, 2);
        assert!(config.browser.headless);
        assert!(config.cookie_portal.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [workflow]
            download_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.workflow.download_timeout(), Duration::from_secs(5));
        assert_eq!(config.workflow.element_wait_ms, 10_000);
    }

    #[test]
    fn test_write_and_load_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf/tally.toml");
        TallyConfig::write_default(&path).unwrap();
        let loaded = TallyConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.server.port, 8000);
        assert_eq!(loaded.storage.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let loaded = TallyConfig::load_or_default(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.portal.profile, "sekure-id");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = TallyConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TALLY_COMPANY_CODE", "85"),
            ("TALLY_USERNAME", "ops"),
            ("TALLY_PASSWORD", "secret"),
            ("TALLY_BASE_URL", "https://reports.example.com/"),
            ("TALLY_PORT", "9100"),
            ("TALLY_DATA_DIR", "/srv/tally"),
        ]
        .into_iter()
        .collect();

        let mut config = TallyConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        let creds = config.defaults.credentials();
        assert_eq!(creds.company_code, "85");
        assert_eq!(creds.username, "ops");
        assert_eq!(creds.password, "secret");
        assert_eq!(config.server.public_base_url(), "https://reports.example.com");
        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.storage.artifacts_dir(),
            PathBuf::from("/srv/tally/artifacts")
        );
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = TallyConfig::default();
        let result = config.apply_env(|k| (k == "TALLY_PORT").then(|| "not-a-port".to_string()));
        assert!(matches!(result, Err(TallyError::Config(msg)) if msg.contains("TALLY_PORT")));
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_debug_capture_timeout_from_toml() {
        let config: TallyConfig = toml::from_str(
            r#"
            [workflow]
            debug_capture_timeout_ms = 750
            "#,
        )
        .unwrap();
        assert_eq!(config.workflow.debug_capture_timeout(), Duration::from_millis(750));
        assert_eq!(
            TallyConfig::default().workflow.debug_capture_timeout(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_public_base_url_fallback() {
        let settings = ServerSettings::default();
        assert_eq!(settings.public_base_url(), "http://localhost:8000");
        assert_eq!(settings.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = TallyConfig::default();
        config.workflow.max_concurrent_runs = 0;
        assert!(matches!(config.validate(), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_default_credentials_debug_redacts() {
        let creds = DefaultCredentials {
            company_code: "85".to_string(),
            username: "ops".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
