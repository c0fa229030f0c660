//! Core type definitions for Tally runs

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Date format the HTTP surface and portals exchange
pub const REPORT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Portal login credentials.
///
/// Supplied per request or taken from process-wide defaults. Never persisted and
/// never printed: `Debug` redacts the password.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub company_code: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(
        company_code: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            company_code: company_code.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for one credential field
    pub fn field(&self, field: CredentialField) -> &str {
        match field {
            CredentialField::CompanyCode => &self.company_code,
            CredentialField::Username => &self.username,
            CredentialField::Password => &self.password,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("company_code", &self.company_code)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Which credential a login form field receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialField {
    CompanyCode,
    Username,
    Password,
}

/// One report generation request. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub credentials: Credentials,
    pub report_date: NaiveDate,
}

impl ReportRequest {
    pub fn new(credentials: Credentials, report_date: NaiveDate) -> Self {
        Self {
            credentials,
            report_date,
        }
    }

    /// Request for "today" as the portal sees it
    pub fn for_today(credentials: Credentials, utc_offset_minutes: Option<i32>) -> Self {
        Self::new(credentials, portal_today(utc_offset_minutes))
    }

    /// Report date rendered as `YYYY-MM-DD`
    pub fn date_string(&self) -> String {
        self.report_date.format(REPORT_DATE_FORMAT).to_string()
    }
}

/// Today's date in the portal's locale.
///
/// `None` falls back to the host's local time zone.
pub fn portal_today(utc_offset_minutes: Option<i32>) -> NaiveDate {
    match utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
        Some(offset) => Utc::now().with_timezone(&offset).date_naive(),
        None => Local::now().date_naive(),
    }
}

/// Parse a `YYYY-MM-DD` report date
pub fn parse_report_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), REPORT_DATE_FORMAT).ok()
}

/// Workflow stage a run is in (or failed in)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    LoggingIn,
    Authenticated,
    Triggering,
    Detecting,
    Downloading,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LoggingIn => write!(f, "logging_in"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Triggering => write!(f, "triggering"),
            Self::Detecting => write!(f, "detecting"),
            Self::Downloading => write!(f, "downloading"),
        }
    }
}

/// Opaque identifier of one browser window/tab
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub String);

impl WindowHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to find an element on a portal page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    /// CSS selector
    Css(String),
    /// `<a>` whose visible text equals the value
    LinkText(String),
    /// `<a>` whose visible text contains the value
    PartialLinkText(String),
    /// `<button>` whose visible text contains the value
    ButtonText(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn link_text(text: impl Into<String>) -> Self {
        Self::LinkText(text.into())
    }

    pub fn partial_link_text(text: impl Into<String>) -> Self {
        Self::PartialLinkText(text.into())
    }

    pub fn button_text(text: impl Into<String>) -> Self {
        Self::ButtonText(text.into())
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css:{}", s),
            Self::LinkText(s) => write!(f, "link:{}", s),
            Self::PartialLinkText(s) => write!(f, "partial-link:{}", s),
            Self::ButtonText(s) => write!(f, "button:{}", s),
        }
    }
}

/// Where the generated report surfaced after the trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum DetectionOutcome {
    NewWindowFound(WindowHandle),
    UrlChanged(String),
    ElementFound(Locator),
    NotDetected,
}

impl DetectionOutcome {
    pub fn is_detected(&self) -> bool {
        !matches!(self, Self::NotDetected)
    }
}

/// A completed report file in managed storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Absolute path of the file
    pub path: PathBuf,
    /// File name presented to downloaders
    pub file_name: String,
    /// MIME type
    pub content_type: String,
    /// Size in bytes
    pub size_bytes: u64,
}

/// Kinds of diagnostics captured on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Screenshot,
    PageSource,
    ConsoleLog,
}

impl CaptureKind {
    /// Every kind, in capture order
    pub const ALL: [CaptureKind; 3] = [Self::Screenshot, Self::PageSource, Self::ConsoleLog];

    /// File name inside a debug session directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot.png",
            Self::PageSource => "page_source.html",
            Self::ConsoleLog => "console_log.json",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Screenshot => "image/png",
            Self::PageSource => "text/html",
            Self::ConsoleLog => "application/json",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Screenshot => write!(f, "screenshot"),
            Self::PageSource => write!(f, "page_source"),
            Self::ConsoleLog => write!(f, "console_log"),
        }
    }
}

/// A diagnostic file that was written successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFile {
    pub kind: CaptureKind,
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// A diagnostic kind that could not be captured, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFailure {
    pub kind: CaptureKind,
    pub error: String,
}

/// What was happening when a debug capture was requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugContext {
    pub run_id: String,
    pub stage: Stage,
    pub kind: crate::FailureKind,
    pub reason: String,
}

/// Bundle of diagnostics keyed by a correlation id. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSession {
    pub debug_id: String,
    pub created_at: DateTime<Utc>,
    pub context: DebugContext,
    /// URL of the active tab at capture time, when reachable
    pub page_url: Option<String>,
    pub files: Vec<CapturedFile>,
    pub failures: Vec<CaptureFailure>,
}

impl DebugSession {
    /// Name of the directory holding this session's files
    pub fn dir_name(&self) -> String {
        debug_dir_name(&self.debug_id)
    }

    pub fn file(&self, file_name: &str) -> Option<&CapturedFile> {
        self.files.iter().find(|f| f.file_name == file_name)
    }
}

/// Directory name for a debug id: `debug_{id}`
pub fn debug_dir_name(debug_id: &str) -> String {
    format!("debug_{}", debug_id)
}

/// One browser console/log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
    pub source: Option<String>,
}

/// A cookie read from the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Render cookies as a `Cookie:` header value: `a=1; b=2`
pub fn cookie_header(cookies: &[BrowserCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}
