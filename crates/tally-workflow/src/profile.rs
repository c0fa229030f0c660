//! Portal profiles: the selectors and URLs one target portal needs
//!
//! The orchestration skeleton is shared; everything portal-specific lives in a
//! [`PortalProfile`], either one of the built-ins or a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tally_core::config::PortalSelection;
use tally_core::{CredentialField, Locator, Result, TallyError};

/// One form field on the login page and the credential it receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginField {
    pub field: CredentialField,
    pub locator: Locator,
}

/// Evidence that login succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LandingIndicator {
    /// Current URL contains the fragment
    UrlContains(String),
    /// Current URL differs from the login URL
    UrlChanged,
    /// Element present in the DOM
    Element(Locator),
}

/// One way to ask the result context for the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExportMethod {
    /// Click an element once it is present
    Click(Locator),
    /// Evaluate a script; it must evaluate to `true` to count as activated
    Script(String),
}

impl ExportMethod {
    pub fn describe(&self) -> String {
        match self {
            ExportMethod::Click(locator) => format!("click {}", locator),
            ExportMethod::Script(_) => "script".to_string(),
        }
    }
}

/// The report page and what happens after it is submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPage {
    pub url: String,
    pub date_field: Locator,
    /// chrono format the date field expects
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Submit controls, tried in order
    pub submit_candidates: Vec<Locator>,
    /// "Report ready" elements for the DOM-marker strategy
    #[serde(default)]
    pub markers: Vec<Locator>,
    /// Export chain run in the detected context
    #[serde(default)]
    pub export: Vec<ExportMethod>,
}

fn default_date_format() -> String {
    tally_core::REPORT_DATE_FORMAT.to_string()
}

/// Which files in the download directory count as the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRules {
    /// Glob patterns on the file name
    pub patterns: Vec<String>,
    /// Suffixes of files the browser is still writing
    #[serde(default)]
    pub ignored_suffixes: Vec<String>,
    /// Stored artifact is named `{prefix}_{date}.{ext}`
    pub artifact_prefix: String,
}

impl Default for DownloadRules {
    fn default() -> Self {
        Self {
            patterns: vec!["*.xlsx".to_string(), "*.xls".to_string()],
            ignored_suffixes: vec![".crdownload".to_string(), ".tmp".to_string()],
            artifact_prefix: "attendance_report".to_string(),
        }
    }
}

/// Everything portal-specific about a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalProfile {
    pub name: String,
    pub login_url: String,
    pub login_fields: Vec<LoginField>,
    pub login_submit: Locator,
    pub landing: Vec<LandingIndicator>,
    /// Visible error message shown on rejected credentials
    #[serde(default)]
    pub login_error: Option<Locator>,
    /// Absent for profiles used only for cookie capture
    #[serde(default)]
    pub report: Option<ReportPage>,
    #[serde(default)]
    pub download: DownloadRules,
}

const SEKURE_ID: &str = "sekure-id";
const VOLLNA: &str = "vollna";

impl PortalProfile {
    /// Names of the built-in profiles
    pub fn builtin_names() -> &'static [&'static str] {
        &[SEKURE_ID, VOLLNA]
    }

    /// Look up a built-in profile by name
    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            SEKURE_ID => Ok(Self::sekure_id()),
            VOLLNA => Ok(Self::vollna()),
            other => Err(TallyError::UnknownProfile(other.to_string())),
        }
    }

    /// Resolve the configured profile: a TOML file wins over the built-in name
    pub fn from_selection(selection: &PortalSelection) -> Result<Self> {
        match &selection.profile_file {
            Some(path) => Self::load(path),
            None => Self::builtin(&selection.profile),
        }
    }

    /// Load a profile from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TallyError::Config(format!(
                "Failed to read profile {}: {}",
                path.display(),
                e
            ))
        })?;
        let profile: Self = toml::from_str(&content).map_err(|e| {
            TallyError::Config(format!(
                "Failed to parse profile {}: {}",
                path.display(),
                e
            ))
        })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.login_fields.is_empty() {
            return Err(TallyError::Config(format!(
                "profile {} has no login fields",
                self.name
            )));
        }
        if self.landing.is_empty() {
            return Err(TallyError::Config(format!(
                "profile {} has no landing indicators",
                self.name
            )));
        }
        if let Some(report) = &self.report {
            if report.submit_candidates.is_empty() {
                return Err(TallyError::Config(format!(
                    "profile {} has no report submit candidates",
                    self.name
                )));
            }
        }
        for pattern in &self.download.patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                TallyError::Config(format!("invalid download pattern {}: {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// Attendance reports from cloud.sekure-id.com
    pub fn sekure_id() -> Self {
        Self {
            name: SEKURE_ID.to_string(),
            login_url: "https://cloud.sekure-id.com/".to_string(),
            login_fields: vec![
                LoginField {
                    field: CredentialField::CompanyCode,
                    locator: Locator::css("#Company_code"),
                },
                LoginField {
                    field: CredentialField::Username,
                    locator: Locator::css("#Username"),
                },
                LoginField {
                    field: CredentialField::Password,
                    locator: Locator::css("#pass"),
                },
            ],
            login_submit: Locator::css("#Login"),
            landing: vec![LandingIndicator::UrlChanged],
            login_error: Some(Locator::css(
                ".validation-summary-errors, .alert-danger, .field-validation-error",
            )),
            report: Some(ReportPage {
                url: "https://cloud.sekure-id.com/DailyReports".to_string(),
                date_field: Locator::css("#Date"),
                date_format: default_date_format(),
                submit_candidates: vec![
                    Locator::button_text("View"),
                    Locator::button_text("Report"),
                    Locator::css("button[type='submit']"),
                ],
                markers: vec![
                    Locator::css("a[onclick*=\"exportReport\"]"),
                    Locator::partial_link_text("Excel"),
                ],
                export: vec![
                    ExportMethod::Click(Locator::link_text("Excel")),
                    ExportMethod::Click(Locator::partial_link_text("Excel")),
                    ExportMethod::Script(EXPORT_LINK_SCRIPT.to_string()),
                    ExportMethod::Script(REPORT_VIEWER_EXPORT_SCRIPT.to_string()),
                ],
            }),
            download: DownloadRules::default(),
        }
    }

    /// Vollna dashboard; login and cookie capture only
    pub fn vollna() -> Self {
        Self {
            name: VOLLNA.to_string(),
            login_url: "https://www.vollna.com/login".to_string(),
            login_fields: vec![
                LoginField {
                    field: CredentialField::Username,
                    locator: Locator::css("input[name='email']"),
                },
                LoginField {
                    field: CredentialField::Password,
                    locator: Locator::css("input[name='password']"),
                },
            ],
            login_submit: Locator::css("button[type='submit']"),
            landing: vec![LandingIndicator::UrlChanged],
            login_error: Some(Locator::css(".alert-danger, .invalid-feedback")),
            report: None,
            download: DownloadRules::default(),
        }
    }
}

/// Clicks the report viewer's Excel export link
pub const EXPORT_LINK_SCRIPT: &str = r#"(function() {
    var links = document.querySelectorAll('a[onclick*="exportReport"]');
    for (var i = 0; i < links.length; i++) {
        if (links[i].title === 'Excel' || (links[i].innerText || '').includes('Excel')) {
            links[i].click();
            return true;
        }
    }
    return false;
})()"#;

/// Asks the ASP.NET report viewer to export directly
pub const REPORT_VIEWER_EXPORT_SCRIPT: &str = r#"(function() {
    if (typeof $find !== 'function') { return false; }
    var viewer = $find('ReportViewer1');
    if (!viewer) { return false; }
    viewer.exportReport('EXCELOPENXML');
    return true;
})()"#;
