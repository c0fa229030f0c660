//! Unified error types for Tally

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Tally operations
#[derive(Error, Debug)]
pub enum TallyError {
    // Browser errors
    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Browser session is closed")]
    SessionClosed,

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Unknown window handle: {0}")]
    UnknownWindow(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown portal profile: {0}")]
    UnknownProfile(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Debug capture error: {0}")]
    Debug(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Why a workflow run ended in `Failed`.
///
/// Every kind is recoverable at the request level: the caller may issue a fresh
/// request, which starts a new run with a new browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The browser process could not be started
    SessionLaunchFailed,
    /// Landing indicator never appeared, or the portal showed a login error
    LoginFailed,
    /// Report page or its submit control could not be reached
    TriggerFailed,
    /// Every detection strategy was exhausted
    DetectionFailed,
    /// No export method could be activated in the result context
    ExportFailed,
    /// No stable matching file appeared before the deadline
    DownloadTimeout,
    /// The file could not be moved into managed storage
    StorageFailed,
    /// The request-level deadline fired while the run was in flight
    Cancelled,
}

impl FailureKind {
    /// Stable machine-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionLaunchFailed => "session_launch_failed",
            Self::LoginFailed => "login_failed",
            Self::TriggerFailed => "trigger_failed",
            Self::DetectionFailed => "detection_failed",
            Self::ExportFailed => "export_failed",
            Self::DownloadTimeout => "download_timeout",
            Self::StorageFailed => "storage_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::SessionLaunchFailed => "SessionLaunchFailed",
            Self::LoginFailed => "LoginFailed",
            Self::TriggerFailed => "TriggerFailed",
            Self::DetectionFailed => "DetectionFailed(NotDetected)",
            Self::ExportFailed => "ExportFailed",
            Self::DownloadTimeout => "DownloadTimeout",
            Self::StorageFailed => "StorageFailed",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{}", label)
    }
}
