//! Headless browser sessions for Tally portal automation
//!
//! This crate owns everything that talks to a real browser through the Chrome
//! DevTools Protocol (CDP). Workflow code sees only the [`PortalSession`] capability,
//! which keeps it testable against the scripted fake behind the `testing` feature.
//!
//! # Architecture
//!
//! - [`driver`]: The session capability, the launcher seam and the scoped [`SessionGuard`]
//! - [`browser`]: Chrome-backed launcher and session
//! - [`script`]: JavaScript used to find and drive elements by text
//! - [`error`]: Error types for browser operations
//!
//! # Requirements
//!
//! - Chrome or Chromium installed, or `browser.chrome_path` set in the config
//! - Every session launches its own process with a throwaway profile directory

pub mod browser;
pub mod driver;
pub mod error;
pub mod script;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

// Re-export commonly used types
pub use browser::{ChromeConfig, ChromeLauncher, ChromeSession};
pub use driver::{
    probe_result, wait_for_any, wait_for_element, PortalSession, SessionGuard, SessionLauncher,
    SessionOptions,
};
pub use error::{BrowserError, Result};
