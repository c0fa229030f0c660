//! The browser session capability and its scoped owner
//!
//! Workflow code never touches a concrete browser: it drives a [`PortalSession`]
//! obtained from a [`SessionLauncher`] and held by a [`SessionGuard`], which closes
//! the session on every exit path.

use async_trait::async_trait;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tally_core::{
    poll_until, BrowserCookie, CancellationToken, ConsoleEntry, Locator, PollOutcome, PollSpec,
    Result, TallyError, WindowHandle,
};
use tracing::debug;

/// One isolated browser instance with its own process, profile and cookies.
///
/// Methods take `&self`; switching the active window is interior state so the
/// session can be shared by reference through a run.
#[async_trait]
pub trait PortalSession: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Directory the browser saves downloads into
    fn download_dir(&self) -> &Path;

    /// Load `url` and block until the page's load event
    async fn navigate(&self, url: &str) -> Result<()>;

    /// URL of the active window
    async fn current_url(&self) -> Result<String>;

    /// All open windows/tabs
    async fn window_handles(&self) -> Result<Vec<WindowHandle>>;

    /// Make `handle` the window subsequent calls operate on
    async fn switch_to_window(&self, handle: &WindowHandle) -> Result<()>;

    async fn element_exists(&self, locator: &Locator) -> Result<bool>;

    /// Visible text of the element, `None` when it does not exist
    async fn element_text(&self, locator: &Locator) -> Result<Option<String>>;

    /// Clear the field and enter `value`
    async fn fill(&self, locator: &Locator, value: &str) -> Result<()>;

    async fn click(&self, locator: &Locator) -> Result<()>;

    /// Evaluate JavaScript in the active window
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Full-page PNG of the active window
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Rendered markup of the active window
    async fn page_source(&self) -> Result<String>;

    /// Console/log entries collected since launch
    async fn console_entries(&self) -> Result<Vec<ConsoleEntry>>;

    async fn cookies(&self) -> Result<Vec<BrowserCookie>>;

    /// Terminate the browser and release its profile directory. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Per-run launch parameters
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: String,
    pub download_dir: PathBuf,
}

/// Creates isolated sessions; each call starts a dedicated browser process
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn open(&self, options: SessionOptions) -> Result<Box<dyn PortalSession>>;
}

/// Scoped owner of a session: closes it when dropped
pub struct SessionGuard {
    session: Box<dyn PortalSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn PortalSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &dyn PortalSession {
        self.session.as_ref()
    }

    /// Close now instead of at drop
    pub fn close(mut self) {
        self.session.close();
    }
}

impl Deref for SessionGuard {
    type Target = dyn PortalSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            debug!("SessionGuard closing session {}", self.session.id());
            self.session.close();
        }
    }
}

/// Treat a failed probe as "not yet" unless the session itself is gone.
///
/// Pages mid-navigation routinely fail script evaluation; that is a reason to poll
/// again, not to abort the wait.
pub fn probe_result<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(TallyError::SessionClosed) => Err(TallyError::SessionClosed),
        Err(e) => {
            debug!("Probe failed, retrying: {}", e);
            Ok(None)
        }
    }
}

/// Wait until `locator` matches in the active window
pub async fn wait_for_element(
    session: &dyn PortalSession,
    locator: &Locator,
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<PollOutcome<()>> {
    debug!("Waiting for element {} (timeout: {:?})", locator, spec.timeout);
    poll_until(spec, cancel, move || async move {
        let exists = probe_result(session.element_exists(locator).await)?;
        Ok(exists.filter(|found| *found).map(|_| ()))
    })
    .await
}

/// Wait until any of `locators` matches; returns the first that does, in order
pub async fn wait_for_any(
    session: &dyn PortalSession,
    locators: &[Locator],
    spec: PollSpec,
    cancel: &CancellationToken,
) -> Result<PollOutcome<Locator>> {
    poll_until(spec, cancel, move || async move {
        for locator in locators {
            if let Some(true) = probe_result(session.element_exists(locator).await)? {
                return Ok(Some(locator.clone()));
            }
        }
        Ok(None)
    })
    .await
}
