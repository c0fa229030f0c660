//! Browser lifecycle management using Chrome DevTools Protocol

use crate::driver::{PortalSession, SessionLauncher, SessionOptions};
use crate::error::{BrowserError, Result};
use crate::script;
use async_trait::async_trait;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Browser as CdpBrowser;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::config::BrowserSettings;
use tally_core::fail_open::fail_open_sync;
use tally_core::{BrowserCookie, ConsoleEntry, Locator, WindowHandle};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Console entries kept per session
const MAX_CONSOLE_ENTRIES: usize = 500;

/// Configuration for browser launch
#[derive(Debug, Clone)]
pub struct ChromeConfig {
    /// Run in headless mode (default: true)
    pub headless: bool,
    /// Browser window width
    pub window_width: u32,
    /// Browser window height
    pub window_height: u32,
    /// User agent string
    pub user_agent: Option<String>,
    /// Chrome binary; auto-detected when None
    pub chrome_path: Option<PathBuf>,
    /// Default timeout for navigation and element waits
    pub page_load_timeout: Duration,
    /// Pass `--disable-dev-shm-usage`
    pub disable_dev_shm: bool,
    /// Keep Chrome's sandbox (off when running as root in a container)
    pub sandbox: bool,
    /// Additional command-line switches
    pub extra_args: Vec<String>,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self::from(&BrowserSettings::default())
    }
}

impl From<&BrowserSettings> for ChromeConfig {
    fn from(settings: &BrowserSettings) -> Self {
        Self {
            headless: settings.headless,
            window_width: settings.window_width,
            window_height: settings.window_height,
            user_agent: settings.user_agent.clone(),
            chrome_path: settings.chrome_path.clone(),
            page_load_timeout: Duration::from_secs(settings.page_load_timeout_secs),
            disable_dev_shm: settings.disable_dev_shm,
            sandbox: settings.sandbox,
            extra_args: settings.extra_args.clone(),
        }
    }
}

impl ChromeConfig {
    /// Command-line switches for a non-interactive portal session
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--disable-software-rasterizer".to_string(),
            "--disable-extensions".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
        ];
        if self.disable_dev_shm {
            args.push("--disable-dev-shm-usage".to_string());
        }
        if !self.sandbox {
            args.push("--disable-setuid-sandbox".to_string());
        }
        if let Some(ua) = &self.user_agent {
            args.push(format!("--user-agent={}", ua));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Launches one Chrome process per session
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    config: ChromeConfig,
}

impl ChromeLauncher {
    pub fn new(config: ChromeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn open(&self, options: SessionOptions) -> Result<Box<dyn PortalSession>> {
        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(config, options))
            .await
            .map_err(|e| BrowserError::Browser(format!("Browser launch task failed: {}", e)))??;
        Ok(Box::new(session))
    }
}

/// Active browser session with Chrome DevTools Protocol
pub struct ChromeSession {
    id: String,
    download_dir: PathBuf,
    /// Dropping the browser terminates the Chrome process
    browser: Option<Browser>,
    active: Mutex<Option<Arc<Tab>>>,
    console: Arc<Mutex<Vec<ConsoleEntry>>>,
    /// Tabs that already forward log entries into `console`
    listening: Mutex<HashSet<String>>,
    page_load_timeout: Duration,
    profile_dir: Option<TempDir>,
}

/// Run a blocking CDP call without stalling the async worker
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(f)
}

impl ChromeSession {
    /// Launch a new isolated browser instance
    pub fn launch(config: ChromeConfig, options: SessionOptions) -> Result<Self> {
        info!(
            "Launching browser for session {} (headless: {}, size: {}x{})",
            options.session_id, config.headless, config.window_width, config.window_height
        );

        std::fs::create_dir_all(&options.download_dir)?;
        let profile_dir = tempfile::Builder::new()
            .prefix("tally-profile-")
            .tempdir()
            .map_err(|e| BrowserError::Browser(format!("Failed to create profile dir: {}", e)))?;

        let args = config.launch_args();
        let mut launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(config.sandbox)
            .window_size(Some((config.window_width, config.window_height)))
            .idle_browser_timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| BrowserError::Browser(format!("Failed to launch browser: {}", e)))?;
        launch_options.path = config.chrome_path.clone();
        launch_options.user_data_dir = Some(profile_dir.path().to_path_buf());
        launch_options
            .args
            .extend(args.iter().map(|a| OsStr::new(a.as_str())));

        let browser = Browser::new(launch_options)
            .map_err(|e| BrowserError::Browser(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::Browser(format!("Failed to create tab: {}", e)))?;
        tab.set_default_timeout(config.page_load_timeout);

        let download_path = options.download_dir.canonicalize()?;
        tab.call_method(CdpBrowser::SetDownloadBehavior {
            behavior: CdpBrowser::SetDownloadBehaviorBehaviorOption::Allow,
            browser_context_id: None,
            download_path: Some(download_path.to_string_lossy().into_owned()),
            events_enabled: None,
        })
        .map_err(|e| BrowserError::Browser(format!("Failed to set download directory: {}", e)))?;

        let session = Self {
            id: options.session_id,
            download_dir: download_path,
            browser: Some(browser),
            active: Mutex::new(Some(tab.clone())),
            console: Arc::new(Mutex::new(Vec::new())),
            listening: Mutex::new(HashSet::new()),
            page_load_timeout: config.page_load_timeout,
            profile_dir: Some(profile_dir),
        };
        session.listen_for_logs(&tab);

        info!("Browser launched for session {}", session.id);
        Ok(session)
    }

    fn browser(&self) -> Result<&Browser> {
        self.browser.as_ref().ok_or(BrowserError::SessionClosed)
    }

    fn tab(&self) -> Result<Arc<Tab>> {
        self.active
            .lock()
            .map_err(|_| BrowserError::Browser("active tab lock poisoned".to_string()))?
            .clone()
            .ok_or(BrowserError::SessionClosed)
    }

    /// Forward the tab's log domain into the session console buffer
    fn listen_for_logs(&self, tab: &Arc<Tab>) {
        let target = tab.get_target_id().to_string();
        if let Ok(mut listening) = self.listening.lock() {
            if !listening.insert(target.clone()) {
                return;
            }
        }

        if let Err(e) = tab.enable_log() {
            warn!("Console capture unavailable for tab {}: {}", target, e);
            return;
        }

        let sink = self.console.clone();
        let listener = Arc::new(move |event: &Event| {
            if let Event::LogEntryAdded(added) = event {
                let entry = &added.params.entry;
                if let Ok(mut entries) = sink.lock() {
                    if entries.len() < MAX_CONSOLE_ENTRIES {
                        entries.push(ConsoleEntry {
                            level: format!("{:?}", entry.level).to_lowercase(),
                            text: entry.text.clone(),
                            source: entry.url.clone(),
                        });
                    }
                }
            }
        });
        if let Err(e) = tab.add_event_listener(listener) {
            warn!("Failed to attach console listener to tab {}: {}", target, e);
        }
    }

    fn eval_bool(tab: &Tab, script: &str) -> Result<bool> {
        let result = tab
            .evaluate(script, false)
            .map_err(|e| BrowserError::Browser(format!("JavaScript evaluation failed: {}", e)))?;
        Ok(result
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}

#[async_trait]
impl PortalSession for ChromeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        let tab = self.tab()?;

        blocking(|| {
            tab.navigate_to(url).map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            tab.wait_until_navigated()
                .map_err(|e| BrowserError::Navigation {
                    url: url.to_string(),
                    reason: format!("no load event within {:?}: {}", self.page_load_timeout, e),
                })?;
            Ok::<_, BrowserError>(())
        })?;

        info!("Session {} navigated to {}", self.id, url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.tab()?.get_url())
    }

    async fn window_handles(&self) -> Result<Vec<WindowHandle>> {
        let tabs = self
            .browser()?
            .get_tabs()
            .lock()
            .map_err(|_| BrowserError::Browser("tab list lock poisoned".to_string()))?
            .iter()
            .map(|t| WindowHandle::new(t.get_target_id().to_string()))
            .collect();
        Ok(tabs)
    }

    async fn switch_to_window(&self, handle: &WindowHandle) -> Result<()> {
        let tab = self
            .browser()?
            .get_tabs()
            .lock()
            .map_err(|_| BrowserError::Browser("tab list lock poisoned".to_string()))?
            .iter()
            .find(|t| t.get_target_id().as_str() == handle.as_str())
            .cloned()
            .ok_or_else(|| BrowserError::UnknownWindow(handle.to_string()))?;

        tab.set_default_timeout(self.page_load_timeout);
        blocking(|| tab.activate())
            .map_err(|e| BrowserError::Browser(format!("Failed to activate window: {}", e)))?;
        self.listen_for_logs(&tab);

        *self
            .active
            .lock()
            .map_err(|_| BrowserError::Browser("active tab lock poisoned".to_string()))? =
            Some(tab);
        debug!("Session {} switched to window {}", self.id, handle);
        Ok(())
    }

    async fn element_exists(&self, locator: &Locator) -> Result<bool> {
        let tab = self.tab()?;
        blocking(|| Self::eval_bool(&tab, &script::exists_script(locator)))
    }

    async fn element_text(&self, locator: &Locator) -> Result<Option<String>> {
        let value = self.evaluate(&script::text_script(locator)).await?;
        Ok(value.as_str().map(|s| s.trim().to_string()))
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<()> {
        let tab = self.tab()?;
        blocking(|| {
            if let Locator::Css(selector) = locator {
                // Real keystrokes so the page's own input handlers fire.
                let element = tab
                    .find_element(selector)
                    .map_err(|_| BrowserError::ElementNotFound(locator.to_string()))?;
                element
                    .click()
                    .map_err(|e| BrowserError::Browser(format!("Failed to focus {}: {}", locator, e)))?;
                Self::eval_bool(&tab, &script::set_value_script(locator, ""))?;
                element
                    .type_into(value)
                    .map_err(|e| BrowserError::Browser(format!("Failed to type into {}: {}", locator, e)))?;
                Ok(())
            } else if Self::eval_bool(&tab, &script::set_value_script(locator, value))? {
                Ok(())
            } else {
                Err(BrowserError::ElementNotFound(locator.to_string()))
            }
        })
    }

    async fn click(&self, locator: &Locator) -> Result<()> {
        let tab = self.tab()?;
        blocking(|| {
            if let Locator::Css(selector) = locator {
                let element = tab
                    .find_element(selector)
                    .map_err(|_| BrowserError::ElementNotFound(locator.to_string()))?;
                element
                    .click()
                    .map_err(|e| BrowserError::Browser(format!("Failed to click {}: {}", locator, e)))?;
                Ok(())
            } else if Self::eval_bool(&tab, &script::click_script(locator))? {
                Ok(())
            } else {
                Err(BrowserError::ElementNotFound(locator.to_string()))
            }
        })?;
        debug!("Session {} clicked {}", self.id, locator);
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let tab = self.tab()?;
        let result = blocking(|| tab.evaluate(script, false))
            .map_err(|e| BrowserError::Browser(format!("JavaScript evaluation failed: {}", e)))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let tab = self.tab()?;
        blocking(|| tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true))
            .map_err(|e| BrowserError::Browser(format!("CDP capture failed: {}", e)))
    }

    async fn page_source(&self) -> Result<String> {
        let tab = self.tab()?;
        blocking(|| tab.get_content())
            .map_err(|e| BrowserError::Browser(format!("Failed to read page source: {}", e)))
    }

    async fn console_entries(&self) -> Result<Vec<ConsoleEntry>> {
        if self.is_closed() {
            return Err(BrowserError::SessionClosed);
        }
        self.console
            .lock()
            .map(|entries| entries.clone())
            .map_err(|_| BrowserError::Browser("console buffer lock poisoned".to_string()))
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        let tab = self.tab()?;
        let cookies = blocking(|| tab.get_cookies())
            .map_err(|e| BrowserError::Browser(format!("Failed to read cookies: {}", e)))?;
        Ok(cookies
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect())
    }

    fn close(&mut self) {
        if self.browser.is_none() {
            return;
        }
        info!("Closing browser session {}", self.id);

        if let Ok(mut active) = self.active.lock() {
            active.take();
        }
        // Dropping the last Browser handle kills the Chrome process.
        drop(self.browser.take());

        if let Some(dir) = self.profile_dir.take() {
            fail_open_sync("remove_profile_dir", || dir.close().map_err(Into::into));
        }
    }

    fn is_closed(&self) -> bool {
        self.browser.is_none()
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.close();
    }
}
