//! Scripted in-memory portal for exercising workflows without Chrome
//!
//! A [`FakeScript`] describes which elements exist on which URL and what happens
//! when the workflow clicks or evaluates something. [`FakeLauncher`] hands out
//! sessions that follow the script and records every call in a shared journal.

use crate::driver::{PortalSession, SessionLauncher, SessionOptions};
use crate::error::{BrowserError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tally_core::{BrowserCookie, ConsoleEntry, Locator, WindowHandle};

const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-screenshot";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Something the fake portal does in response to a click or script
#[derive(Debug, Clone)]
pub enum FakeEffect {
    /// Active window loads `url`
    Navigate(String),
    /// A new window opens on `url`; the active window does not change
    OpenWindow(String),
    /// Element appears in the active window
    Reveal(Locator),
    /// A finished file lands in the session's download directory
    Download { file_name: String, bytes: Vec<u8> },
    /// Apply the inner effect later
    Delayed(Duration, Box<FakeEffect>),
    /// Browser process dies; every later call fails with `SessionClosed`
    Crash,
}

impl FakeEffect {
    pub fn download(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        FakeEffect::Download {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn after(delay: Duration, effect: FakeEffect) -> Self {
        FakeEffect::Delayed(delay, Box::new(effect))
    }
}

#[derive(Debug, Clone)]
struct ClickRule {
    url: Option<String>,
    locator: Locator,
    effects: Vec<FakeEffect>,
}

#[derive(Debug, Clone)]
struct ScriptRule {
    needle: String,
    value: serde_json::Value,
    effects: Vec<FakeEffect>,
}

/// Behaviour of every session a [`FakeLauncher`] opens
#[derive(Debug, Clone)]
pub struct FakeScript {
    start_url: String,
    pages: HashMap<String, Vec<Locator>>,
    texts: HashMap<Locator, String>,
    clicks: Vec<ClickRule>,
    scripts: Vec<ScriptRule>,
    navigation_effects: HashMap<String, Vec<FakeEffect>>,
    unreachable: Vec<String>,
    console: Vec<ConsoleEntry>,
    cookies: Vec<BrowserCookie>,
    fail_screenshot: bool,
    fail_page_source: bool,
    fail_console: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeScript {
    pub fn new() -> Self {
        Self {
            start_url: "about:blank".to_string(),
            pages: HashMap::new(),
            texts: HashMap::new(),
            clicks: Vec::new(),
            scripts: Vec::new(),
            navigation_effects: HashMap::new(),
            unreachable: Vec::new(),
            console: Vec::new(),
            cookies: Vec::new(),
            fail_screenshot: false,
            fail_page_source: false,
            fail_console: false,
        }
    }

    /// Elements present whenever a window shows `url`
    pub fn page(mut self, url: impl Into<String>, elements: Vec<Locator>) -> Self {
        self.pages.entry(url.into()).or_default().extend(elements);
        self
    }

    /// Text returned by `element_text` for `locator`
    pub fn text(mut self, locator: Locator, text: impl Into<String>) -> Self {
        self.texts.insert(locator, text.into());
        self
    }

    /// Effects of clicking `locator` on any page
    pub fn on_click(mut self, locator: Locator, effects: Vec<FakeEffect>) -> Self {
        self.clicks.push(ClickRule {
            url: None,
            locator,
            effects,
        });
        self
    }

    /// Effects of clicking `locator` only while the active window shows `url`
    pub fn on_click_at(
        mut self,
        url: impl Into<String>,
        locator: Locator,
        effects: Vec<FakeEffect>,
    ) -> Self {
        self.clicks.push(ClickRule {
            url: Some(url.into()),
            locator,
            effects,
        });
        self
    }

    /// Any evaluated script containing `needle` returns `value` and applies `effects`
    pub fn on_script(
        mut self,
        needle: impl Into<String>,
        value: serde_json::Value,
        effects: Vec<FakeEffect>,
    ) -> Self {
        self.scripts.push(ScriptRule {
            needle: needle.into(),
            value,
            effects,
        });
        self
    }

    /// Effects applied right after navigating to `url` (e.g. a server redirect)
    pub fn on_navigate(mut self, url: impl Into<String>, effects: Vec<FakeEffect>) -> Self {
        self.navigation_effects
            .entry(url.into())
            .or_default()
            .extend(effects);
        self
    }

    /// Navigating to `url` fails
    pub fn unreachable(mut self, url: impl Into<String>) -> Self {
        self.unreachable.push(url.into());
        self
    }

    pub fn console(mut self, level: &str, text: &str) -> Self {
        self.console.push(ConsoleEntry {
            level: level.to_string(),
            text: text.to_string(),
            source: None,
        });
        self
    }

    pub fn cookie(mut self, name: &str, value: &str, domain: &str) -> Self {
        self.cookies.push(BrowserCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
        });
        self
    }

    pub fn fail_screenshot(mut self) -> Self {
        self.fail_screenshot = true;
        self
    }

    pub fn fail_page_source(mut self) -> Self {
        self.fail_page_source = true;
        self
    }

    pub fn fail_console(mut self) -> Self {
        self.fail_console = true;
        self
    }
}

#[derive(Debug)]
struct FakeWindow {
    handle: WindowHandle,
    url: String,
    revealed: Vec<Locator>,
}

#[derive(Debug)]
struct FakeState {
    windows: Vec<FakeWindow>,
    active: usize,
    next_window: usize,
    crashed: bool,
}

impl FakeState {
    fn active_window(&mut self) -> &mut FakeWindow {
        let index = self.active.min(self.windows.len().saturating_sub(1));
        &mut self.windows[index]
    }

    fn open_window(&mut self, url: String) {
        let handle = WindowHandle::new(format!("window-{}", self.next_window));
        self.next_window += 1;
        self.windows.push(FakeWindow {
            handle,
            url,
            revealed: Vec::new(),
        });
    }
}

/// Counters and journal shared between a launcher and its sessions
#[derive(Debug, Default)]
struct Shared {
    opened: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    journal: Mutex<Vec<String>>,
    /// (session id, field, value) in fill order
    filled: Mutex<Vec<(String, Locator, String)>>,
    download_dirs: Mutex<Vec<PathBuf>>,
}

impl Shared {
    fn record(&self, call: String) {
        lock(&self.journal).push(call);
    }
}

/// Opens scripted sessions and observes how they are used
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    script: Arc<FakeScript>,
    shared: Arc<Shared>,
    fail_launch: bool,
}

impl FakeLauncher {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script: Arc::new(script),
            shared: Arc::new(Shared::default()),
            fail_launch: false,
        }
    }

    /// Every launch fails as if Chrome were missing
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(FakeScript::new())
        }
    }

    /// Sessions opened and not yet closed
    pub fn live_sessions(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions
    pub fn peak_live_sessions(&self) -> usize {
        self.shared.peak_live.load(Ordering::SeqCst)
    }

    /// Calls made on all sessions, in order
    pub fn journal(&self) -> Vec<String> {
        lock(&self.shared.journal).clone()
    }

    pub fn clear_journal(&self) {
        lock(&self.shared.journal).clear();
    }

    /// Last value entered into `locator`
    pub fn filled(&self, locator: &Locator) -> Option<String> {
        lock(&self.shared.filled)
            .iter()
            .rev()
            .find(|(_, l, _)| l == locator)
            .map(|(_, _, v)| v.clone())
    }

    /// Last value entered into `locator` by the session opened as `session_id`
    pub fn filled_in(&self, session_id: &str, locator: &Locator) -> Option<String> {
        lock(&self.shared.filled)
            .iter()
            .rev()
            .find(|(id, l, _)| id == session_id && l == locator)
            .map(|(_, _, v)| v.clone())
    }

    /// Download directories requested by each launch
    pub fn download_dirs(&self) -> Vec<PathBuf> {
        lock(&self.shared.download_dirs).clone()
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn open(&self, options: SessionOptions) -> Result<Box<dyn PortalSession>> {
        if self.fail_launch {
            return Err(BrowserError::Browser(
                "Failed to launch browser: Could not auto detect a chrome executable".to_string(),
            ));
        }
        std::fs::create_dir_all(&options.download_dir)?;

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_live.fetch_max(live, Ordering::SeqCst);
        lock(&self.shared.download_dirs).push(options.download_dir.clone());

        let mut state = FakeState {
            windows: Vec::new(),
            active: 0,
            next_window: 0,
            crashed: false,
        };
        state.open_window(self.script.start_url.clone());

        Ok(Box::new(FakeSession {
            id: options.session_id,
            download_dir: options.download_dir,
            script: self.script.clone(),
            shared: self.shared.clone(),
            state: Arc::new(Mutex::new(state)),
            closed: false,
        }))
    }
}

/// Session following a [`FakeScript`]
pub struct FakeSession {
    id: String,
    download_dir: PathBuf,
    script: Arc<FakeScript>,
    shared: Arc<Shared>,
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

fn apply_effect(state: &Arc<Mutex<FakeState>>, download_dir: &Path, effect: FakeEffect) {
    match effect {
        FakeEffect::Navigate(url) => {
            let mut state = lock(state);
            let window = state.active_window();
            window.url = url;
            window.revealed.clear();
        }
        FakeEffect::OpenWindow(url) => lock(state).open_window(url),
        FakeEffect::Reveal(locator) => lock(state).active_window().revealed.push(locator),
        FakeEffect::Download { file_name, bytes } => {
            let _ = std::fs::write(download_dir.join(file_name), bytes);
        }
        FakeEffect::Delayed(delay, inner) => {
            let state = state.clone();
            let dir = download_dir.to_path_buf();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                apply_effect(&state, &dir, *inner);
            });
        }
        FakeEffect::Crash => lock(state).crashed = true,
    }
}

impl FakeSession {
    fn check_alive(&self) -> Result<()> {
        if self.closed || lock(&self.state).crashed {
            return Err(BrowserError::SessionClosed);
        }
        Ok(())
    }

    fn call(&self, call: impl Into<String>) -> Result<()> {
        self.shared.record(call.into());
        self.check_alive()
    }

    fn apply_all(&self, effects: &[FakeEffect]) {
        for effect in effects {
            apply_effect(&self.state, &self.download_dir, effect.clone());
        }
    }

    fn active_url(&self) -> String {
        lock(&self.state).active_window().url.clone()
    }

    fn present(&self, locator: &Locator) -> bool {
        let mut state = lock(&self.state);
        let window = state.active_window();
        window.revealed.contains(locator)
            || self
                .script
                .pages
                .get(&window.url)
                .map(|elements| elements.contains(locator))
                .unwrap_or(false)
    }
}

#[async_trait]
impl PortalSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.call(format!("navigate({})", url))?;
        if self.script.unreachable.iter().any(|u| u == url) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            });
        }
        apply_effect(
            &self.state,
            &self.download_dir,
            FakeEffect::Navigate(url.to_string()),
        );
        if let Some(effects) = self.script.navigation_effects.get(url) {
            self.apply_all(effects);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.call("current_url")?;
        Ok(self.active_url())
    }

    async fn window_handles(&self) -> Result<Vec<WindowHandle>> {
        self.call("window_handles")?;
        Ok(lock(&self.state)
            .windows
            .iter()
            .map(|w| w.handle.clone())
            .collect())
    }

    async fn switch_to_window(&self, handle: &WindowHandle) -> Result<()> {
        self.call(format!("switch_to_window({})", handle))?;
        let mut state = lock(&self.state);
        let index = state
            .windows
            .iter()
            .position(|w| &w.handle == handle)
            .ok_or_else(|| BrowserError::UnknownWindow(handle.to_string()))?;
        state.active = index;
        Ok(())
    }

    async fn element_exists(&self, locator: &Locator) -> Result<bool> {
        self.call(format!("element_exists({})", locator))?;
        Ok(self.present(locator))
    }

    async fn element_text(&self, locator: &Locator) -> Result<Option<String>> {
        self.call(format!("element_text({})", locator))?;
        if !self.present(locator) {
            return Ok(None);
        }
        Ok(Some(
            self.script.texts.get(locator).cloned().unwrap_or_default(),
        ))
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<()> {
        self.call(format!("fill({})", locator))?;
        if !self.present(locator) {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        }
        lock(&self.shared.filled).push((self.id.clone(), locator.clone(), value.to_string()));
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<()> {
        self.call(format!("click({})", locator))?;
        if !self.present(locator) {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        }
        let url = self.active_url();
        let effects: Vec<FakeEffect> = self
            .script
            .clicks
            .iter()
            .filter(|rule| &rule.locator == locator)
            .filter(|rule| rule.url.as_deref().map_or(true, |u| u == url))
            .flat_map(|rule| rule.effects.iter().cloned())
            .collect();
        self.apply_all(&effects);
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        self.call("evaluate")?;
        match self.script.scripts.iter().find(|r| script.contains(&r.needle)) {
            Some(rule) => {
                self.apply_all(&rule.effects);
                Ok(rule.value.clone())
            }
            None => Ok(serde_json::Value::Null),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.call("screenshot")?;
        if self.script.fail_screenshot {
            return Err(BrowserError::Browser("CDP capture failed".to_string()));
        }
        Ok(FAKE_PNG.to_vec())
    }

    async fn page_source(&self) -> Result<String> {
        self.call("page_source")?;
        if self.script.fail_page_source {
            return Err(BrowserError::Browser("document unavailable".to_string()));
        }
        Ok(format!(
            "<html><head><title>fake</title></head><body data-url=\"{}\"></body></html>",
            self.active_url()
        ))
    }

    async fn console_entries(&self) -> Result<Vec<ConsoleEntry>> {
        self.call("console_entries")?;
        if self.script.fail_console {
            return Err(BrowserError::Browser("log domain disabled".to_string()));
        }
        Ok(self.script.console.clone())
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        self.call("cookies")?;
        Ok(self.script.cookies.clone())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        self.shared.record("close".to_string());
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.close();
    }
}
