//! Forensic captures taken when a run fails
//!
//! Each capture kind has its own failure boundary and its own time limit: a
//! crashed renderer that cannot screenshot may still hand over its markup.
//! Sessions are persisted under `debug/debug_{id}/` with a `session.json` manifest.

use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tally_browser::PortalSession;
use tally_core::fail_open::fail_open;
use tally_core::{
    debug_dir_name, CaptureFailure, CaptureKind, CapturedFile, DebugContext, DebugSession,
    Result, TallyError,
};
use tracing::{debug, info, warn};

/// Manifest file written next to the captures
pub const MANIFEST_FILE: &str = "session.json";

/// Upper bound for any single capture when no workflow setting applies
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fresh correlation id: sortable timestamp plus random suffix
pub fn new_debug_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &random[..12])
}

/// Ids are embedded in paths; only accept what [`new_debug_id`] produces
pub fn is_valid_debug_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Captures diagnostics from a session into the debug directory
#[derive(Debug, Clone)]
pub struct DebugRecorder {
    debug_dir: PathBuf,
    capture_timeout: Duration,
}

impl DebugRecorder {
    pub fn new(debug_dir: impl Into<PathBuf>) -> Self {
        Self {
            debug_dir: debug_dir.into(),
            capture_timeout: CAPTURE_TIMEOUT,
        }
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    pub fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    /// Attempt every capture kind independently and persist what succeeded.
    ///
    /// Never fails: without a session, or when the session is dead, the returned
    /// DebugSession records each kind as a capture failure.
    pub async fn capture(
        &self,
        session: Option<&dyn PortalSession>,
        context: DebugContext,
    ) -> DebugSession {
        let debug_id = new_debug_id();
        let dir = self.debug_dir.join(debug_dir_name(&debug_id));
        let mut files = Vec::new();
        let mut failures = Vec::new();

        let dir_ready = std::fs::create_dir_all(&dir)
            .map_err(|e| format!("could not create {}: {}", dir.display(), e));

        for kind in CaptureKind::ALL {
            let attempt = match (&dir_ready, session) {
                (Err(reason), _) => Err(reason.clone()),
                (Ok(()), None) => Err("no browser session available".to_string()),
                (Ok(()), Some(session)) => self.capture_one(session, kind, &dir).await,
            };
            match attempt {
                Ok(file) => files.push(file),
                Err(error) => {
                    debug!("Debug {}: {} capture failed: {}", debug_id, kind, error);
                    failures.push(CaptureFailure { kind, error });
                }
            }
        }

        let page_url = match session {
            Some(session) => {
                tokio::time::timeout(self.capture_timeout, session.current_url())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            }
            None => None,
        };

        let debug_session = DebugSession {
            debug_id,
            created_at: Utc::now(),
            context,
            page_url,
            files,
            failures,
        };

        if dir_ready.is_ok() {
            let manifest = dir.join(MANIFEST_FILE);
            fail_open("debug_manifest", || async {
                let json = serde_json::to_vec_pretty(&debug_session)?;
                tokio::fs::write(&manifest, json).await?;
                Ok::<_, TallyError>(())
            })
            .await;
        }

        info!(
            "Debug session {} recorded for run {} ({} captured, {} failed)",
            debug_session.debug_id,
            debug_session.context.run_id,
            debug_session.files.len(),
            debug_session.failures.len()
        );
        debug_session
    }

    async fn capture_one(
        &self,
        session: &dyn PortalSession,
        kind: CaptureKind,
        dir: &Path,
    ) -> std::result::Result<CapturedFile, String> {
        let bytes = tokio::time::timeout(self.capture_timeout, read_capture(session, kind))
            .await
            .map_err(|_| format!("timed out after {:?}", self.capture_timeout))?
            .map_err(|e| e.to_string())?;

        let path = dir.join(kind.file_name());
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("could not write {}: {}", path.display(), e))?;

        Ok(CapturedFile {
            kind,
            file_name: kind.file_name().to_string(),
            path,
            size_bytes: bytes.len() as u64,
        })
    }
}

async fn read_capture(session: &dyn PortalSession, kind: CaptureKind) -> Result<Vec<u8>> {
    match kind {
        CaptureKind::Screenshot => session.screenshot().await,
        CaptureKind::PageSource => session.page_source().await.map(String::into_bytes),
        CaptureKind::ConsoleLog => {
            let entries = session.console_entries().await?;
            Ok(serde_json::to_vec_pretty(&entries)?)
        }
    }
}

/// Process-wide index of debug sessions, backed by the debug directory
pub struct DebugStore {
    debug_dir: PathBuf,
    sessions: DashMap<String, DebugSession>,
}

impl DebugStore {
    pub fn new(debug_dir: impl Into<PathBuf>) -> Self {
        Self {
            debug_dir: debug_dir.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn shared(debug_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(debug_dir))
    }

    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    pub fn insert(&self, session: DebugSession) {
        self.sessions.insert(session.debug_id.clone(), session);
    }

    /// Look up a session in memory, falling back to its manifest on disk
    pub fn get(&self, debug_id: &str) -> Option<DebugSession> {
        if !is_valid_debug_id(debug_id) {
            return None;
        }
        if let Some(found) = self.sessions.get(debug_id) {
            return Some(found.value().clone());
        }
        let loaded = self.load_manifest(debug_id).ok()?;
        self.sessions.insert(debug_id.to_string(), loaded.clone());
        Some(loaded)
    }

    /// All sessions, newest first, including those written by earlier processes
    pub fn list(&self) -> Vec<DebugSession> {
        if let Ok(entries) = std::fs::read_dir(&self.debug_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(id) = name.strip_prefix("debug_") {
                    if is_valid_debug_id(id) && !self.sessions.contains_key(id) {
                        match self.load_manifest(id) {
                            Ok(session) => {
                                self.sessions.insert(id.to_string(), session);
                            }
                            Err(e) => warn!("Skipping debug dir {}: {}", name, e),
                        }
                    }
                }
            }
        }

        let mut sessions: Vec<DebugSession> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.debug_id.cmp(&a.debug_id))
        });
        sessions
    }

    /// Path of a captured file, only if the session's manifest lists it
    pub fn file_path(&self, debug_id: &str, file_name: &str) -> Option<PathBuf> {
        let session = self.get(debug_id)?;
        session.file(file_name)?;
        Some(
            self.debug_dir
                .join(debug_dir_name(debug_id))
                .join(file_name),
        )
    }

    fn load_manifest(&self, debug_id: &str) -> Result<DebugSession> {
        let path = self
            .debug_dir
            .join(debug_dir_name(debug_id))
            .join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| TallyError::Debug(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }
}
