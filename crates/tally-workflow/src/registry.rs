//! Short-lived download tokens for finished artifacts
//!
//! A token is a bearer credential for one file. Expiry is a policy decision:
//! `resolve` reports `Expired` once the TTL has passed even while the file still
//! exists. Entries are kept for a retention window after expiry so callers can tell
//! "expired" from "never existed"; the sweeper purges them afterwards.

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tally_core::fail_open::fail_open_sync;
use tally_core::Artifact;
use tracing::{debug, info};

/// One issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub token: String,
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// 48 hex chars from two v4 UUIDs (over 180 random bits)
fn new_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        &uuid::Uuid::new_v4().simple().to_string()[..16]
    )
}

/// Concurrent token → artifact map
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token for `artifact`, valid for `ttl`
    pub fn register(&self, artifact: Artifact, ttl: Duration) -> RegistryEntry {
        self.register_at(artifact, ttl, Utc::now())
    }

    pub fn register_at(&self, artifact: Artifact, ttl: Duration, now: DateTime<Utc>) -> RegistryEntry {
        let entry = RegistryEntry {
            token: new_token(),
            artifact,
            created_at: now,
            expires_at: now + to_chrono(ttl),
        };
        debug!(
            "Registered {} until {}",
            entry.artifact.file_name, entry.expires_at
        );
        self.entries.insert(entry.token.clone(), entry.clone());
        entry
    }

    /// File path for `token`; `Expired` after the TTL, `NotFound` for unknown or purged tokens
    pub fn resolve(&self, token: &str) -> Result<PathBuf, RegistryError> {
        self.resolve_at(token, Utc::now())
    }

    pub fn resolve_at(&self, token: &str, now: DateTime<Utc>) -> Result<PathBuf, RegistryError> {
        self.lookup_at(token, now).map(|entry| entry.artifact.path)
    }

    /// Full entry for a live token
    pub fn lookup(&self, token: &str) -> Result<RegistryEntry, RegistryError> {
        self.lookup_at(token, Utc::now())
    }

    pub fn lookup_at(&self, token: &str, now: DateTime<Utc>) -> Result<RegistryEntry, RegistryError> {
        let entry = self.entries.get(token).ok_or(RegistryError::NotFound)?;
        if entry.is_expired_at(now) {
            return Err(RegistryError::Expired);
        }
        Ok(entry.value().clone())
    }

    /// Drop entries expired for longer than `retention`, optionally deleting their files.
    /// Returns how many were purged.
    pub fn purge_expired(&self, now: DateTime<Utc>, retention: Duration, delete_files: bool) -> usize {
        let cutoff = now - to_chrono(retention);
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for token in stale {
            if let Some((_, entry)) = self.entries.remove(&token) {
                purged += 1;
                if delete_files {
                    let path = entry.artifact.path.clone();
                    fail_open_sync("delete_expired_artifact", || {
                        std::fs::remove_file(&path)?;
                        if let Some(parent) = path.parent() {
                            // Per-run directory; only goes when empty.
                            let _ = std::fs::remove_dir(parent);
                        }
                        Ok(())
                    });
                }
            }
        }
        if purged > 0 {
            info!("Purged {} expired download tokens", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn artifact(path: PathBuf) -> Artifact {
        Artifact {
            path,
            file_name: "attendance_report_2024-01-15.xlsx".to_string(),
            content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                .to_string(),
            size_bytes: 4,
        }
    }

    #[test]
    fn test_resolve_is_idempotent_before_expiry() {
        let registry = ArtifactRegistry::new();
        let now = Utc::now();
        let entry = registry.register_at(artifact(PathBuf::from("/data/a.xlsx")), Duration::from_secs(60), now);

        for offset in [0, 10, 59] {
            let at = now + chrono::Duration::seconds(offset);
            assert_eq!(
                registry.resolve_at(&entry.token, at),
                Ok(PathBuf::from("/data/a.xlsx"))
            );
        }
    }

    #[test]
    fn test_expired_even_when_file_exists() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("a.xlsx");
        std::fs::write(&path, b"data").unwrap();

        let registry = ArtifactRegistry::new();
        let now = Utc::now();
        let entry = registry.register_at(artifact(path.clone()), Duration::from_secs(60), now);

        let later = now + chrono::Duration::seconds(60);
        assert_eq!(registry.resolve_at(&entry.token, later), Err(RegistryError::Expired));
        assert!(path.exists());
    }

    #[test]
    fn test_unknown_token() {
        let registry = ArtifactRegistry::new();
        assert_eq!(registry.resolve("nope"), Err(RegistryError::NotFound));
    }

    #[test]
    fn test_tokens_are_unique_and_long() {
        let registry = ArtifactRegistry::new();
        let tokens: HashSet<String> = (0..100)
            .map(|_| registry.register(artifact(PathBuf::from("/x")), Duration::from_secs(5)).token)
            .collect();
        assert_eq!(tokens.len(), 100);
        assert!(tokens.iter().all(|t| t.len() == 48 && t.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn test_purge_respects_retention() {
        let temp = tempfile::TempDir::new().unwrap();
        let run_dir = temp.path().join("run-1");
        std::fs::create_dir_all(&run_dir).unwrap();
        let path = run_dir.join("a.xlsx");
        std::fs::write(&path, b"data").unwrap();

        let registry = ArtifactRegistry::new();
        let now = Utc::now();
        let entry = registry.register_at(artifact(path.clone()), Duration::from_secs(60), now);
        let retention = Duration::from_secs(300);

        // Expired but retained: still reported as expired.
        let expired = now + chrono::Duration::seconds(120);
        assert_eq!(registry.purge_expired(expired, retention, true), 0);
        assert_eq!(registry.resolve_at(&entry.token, expired), Err(RegistryError::Expired));

        let past_retention = now + chrono::Duration::seconds(360);
        assert_eq!(registry.purge_expired(past_retention, retention, true), 1);
        assert_eq!(
            registry.resolve_at(&entry.token, past_retention),
            Err(RegistryError::NotFound)
        );
        assert!(!path.exists());
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(ArtifactRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|j| {
                            let path = PathBuf::from(format!("/data/{}-{}.xlsx", i, j));
                            let entry = registry.register(artifact(path.clone()), Duration::from_secs(60));
                            assert_eq!(registry.resolve(&entry.token), Ok(path));
                        })
                        .count()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 400);
        assert_eq!(registry.len(), 400);
    }
}
