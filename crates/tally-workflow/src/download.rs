//! Wait for the exported file and move it into managed storage

use crate::error::{StepFailure, StepResult};
use crate::profile::DownloadRules;
use chrono::NaiveDate;
use glob::Pattern;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tally_core::{
    poll_until, Artifact, CancellationToken, FailureKind, PollOutcome, PollSpec, Result,
    TallyError,
};
use tracing::{debug, info};

/// A pending download: where to look, what to match, and what was already there
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    dir: PathBuf,
    patterns: Vec<Pattern>,
    ignored_suffixes: Vec<String>,
    existing: HashSet<String>,
}

impl DownloadHandle {
    /// Snapshot `dir` before the export click so older files are never mistaken
    /// for the new report.
    pub fn prepare(dir: &Path, rules: &DownloadRules) -> Result<Self> {
        let patterns = rules
            .patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| TallyError::Config(format!("invalid download pattern {}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        std::fs::create_dir_all(dir)?;
        let existing = list_files(dir)?.into_iter().map(|(name, _)| name).collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            patterns,
            ignored_suffixes: rules.ignored_suffixes.clone(),
            existing,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_candidate(&self, name: &str) -> bool {
        !self.existing.contains(name)
            && !self.ignored_suffixes.iter().any(|s| name.ends_with(s.as_str()))
            && self.patterns.iter().any(|p| p.matches(name))
    }

    /// Matching new files and their current sizes, sorted by name
    fn candidates(&self) -> Result<Vec<(String, u64)>> {
        let mut found: Vec<(String, u64)> = list_files(&self.dir)?
            .into_iter()
            .filter(|(name, _)| self.is_candidate(name))
            .collect();
        found.sort();
        Ok(found)
    }
}

fn list_files(dir: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), metadata.len()));
        }
    }
    Ok(files)
}

/// Polls a download directory until a matching file stops growing
pub struct DownloadWatcher {
    spec: PollSpec,
}

impl DownloadWatcher {
    pub fn new(spec: PollSpec) -> Self {
        Self { spec }
    }

    /// Wait for a complete file: new, matching, non-empty, and the same size on
    /// two consecutive polls. Fails with `DownloadTimeout` at the deadline.
    pub async fn await_file(
        &self,
        handle: &DownloadHandle,
        cancel: &CancellationToken,
    ) -> StepResult<PathBuf> {
        let mut last_sizes: HashMap<String, u64> = HashMap::new();

        let outcome = poll_until(self.spec, cancel, || {
            let result = handle.candidates().map(|current| {
                let stable = current
                    .iter()
                    .find(|(name, size)| *size > 0 && last_sizes.get(name) == Some(size))
                    .map(|(name, _)| handle.dir.join(name));
                if stable.is_none() && !current.is_empty() {
                    debug!("Download in progress: {:?}", current);
                }
                last_sizes = current.into_iter().collect();
                stable
            });
            async move { result }
        })
        .await
        .map_err(|e| StepFailure::from_error(FailureKind::DownloadTimeout, "scanning downloads", e))?;

        match outcome {
            PollOutcome::Ready(path) => {
                info!("Download complete: {}", path.display());
                Ok(path)
            }
            PollOutcome::TimedOut => Err(StepFailure::new(
                FailureKind::DownloadTimeout,
                format!(
                    "no complete file matching {} appeared in {} within {:?}",
                    handle
                        .patterns
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" or "),
                    handle.dir.display(),
                    self.spec.timeout
                ),
            )),
            PollOutcome::Cancelled => Err(StepFailure::cancelled()),
        }
    }
}

/// Name under which the report is stored and served: `{prefix}_{date}.{ext}`
pub fn artifact_file_name(prefix: &str, date: NaiveDate, source: &Path) -> String {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("xlsx");
    format!("{}_{}.{}", prefix, date.format(tally_core::REPORT_DATE_FORMAT), ext)
}

/// Move a finished download into `dest_dir` so browser teardown cannot touch it
pub fn store_artifact(source: &Path, dest_dir: &Path, file_name: &str) -> Result<Artifact> {
    std::fs::create_dir_all(dest_dir).map_err(|e| {
        TallyError::Storage(format!("Failed to create {}: {}", dest_dir.display(), e))
    })?;
    let dest = dest_dir.join(file_name);

    if std::fs::rename(source, &dest).is_err() {
        // Different filesystem: copy, then drop the original.
        std::fs::copy(source, &dest).map_err(|e| {
            TallyError::Storage(format!(
                "Failed to move {} to {}: {}",
                source.display(),
                dest.display(),
                e
            ))
        })?;
        std::fs::remove_file(source)?;
    }

    let size_bytes = std::fs::metadata(&dest)?.len();
    let content_type = mime_guess::from_path(&dest)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    info!("Stored artifact {} ({} bytes)", dest.display(), size_bytes);

    Ok(Artifact {
        path: dest,
        file_name: file_name.to_string(),
        content_type,
        size_bytes,
    })
}
