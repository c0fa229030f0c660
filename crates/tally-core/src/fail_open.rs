//! Fail-open utilities for best-effort housekeeping
//!
//! Some operations must never turn a run's outcome into a different error: removing
//! a per-run download directory, writing a debug manifest, purging expired files.
//! These helpers log the failure via `tracing::warn!` and return `None`.
//!
//! DO NOT use fail-open for:
//! - Workflow steps (login, trigger, detection, download)
//! - Registry lookups

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an async operation that should fail open
///
/// # Usage
///
/// ```no_run
/// use tally_core::fail_open::fail_open;
/// use tally_core::Result;
///
/// async fn write_manifest() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let result = fail_open("debug_manifest", || write_manifest()).await;
///     // result is None if write_manifest() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Blocking variant for cleanup paths that cannot await (e.g. `Drop`)
pub fn fail_open_sync<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TallyError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, TallyError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(TallyError::Other("test error".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[test]
    fn test_fail_open_sync() {
        assert_eq!(fail_open_sync("ok", || Ok::<_, TallyError>(1)), Some(1));
        let missing = fail_open_sync("remove_dir", || {
            std::fs::remove_dir_all("/nonexistent/tally/dir").map_err(TallyError::from)
        });
        assert_eq!(missing, None);
    }
}
