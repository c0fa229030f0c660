//! Cancellable "poll until predicate or deadline" primitive
//!
//! Every bounded wait in a run (window handles, URL, DOM markers, file sizes) goes
//! through [`poll_until`], so cancellation and deadline semantics live in one place.
//! The probe always runs at least once, and once more at the deadline, so a
//! condition that becomes true in the final interval is still observed.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Interval and timeout for one polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_millis(interval_ms: u64, timeout_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }
}

/// How a polling loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value
    Ready(T),
    /// The timeout elapsed without a value
    TimedOut,
    /// The cancellation token fired
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Run `probe` every `spec.interval` until it yields `Some`, the timeout elapses,
/// or `cancel` fires.
///
/// Probe errors abort the loop and are returned as-is.
pub async fn poll_until<T, F, Fut>(
    spec: PollSpec,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + spec.timeout;

    loop {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        if let Some(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }

        let nap = spec.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TallyError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_probe() {
        let calls = AtomicUsize::new(0);
        let outcome = poll_until(PollSpec::from_millis(100, 5_000), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(if n == 3 { Some(n) } else { None }) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_final_probe() {
        let calls = AtomicUsize::new(0);
        let started = Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::from_millis(100, 450), &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(450));
        // t=0,100,200,300,400,450
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_probes_once() {
        let calls = AtomicUsize::new(0);
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::from_millis(100, 0), &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::from_millis(1_000, 60_000), &cancel, || async { Ok(None) })
                .await
                .unwrap();

        assert!(outcome.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_probe() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outcome: PollOutcome<()> =
            poll_until(PollSpec::from_millis(10, 100), &cancel, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_error_propagates() {
        let result: Result<PollOutcome<()>> =
            poll_until(PollSpec::from_millis(10, 100), &CancellationToken::new(), || async {
                Err(TallyError::Browser("tab crashed".to_string()))
            })
            .await;
        assert!(matches!(result, Err(TallyError::Browser(_))));
    }
}
