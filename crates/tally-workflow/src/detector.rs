//! Locate where a triggered report surfaced
//!
//! The portal may open a new tab, navigate the current one, or render a download
//! link in place. [`ArtifactDetector`] asks each [`DetectionStrategy`] in turn, each
//! with its own timeout, and stops at the first positive outcome. Strategies never
//! run concurrently: switching focus mid-poll is unsafe.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tally_browser::{probe_result, wait_for_any, PortalSession};
use tally_core::config::WorkflowSettings;
use tally_core::{
    poll_until, CancellationToken, DetectionOutcome, Locator, PollOutcome, PollSpec, Result,
    TallyError, WindowHandle,
};
use tokio::time::Instant;
use tracing::{debug, info};

/// Session state observed right before the trigger click
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionBaseline {
    pub handles: Vec<WindowHandle>,
    pub url: String,
}

impl DetectionBaseline {
    pub async fn capture(session: &dyn PortalSession) -> Result<Self> {
        Ok(Self {
            handles: session.window_handles().await?,
            url: session.current_url().await?,
        })
    }
}

/// One independent heuristic for finding the result context
#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Poll until this strategy sees the result, its own timeout elapses
    /// (`NotDetected`), or `cancel` fires (`Err(Cancelled)`).
    async fn attempt(
        &self,
        session: &dyn PortalSession,
        baseline: &DetectionBaseline,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome>;
}

fn finish(outcome: PollOutcome<DetectionOutcome>) -> Result<DetectionOutcome> {
    match outcome {
        PollOutcome::Ready(found) => Ok(found),
        PollOutcome::TimedOut => Ok(DetectionOutcome::NotDetected),
        PollOutcome::Cancelled => Err(TallyError::Cancelled),
    }
}

/// A window handle that was not there before the trigger
pub struct NewWindowStrategy {
    pub spec: PollSpec,
}

#[async_trait]
impl DetectionStrategy for NewWindowStrategy {
    fn name(&self) -> &'static str {
        "new_window"
    }

    async fn attempt(
        &self,
        session: &dyn PortalSession,
        baseline: &DetectionBaseline,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome> {
        let outcome = poll_until(self.spec, cancel, move || async move {
            let handles = probe_result(session.window_handles().await)?;
            Ok(handles.and_then(|handles| {
                handles
                    .into_iter()
                    .rev()
                    .find(|h| !baseline.handles.contains(h))
                    .map(DetectionOutcome::NewWindowFound)
            }))
        })
        .await?;
        finish(outcome)
    }
}

/// The active tab left the pre-trigger URL
pub struct UrlChangeStrategy {
    pub spec: PollSpec,
}

#[async_trait]
impl DetectionStrategy for UrlChangeStrategy {
    fn name(&self) -> &'static str {
        "url_change"
    }

    async fn attempt(
        &self,
        session: &dyn PortalSession,
        baseline: &DetectionBaseline,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome> {
        let outcome = poll_until(self.spec, cancel, move || async move {
            let url = probe_result(session.current_url().await)?;
            Ok(url
                .filter(|url| *url != baseline.url)
                .map(DetectionOutcome::UrlChanged))
        })
        .await?;
        finish(outcome)
    }
}

/// A "report ready" element appeared in the current DOM
pub struct DomMarkerStrategy {
    pub spec: PollSpec,
    pub markers: Vec<Locator>,
}

#[async_trait]
impl DetectionStrategy for DomMarkerStrategy {
    fn name(&self) -> &'static str {
        "dom_marker"
    }

    async fn attempt(
        &self,
        session: &dyn PortalSession,
        _baseline: &DetectionBaseline,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome> {
        if self.markers.is_empty() {
            return Ok(DetectionOutcome::NotDetected);
        }
        let outcome = wait_for_any(session, &self.markers, self.spec, cancel).await?;
        finish(match outcome {
            PollOutcome::Ready(locator) => PollOutcome::Ready(DetectionOutcome::ElementFound(locator)),
            PollOutcome::TimedOut => PollOutcome::TimedOut,
            PollOutcome::Cancelled => PollOutcome::Cancelled,
        })
    }
}

/// How one strategy fared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: &'static str,
    pub outcome: DetectionOutcome,
    pub elapsed: Duration,
}

/// Result of running the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub outcome: DetectionOutcome,
    pub attempts: Vec<StrategyAttempt>,
}

impl Detection {
    /// Names of the strategies tried, in order
    pub fn tried(&self) -> Vec<&'static str> {
        self.attempts.iter().map(|a| a.strategy).collect()
    }
}

/// Ordered chain of detection strategies
pub struct ArtifactDetector {
    strategies: Vec<Box<dyn DetectionStrategy>>,
}

impl ArtifactDetector {
    pub fn new(strategies: Vec<Box<dyn DetectionStrategy>>) -> Self {
        Self { strategies }
    }

    /// New window, then URL change, then DOM markers
    pub fn standard(settings: &WorkflowSettings, markers: Vec<Locator>) -> Self {
        let poll = settings.detection_poll();
        Self::new(vec![
            Box::new(NewWindowStrategy {
                spec: PollSpec::new(poll, Duration::from_millis(settings.new_window_timeout_ms)),
            }),
            Box::new(UrlChangeStrategy {
                spec: PollSpec::new(poll, Duration::from_millis(settings.url_change_timeout_ms)),
            }),
            Box::new(DomMarkerStrategy {
                spec: PollSpec::new(poll, Duration::from_millis(settings.dom_marker_timeout_ms)),
                markers,
            }),
        ])
    }

    /// Run strategies in order until one detects the result.
    ///
    /// Returns `NotDetected` when every strategy is exhausted; only cancellation
    /// or a dead session is an `Err`.
    pub async fn detect(
        &self,
        session: &dyn PortalSession,
        baseline: &DetectionBaseline,
        cancel: &CancellationToken,
    ) -> Result<Detection> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let started = Instant::now();
            let outcome = strategy.attempt(session, baseline, cancel).await?;
            let elapsed = started.elapsed();
            debug!(
                "Session {}: strategy {} -> {:?} after {:?}",
                session.id(),
                strategy.name(),
                outcome,
                elapsed
            );
            attempts.push(StrategyAttempt {
                strategy: strategy.name(),
                outcome: outcome.clone(),
                elapsed,
            });

            if outcome.is_detected() {
                info!(
                    "Session {}: report detected by {} strategy",
                    session.id(),
                    strategy.name()
                );
                return Ok(Detection { outcome, attempts });
            }
        }

        info!("Session {}: no detection strategy succeeded", session.id());
        Ok(Detection {
            outcome: DetectionOutcome::NotDetected,
            attempts,
        })
    }
}
