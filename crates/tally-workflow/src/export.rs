//! Ask the result context for the file

use crate::error::{StepFailure, StepResult};
use crate::profile::ExportMethod;
use tally_browser::{wait_for_any, PortalSession};
use tally_core::{
    CancellationToken, DetectionOutcome, FailureKind, Locator, PollOutcome, PollSpec,
};
use tracing::{debug, info, warn};

/// Switch focus to where the report surfaced
pub async fn enter_result_context(
    session: &dyn PortalSession,
    outcome: &DetectionOutcome,
) -> StepResult<()> {
    if let DetectionOutcome::NewWindowFound(handle) = outcome {
        info!("Session {}: switching to report window {}", session.id(), handle);
        session.switch_to_window(handle).await.map_err(|e| {
            StepFailure::from_error(FailureKind::ExportFailed, "switching to report window", e)
        })?;
    }
    Ok(())
}

/// Export chain for one run: the detected marker first, then the profile's methods
pub fn export_chain(outcome: &DetectionOutcome, methods: &[ExportMethod]) -> Vec<ExportMethod> {
    let mut chain = Vec::with_capacity(methods.len() + 1);
    if let DetectionOutcome::ElementFound(marker) = outcome {
        chain.push(ExportMethod::Click(marker.clone()));
    }
    for method in methods {
        if !chain.contains(method) {
            chain.push(method.clone());
        }
    }
    chain
}

/// Activate the first export method that works.
///
/// Click methods are waited for together (up to `spec.timeout`) so a slow report
/// viewer still gets its links honoured in chain order; script methods run after.
/// Returns the method that succeeded.
pub async fn run_export(
    session: &dyn PortalSession,
    chain: &[ExportMethod],
    spec: PollSpec,
    cancel: &CancellationToken,
) -> StepResult<ExportMethod> {
    let clickable: Vec<Locator> = chain
        .iter()
        .filter_map(|m| match m {
            ExportMethod::Click(locator) => Some(locator.clone()),
            ExportMethod::Script(_) => None,
        })
        .collect();

    if !clickable.is_empty() {
        let outcome = wait_for_any(session, &clickable, spec, cancel)
            .await
            .map_err(|e| StepFailure::from_error(FailureKind::ExportFailed, "export link", e))?;
        match outcome {
            PollOutcome::Ready(locator) => match session.click(&locator).await {
                Ok(()) => {
                    info!("Session {}: export started via {}", session.id(), locator);
                    return Ok(ExportMethod::Click(locator));
                }
                Err(e) => warn!("Session {}: export click on {} failed: {}", session.id(), locator, e),
            },
            PollOutcome::TimedOut => debug!(
                "Session {}: no export link appeared within {:?}",
                session.id(),
                spec.timeout
            ),
            PollOutcome::Cancelled => return Err(StepFailure::cancelled()),
        }
    }

    for method in chain {
        if let ExportMethod::Script(script) = method {
            if cancel.is_cancelled() {
                return Err(StepFailure::cancelled());
            }
            match session.evaluate(script).await {
                Ok(serde_json::Value::Bool(true)) => {
                    info!("Session {}: export started via script", session.id());
                    return Ok(method.clone());
                }
                Ok(other) => debug!("Session {}: export script returned {}", session.id(), other),
                Err(e) => warn!("Session {}: export script failed: {}", session.id(), e),
            }
        }
    }

    let tried: Vec<String> = chain.iter().map(ExportMethod::describe).collect();
    Err(StepFailure::new(
        FailureKind::ExportFailed,
        format!("no export method could be activated (tried {})", tried.join(", ")),
    ))
}
