//! Submit the report-generation form

use crate::detector::DetectionBaseline;
use crate::error::{settle, StepFailure, StepResult};
use crate::profile::PortalProfile;
use tally_browser::{wait_for_any, wait_for_element, PortalSession};
use tally_core::config::WorkflowSettings;
use tally_core::{CancellationToken, FailureKind, Locator, PollSpec, ReportRequest};
use tracing::info;

/// The generation action has been dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triggered {
    /// Control that was clicked
    pub submitted_with: Locator,
    /// Windows and URL just before the click
    pub baseline: DetectionBaseline,
}

pub struct ReportTrigger<'a> {
    profile: &'a PortalProfile,
    settings: &'a WorkflowSettings,
}

impl<'a> ReportTrigger<'a> {
    pub fn new(profile: &'a PortalProfile, settings: &'a WorkflowSettings) -> Self {
        Self { profile, settings }
    }

    /// Open the report page, enter the date and click the first submit control found.
    ///
    /// Returns as soon as the click is dispatched; what the portal does next is the
    /// detector's concern.
    pub async fn trigger(
        &self,
        session: &dyn PortalSession,
        request: &ReportRequest,
        cancel: &CancellationToken,
    ) -> StepResult<Triggered> {
        let fail = |context: &str, e| StepFailure::from_error(FailureKind::TriggerFailed, context, e);
        let report = self.profile.report.as_ref().ok_or_else(|| {
            StepFailure::new(
                FailureKind::TriggerFailed,
                format!("profile {} has no report page", self.profile.name),
            )
        })?;
        let wait = PollSpec::new(self.settings.detection_poll(), self.settings.element_wait());

        info!("Session {}: opening report page {}", session.id(), report.url);
        session
            .navigate(&report.url)
            .await
            .map_err(|e| fail("report page did not load", e))?;

        let outcome = wait_for_element(session, &report.date_field, wait, cancel)
            .await
            .map_err(|e| fail("date field", e))?;
        settle(outcome, FailureKind::TriggerFailed, || {
            format!("date field {} did not appear", report.date_field)
        })?;

        let date = request.report_date.format(&report.date_format).to_string();
        session
            .fill(&report.date_field, &date)
            .await
            .map_err(|e| fail("entering report date", e))?;

        let outcome = wait_for_any(session, &report.submit_candidates, wait, cancel)
            .await
            .map_err(|e| fail("submit control", e))?;
        let submit = settle(outcome, FailureKind::TriggerFailed, || {
            let tried: Vec<String> = report.submit_candidates.iter().map(|l| l.to_string()).collect();
            format!("no submit control found (tried {})", tried.join(", "))
        })?;

        let baseline = DetectionBaseline::capture(session)
            .await
            .map_err(|e| fail("reading pre-trigger state", e))?;
        session
            .click(&submit)
            .await
            .map_err(|e| fail("clicking submit control", e))?;

        info!("Session {}: report for {} submitted via {}", session.id(), date, submit);
        Ok(Triggered {
            submitted_with: submit,
            baseline,
        })
    }
}
