//! Login through the portal's identification form

use crate::error::{settle, StepFailure, StepResult};
use crate::profile::{LandingIndicator, PortalProfile};
use tally_browser::{probe_result, wait_for_element, PortalSession};
use tally_core::config::WorkflowSettings;
use tally_core::{poll_until, CancellationToken, Credentials, FailureKind, PollSpec, Result};
use tracing::{debug, info};

/// Proof of a completed login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// URL the portal landed on after submitting
    pub landing_url: String,
}

/// What the post-submit poll saw first
enum LoginSignal {
    Landed(String),
    Rejected(String),
}

/// Drives the login form of one portal profile
pub struct Authenticator<'a> {
    profile: &'a PortalProfile,
    settings: &'a WorkflowSettings,
}

impl<'a> Authenticator<'a> {
    pub fn new(profile: &'a PortalProfile, settings: &'a WorkflowSettings) -> Self {
        Self { profile, settings }
    }

    /// Fill and submit the login form, then wait for a landing indicator.
    ///
    /// Fails with `LoginFailed` when the form never appears, the portal shows an
    /// error message, or no landing indicator shows up before the login timeout.
    /// Never retries.
    pub async fn login(
        &self,
        session: &dyn PortalSession,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> StepResult<Authenticated> {
        let fail = |context: &str, e| StepFailure::from_error(FailureKind::LoginFailed, context, e);
        let profile = self.profile;

        info!("Session {}: opening login page {}", session.id(), profile.login_url);
        session
            .navigate(&profile.login_url)
            .await
            .map_err(|e| fail("login page did not load", e))?;
        let login_page_url = session
            .current_url()
            .await
            .map_err(|e| fail("login page did not load", e))?;

        let first = profile
            .login_fields
            .first()
            .map(|f| f.locator.clone())
            .unwrap_or_else(|| profile.login_submit.clone());
        let element_wait = PollSpec::new(self.settings.detection_poll(), self.settings.element_wait());
        let outcome = wait_for_element(session, &first, element_wait, cancel)
            .await
            .map_err(|e| fail("login form", e))?;
        settle(outcome, FailureKind::LoginFailed, || {
            format!("login form field {} did not appear", first)
        })?;

        for field in &profile.login_fields {
            debug!("Session {}: filling {:?} into {}", session.id(), field.field, field.locator);
            session
                .fill(&field.locator, credentials.field(field.field))
                .await
                .map_err(|e| fail("filling login form", e))?;
        }
        session
            .click(&profile.login_submit)
            .await
            .map_err(|e| fail("submitting login form", e))?;

        let spec = PollSpec::new(self.settings.detection_poll(), self.settings.login_timeout());
        let login_page_url = login_page_url.as_str();
        let outcome = poll_until(spec, cancel, move || async move {
            probe_result(self.check_login(session, login_page_url).await).map(Option::flatten)
        })
        .await
        .map_err(|e| fail("waiting for login", e))?;

        match settle(outcome, FailureKind::LoginFailed, || {
            format!(
                "no landing indicator within {:?} after submitting credentials",
                spec.timeout
            )
        })? {
            LoginSignal::Landed(url) => {
                info!("Session {}: logged in, landed on {}", session.id(), url);
                Ok(Authenticated { landing_url: url })
            }
            LoginSignal::Rejected(message) => Err(StepFailure::new(
                FailureKind::LoginFailed,
                format!("portal rejected login: {}", message),
            )),
        }
    }

    /// One look at the page after submitting: error message first, then landing indicators
    async fn check_login(
        &self,
        session: &dyn PortalSession,
        login_page_url: &str,
    ) -> Result<Option<LoginSignal>> {
        if let Some(error) = &self.profile.login_error {
            if let Some(text) = session.element_text(error).await? {
                // Validation containers are often rendered empty.
                if !text.trim().is_empty() {
                    return Ok(Some(LoginSignal::Rejected(text.trim().to_string())));
                }
            }
        }

        let url = session.current_url().await?;
        for indicator in &self.profile.landing {
            let landed = match indicator {
                LandingIndicator::UrlContains(fragment) => url.contains(fragment.as_str()),
                LandingIndicator::UrlChanged => url != login_page_url,
                LandingIndicator::Element(locator) => session.element_exists(locator).await?,
            };
            if landed {
                return Ok(Some(LoginSignal::Landed(url)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_browser::fake::{FakeEffect, FakeLauncher, FakeScript};
    use tally_browser::{SessionLauncher, SessionOptions};
    use tally_core::Locator;

    const LOGIN: &str = "https://cloud.sekure-id.com/";

    fn settings() -> WorkflowSettings {
        WorkflowSettings {
            element_wait_ms: 100,
            login_timeout_ms: 100,
            detection_poll_ms: 10,
            ..WorkflowSettings::default()
        }
    }

    fn login_page() -> FakeScript {
        FakeScript::new().page(
            LOGIN,
            vec![
                Locator::css("#Company_code"),
                Locator::css("#Username"),
                Locator::css("#pass"),
                Locator::css("#Login"),
            ],
        )
    }

    async fn login_with(script: FakeScript) -> (FakeLauncher, StepResult<Authenticated>) {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = FakeLauncher::new(script);
        let session = launcher
            .open(SessionOptions {
                session_id: "auth".to_string(),
                download_dir: temp.path().to_path_buf(),
            })
            .await
            .unwrap();
        let profile = PortalProfile::sekure_id();
        let settings = settings();
        let result = Authenticator::new(&profile, &settings)
            .login(
                session.as_ref(),
                &Credentials::new("85", "octa", "pw"),
                &CancellationToken::new(),
            )
            .await;
        (launcher, result)
    }

    #[tokio::test]
    async fn test_login_lands_on_new_url() {
        let script = login_page().on_click(
            Locator::css("#Login"),
            vec![FakeEffect::Navigate("https://cloud.sekure-id.com/Home".to_string())],
        );
        let (launcher, result) = login_with(script).await;

        assert_eq!(
            result.unwrap().landing_url,
            "https://cloud.sekure-id.com/Home"
        );
        assert_eq!(launcher.filled(&Locator::css("#Company_code")).as_deref(), Some("85"));
        assert_eq!(launcher.filled(&Locator::css("#pass")).as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_login_times_out_without_landing() {
        let (_, result) = login_with(login_page()).await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::LoginFailed);
        assert!(failure.reason.contains("no landing indicator"));
    }

    #[tokio::test]
    async fn test_visible_error_message_fails_fast() {
        let error = Locator::css(".validation-summary-errors, .alert-danger, .field-validation-error");
        let script = login_page()
            .text(error.clone(), "  Invalid username or password ")
            .on_click(Locator::css("#Login"), vec![FakeEffect::Reveal(error)]);
        let (_, result) = login_with(script).await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::LoginFailed);
        assert_eq!(failure.reason, "portal rejected login: Invalid username or password");
    }

    #[tokio::test]
    async fn test_missing_form_is_login_failure() {
        let (launcher, result) = login_with(FakeScript::new()).await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::LoginFailed);
        assert!(failure.reason.contains("css:#Company_code"));
        assert!(!launcher.journal().iter().any(|c| c.starts_with("fill")));
    }
}
