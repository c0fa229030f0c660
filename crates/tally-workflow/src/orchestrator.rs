//! Sequences the workflow steps into one run
//!
//! Each run gets a fresh browser session held by a [`SessionGuard`], its own
//! download directory and a cancellation token armed with the request deadline.
//! Every failing step is followed by a debug capture before the run moves to
//! `Failed`. Nothing is retried inside a run.

use crate::auth::Authenticator;
use crate::debug_recorder::{DebugRecorder, DebugStore};
use crate::detector::{ArtifactDetector, Detection};
use crate::download::{artifact_file_name, store_artifact, DownloadHandle, DownloadWatcher};
use crate::error::{RunFailure, StepFailure, StepResult};
use crate::export::{enter_result_context, export_chain, run_export};
use crate::profile::PortalProfile;
use crate::registry::ArtifactRegistry;
use crate::state_machine::{transition, Action, Event, State};
use crate::trigger::ReportTrigger;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tally_browser::{PortalSession, SessionGuard, SessionLauncher, SessionOptions};
use tally_core::config::WorkflowSettings;
use tally_core::fail_open::fail_open;
use tally_core::{
    cookie_header, Artifact, CancellationToken, Credentials, DebugContext, FailureKind, PollSpec,
    ReportRequest, Stage, TallyConfig, TallyError,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Static inputs of an orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub profile: PortalProfile,
    pub workflow: WorkflowSettings,
    /// Parent of the per-run download directories
    pub downloads_dir: PathBuf,
    /// Managed storage for finished artifacts
    pub artifacts_dir: PathBuf,
    pub artifact_ttl: Duration,
}

impl OrchestratorConfig {
    pub fn new(config: &TallyConfig, profile: PortalProfile) -> Self {
        Self {
            profile,
            workflow: config.workflow.clone(),
            downloads_dir: config.storage.downloads_dir(),
            artifacts_dir: config.storage.artifacts_dir(),
            artifact_ttl: config.registry.artifact_ttl(),
        }
    }
}

/// Successful report run
#[derive(Debug, Clone, Serialize)]
pub struct ReportReceipt {
    pub run_id: String,
    pub token: String,
    pub artifact: Artifact,
    pub report_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub detection: Detection,
}

impl ReportReceipt {
    /// Seconds until the token expires, from `generated_at`
    pub fn expires_in_secs(&self) -> i64 {
        (self.expires_at - self.generated_at).num_seconds()
    }
}

/// Cookies of a logged-in session
#[derive(Debug, Clone, Serialize)]
pub struct CookieCapture {
    pub run_id: String,
    pub url: String,
    /// `name=value; name=value`
    pub cookie_header: String,
    pub cookie_names: Vec<String>,
}

/// Aborts the deadline timer when the run ends first
struct DeadlineTimer(JoinHandle<()>);

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Bookkeeping for one in-flight run
struct ActiveRun {
    id: String,
    state: State,
    release_requested: bool,
    cancel: CancellationToken,
    download_dir: PathBuf,
    _deadline: DeadlineTimer,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ActiveRun {
    fn apply(&mut self, event: Event) {
        let current = std::mem::replace(&mut self.state, State::Idle);
        let (next, actions) = transition(current, event);
        self.state = next;
        for action in actions {
            match action {
                Action::LogActivity { message } => info!("Run {}: {}", self.id, message),
                Action::ReleaseSession => self.release_requested = true,
            }
        }
    }

    fn stage(&self) -> Stage {
        self.state.stage().unwrap_or(Stage::Idle)
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    launcher: Arc<dyn SessionLauncher>,
    registry: Arc<ArtifactRegistry>,
    debug_store: Arc<DebugStore>,
    recorder: DebugRecorder,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        launcher: Arc<dyn SessionLauncher>,
        registry: Arc<ArtifactRegistry>,
        debug_store: Arc<DebugStore>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workflow.max_concurrent_runs.max(1)));
        let recorder = DebugRecorder::new(debug_store.debug_dir())
            .with_capture_timeout(config.workflow.debug_capture_timeout());
        Self {
            config,
            launcher,
            registry,
            debug_store,
            recorder,
            permits,
        }
    }

    /// Share a run limit with other orchestrators (e.g. the cookie portal)
    pub fn with_run_limit(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = permits;
        self
    }

    pub fn with_recorder(mut self, recorder: DebugRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn run_limit(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    pub fn profile(&self) -> &PortalProfile {
        &self.config.profile
    }

    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.registry
    }

    pub fn debug_store(&self) -> &Arc<DebugStore> {
        &self.debug_store
    }

    /// Generate one report: login, trigger, detect, export, download, register
    pub async fn run(&self, request: ReportRequest) -> Result<ReportReceipt, RunFailure> {
        self.run_with_cancel(request, &CancellationToken::new()).await
    }

    /// As [`Orchestrator::run`], also stopping when `parent` is cancelled
    pub async fn run_with_cancel(
        &self,
        request: ReportRequest,
        parent: &CancellationToken,
    ) -> Result<ReportReceipt, RunFailure> {
        let mut run = self.begin_run(parent);
        info!("Run {}: report for {}", run.id, request.date_string());

        let guard = match self.start_session(&mut run).await {
            Ok(guard) => guard,
            Err(failure) => return Err(self.abort_before_session(run, failure).await),
        };
        run.apply(Event::Start);

        let outcome = self.report_steps(&mut run, guard.session(), &request).await;
        self.finish(run, guard, outcome, |receipt| Event::Registered {
            token: receipt.token.clone(),
        })
        .await
    }

    /// Log in and return the session cookies after loading `target_url`
    pub async fn capture_cookies(
        &self,
        credentials: &Credentials,
        target_url: &str,
    ) -> Result<CookieCapture, RunFailure> {
        let mut run = self.begin_run(&CancellationToken::new());
        info!("Run {}: cookie capture for {}", run.id, target_url);

        let guard = match self.start_session(&mut run).await {
            Ok(guard) => guard,
            Err(failure) => return Err(self.abort_before_session(run, failure).await),
        };
        run.apply(Event::Start);

        let outcome = self
            .cookie_steps(&mut run, guard.session(), credentials, target_url)
            .await;
        self.finish(run, guard, outcome, |capture| Event::CookiesCaptured {
            count: capture.cookie_names.len(),
        })
        .await
    }

    /// Arm the run's deadline. The clock starts before the run queues for a slot.
    fn begin_run(&self, parent: &CancellationToken) -> ActiveRun {
        let random = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("run-{}", &random[..12]);

        let cancel = parent.child_token();
        let deadline = self.config.workflow.request_deadline();
        let timer_token = cancel.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!("Run {}: request deadline of {:?} exceeded, cancelling", timer_id, deadline);
            timer_token.cancel();
        });

        ActiveRun {
            download_dir: self.config.downloads_dir.join(&id),
            id,
            state: State::Idle,
            release_requested: false,
            cancel,
            _deadline: DeadlineTimer(timer),
            _permit: None,
        }
    }

    /// Wait for a browser slot unless the run is cancelled first
    async fn acquire_slot(&self, run: &mut ActiveRun) -> StepResult<()> {
        if run.cancel.is_cancelled() {
            return Err(StepFailure::cancelled());
        }
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                info!("Run {}: waiting for a free browser slot", run.id);
                tokio::select! {
                    permit = self.permits.clone().acquire_owned() => permit.map_err(|_| {
                        StepFailure::new(FailureKind::SessionLaunchFailed, "run limit closed")
                    })?,
                    _ = run.cancel.cancelled() => return Err(StepFailure::cancelled()),
                }
            }
        };
        run._permit = Some(permit);
        Ok(())
    }

    /// Queue for a slot, then launch the browser
    async fn start_session(&self, run: &mut ActiveRun) -> StepResult<SessionGuard> {
        self.acquire_slot(run).await?;
        self.open_session(run).await
    }

    async fn open_session(&self, run: &ActiveRun) -> StepResult<SessionGuard> {
        let options = SessionOptions {
            session_id: run.id.clone(),
            download_dir: run.download_dir.clone(),
        };
        let opened = tokio::select! {
            opened = self.launcher.open(options) => opened,
            _ = run.cancel.cancelled() => Err(TallyError::Cancelled),
        };
        opened.map(SessionGuard::new).map_err(|e| {
            StepFailure::from_error(FailureKind::SessionLaunchFailed, "browser launch", e)
        })
    }

    async fn report_steps(
        &self,
        run: &mut ActiveRun,
        session: &dyn PortalSession,
        request: &ReportRequest,
    ) -> StepResult<ReportReceipt> {
        let profile = &self.config.profile;
        let settings = &self.config.workflow;
        let cancel = run.cancel.clone();

        let landing = Authenticator::new(profile, settings)
            .login(session, &request.credentials, &cancel)
            .await?;
        run.apply(Event::LoginSucceeded {
            landing_url: landing.landing_url,
        });

        run.apply(Event::BeginTrigger);
        let triggered = ReportTrigger::new(profile, settings)
            .trigger(session, request, &cancel)
            .await?;
        run.apply(Event::Triggered);

        let report = profile.report.as_ref().ok_or_else(|| {
            StepFailure::new(FailureKind::TriggerFailed, "profile has no report page")
        })?;
        let detection = ArtifactDetector::standard(settings, report.markers.clone())
            .detect(session, &triggered.baseline, &cancel)
            .await
            .map_err(|e| StepFailure::from_error(FailureKind::DetectionFailed, "detection", e))?;
        if !detection.outcome.is_detected() {
            return Err(StepFailure::new(
                FailureKind::DetectionFailed,
                format!(
                    "no strategy detected the report (tried {})",
                    detection.tried().join(", ")
                ),
            ));
        }
        run.apply(Event::Detected {
            outcome: detection.outcome.clone(),
        });

        enter_result_context(session, &detection.outcome).await?;
        let handle = DownloadHandle::prepare(&run.download_dir, &profile.download).map_err(|e| {
            StepFailure::from_error(FailureKind::StorageFailed, "preparing download directory", e)
        })?;
        let chain = export_chain(&detection.outcome, &report.export);
        run_export(
            session,
            &chain,
            PollSpec::new(settings.detection_poll(), settings.export_wait()),
            &cancel,
        )
        .await?;

        let downloaded = DownloadWatcher::new(PollSpec::new(
            settings.download_poll(),
            settings.download_timeout(),
        ))
        .await_file(&handle, &cancel)
        .await?;

        let file_name = artifact_file_name(
            &profile.download.artifact_prefix,
            request.report_date,
            &downloaded,
        );
        let artifact = store_artifact(
            &downloaded,
            &self.config.artifacts_dir.join(&run.id),
            &file_name,
        )
        .map_err(|e| StepFailure::from_error(FailureKind::StorageFailed, "storing artifact", e))?;

        let entry = self.registry.register(artifact, self.config.artifact_ttl);
        Ok(ReportReceipt {
            run_id: run.id.clone(),
            token: entry.token,
            artifact: entry.artifact,
            report_date: request.report_date,
            generated_at: entry.created_at,
            expires_at: entry.expires_at,
            detection,
        })
    }

    async fn cookie_steps(
        &self,
        run: &mut ActiveRun,
        session: &dyn PortalSession,
        credentials: &Credentials,
        target_url: &str,
    ) -> StepResult<CookieCapture> {
        let cancel = run.cancel.clone();
        let landing = Authenticator::new(&self.config.profile, &self.config.workflow)
            .login(session, credentials, &cancel)
            .await?;
        run.apply(Event::LoginSucceeded {
            landing_url: landing.landing_url,
        });

        if cancel.is_cancelled() {
            return Err(StepFailure::cancelled());
        }
        session.navigate(target_url).await.map_err(|e| {
            StepFailure::from_error(FailureKind::TriggerFailed, "target page did not load", e)
        })?;
        let url = session.current_url().await.map_err(|e| {
            StepFailure::from_error(FailureKind::TriggerFailed, "target page did not load", e)
        })?;
        let cookies = session.cookies().await.map_err(|e| {
            StepFailure::from_error(FailureKind::TriggerFailed, "reading cookies", e)
        })?;
        debug!("Run {}: {} cookies on {}", run.id, cookies.len(), url);

        Ok(CookieCapture {
            run_id: run.id.clone(),
            url,
            cookie_header: cookie_header(&cookies),
            cookie_names: cookies.into_iter().map(|c| c.name).collect(),
        })
    }

    /// Settle a run that got a session: record the outcome, close the session,
    /// remove the download directory.
    async fn finish<T>(
        &self,
        mut run: ActiveRun,
        guard: SessionGuard,
        outcome: StepResult<T>,
        success: impl FnOnce(&T) -> Event,
    ) -> Result<T, RunFailure> {
        let result = match outcome {
            Ok(value) => {
                run.apply(success(&value));
                Ok(value)
            }
            Err(failure) => Err(self.record_failure(&mut run, Some(guard.session()), failure).await),
        };

        if run.release_requested {
            guard.close();
        } else {
            drop(guard);
        }
        self.remove_download_dir(&run).await;
        result
    }

    async fn abort_before_session(&self, mut run: ActiveRun, failure: StepFailure) -> RunFailure {
        let failure = self.record_failure(&mut run, None, failure).await;
        self.remove_download_dir(&run).await;
        failure
    }

    /// Debug capture first, then the transition to `Failed`
    async fn record_failure(
        &self,
        run: &mut ActiveRun,
        session: Option<&dyn PortalSession>,
        failure: StepFailure,
    ) -> RunFailure {
        let stage = run.stage();
        warn!("Run {}: failed while {}: {}", run.id, stage, failure);

        let debug = self
            .recorder
            .capture(
                session,
                DebugContext {
                    run_id: run.id.clone(),
                    stage,
                    kind: failure.kind,
                    reason: failure.reason.clone(),
                },
            )
            .await;
        self.debug_store.insert(debug.clone());

        run.apply(Event::StepFailed {
            kind: failure.kind,
            reason: failure.reason.clone(),
            debug_id: debug.debug_id.clone(),
        });

        RunFailure {
            run_id: run.id.clone(),
            stage,
            kind: failure.kind,
            reason: failure.reason,
            debug,
        }
    }

    async fn remove_download_dir(&self, run: &ActiveRun) {
        if !run.download_dir.exists() {
            return;
        }
        fail_open("remove_download_dir", || async {
            tokio::fs::remove_dir_all(&run.download_dir).await?;
            Ok::<_, TallyError>(())
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_browser::fake::{FakeLauncher, FakeScript};

    fn orchestrator(root: &std::path::Path, launcher: FakeLauncher) -> Orchestrator {
        let mut config = TallyConfig::default();
        config.storage.data_dir = root.to_path_buf();
        config.workflow.element_wait_ms = 50;
        config.workflow.detection_poll_ms = 10;
        let debug_store = DebugStore::shared(config.storage.debug_dir());
        Orchestrator::new(
            OrchestratorConfig::new(&config, PortalProfile::sekure_id()),
            Arc::new(launcher),
            Arc::new(ArtifactRegistry::new()),
            debug_store,
        )
    }

    #[tokio::test]
    async fn test_launch_failure_is_recorded_without_session() {
        let temp = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), FakeLauncher::failing());
        let request = ReportRequest::new(
            Credentials::new("85", "octa", "pw"),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        );

        let failure = orchestrator.run(request).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::SessionLaunchFailed);
        assert_eq!(failure.stage, Stage::Idle);
        assert_eq!(failure.debug.failures.len(), 3);
        assert!(orchestrator.debug_store().get(failure.debug_id()).is_some());
        assert!(orchestrator.registry().is_empty());
    }

    #[test]
    fn test_capture_timeout_follows_workflow_settings() {
        let mut config = TallyConfig::default();
        config.workflow.debug_capture_timeout_ms = 250;
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(&config, PortalProfile::sekure_id()),
            Arc::new(FakeLauncher::new(FakeScript::new())),
            Arc::new(ArtifactRegistry::new()),
            DebugStore::shared(config.storage.debug_dir()),
        );
        assert_eq!(orchestrator.recorder.capture_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_run_ids_and_download_dirs_are_per_run() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = FakeLauncher::new(FakeScript::new());
        let orchestrator = orchestrator(temp.path(), launcher.clone());
        let request = ReportRequest::new(
            Credentials::default(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        );

        let a = orchestrator.run(request.clone()).await.unwrap_err();
        let b = orchestrator.run(request).await.unwrap_err();
        assert_ne!(a.run_id, b.run_id);
        assert_ne!(a.debug_id(), b.debug_id());

        let dirs = launcher.download_dirs();
        assert_eq!(dirs.len(), 2);
        assert_ne!(dirs[0], dirs[1]);
        assert!(dirs.iter().all(|d| !d.exists()));
        assert_eq!(launcher.live_sessions(), 0);
    }
}
