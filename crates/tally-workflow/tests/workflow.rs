//! End-to-end runs against the scripted portal

use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tally_browser::fake::{FakeEffect, FakeLauncher, FakeScript};
use tally_core::{
    CancellationToken, Credentials, DetectionOutcome, FailureKind, Locator, ReportRequest, Stage,
    TallyConfig,
};
use tally_workflow::{ArtifactRegistry, DebugStore, Orchestrator, OrchestratorConfig, PortalProfile};

const LOGIN_URL: &str = "https://cloud.sekure-id.com/";
const HOME_URL: &str = "https://cloud.sekure-id.com/Home";
const REPORT_URL: &str = "https://cloud.sekure-id.com/DailyReports";
const VIEWER_URL: &str = "https://cloud.sekure-id.com/ReportViewer.aspx";

fn test_config(root: &Path) -> TallyConfig {
    let mut config = TallyConfig::default();
    config.storage.data_dir = root.to_path_buf();
    config.workflow.element_wait_ms = 200;
    config.workflow.login_timeout_ms = 150;
    config.workflow.new_window_timeout_ms = 60;
    config.workflow.url_change_timeout_ms = 60;
    config.workflow.dom_marker_timeout_ms = 60;
    config.workflow.detection_poll_ms = 10;
    config.workflow.export_wait_ms = 60;
    config.workflow.download_timeout_ms = 200;
    config.workflow.download_poll_ms = 10;
    config
}

fn orchestrator_with(config: &TallyConfig, profile: PortalProfile, launcher: &FakeLauncher) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig::new(config, profile),
        Arc::new(launcher.clone()),
        Arc::new(ArtifactRegistry::new()),
        DebugStore::shared(config.storage.debug_dir()),
    )
}

fn request() -> ReportRequest {
    ReportRequest::new(
        Credentials::new("85", "octa", "secret"),
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
    )
}

fn view_button() -> Locator {
    Locator::button_text("View")
}

/// Portal that accepts the login and shows the report form
fn logged_in_portal() -> FakeScript {
    FakeScript::new()
        .page(
            LOGIN_URL,
            vec![
                Locator::css("#Company_code"),
                Locator::css("#Username"),
                Locator::css("#pass"),
                Locator::css("#Login"),
            ],
        )
        .on_click(
            Locator::css("#Login"),
            vec![FakeEffect::Navigate(HOME_URL.to_string())],
        )
        .page(REPORT_URL, vec![Locator::css("#Date"), view_button()])
}

/// Report opens in a new window whose Excel link downloads the file
fn new_window_portal() -> FakeScript {
    logged_in_portal()
        .on_click(
            view_button(),
            vec![FakeEffect::OpenWindow(VIEWER_URL.to_string())],
        )
        .page(VIEWER_URL, vec![Locator::link_text("Excel")])
        .on_click_at(
            VIEWER_URL,
            Locator::link_text("Excel"),
            vec![FakeEffect::download("DailyReport.xlsx", b"PK\x03\x04rows".to_vec())],
        )
}

#[tokio::test]
async fn test_report_run_end_to_end() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let launcher = FakeLauncher::new(new_window_portal());
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let receipt = orchestrator.run(request()).await.unwrap();

    assert_eq!(
        receipt.detection.outcome,
        DetectionOutcome::NewWindowFound(tally_core::WindowHandle::new("window-1"))
    );
    assert_eq!(receipt.artifact.file_name, "attendance_report_2024-01-15.xlsx");
    assert_eq!(std::fs::read(&receipt.artifact.path).unwrap(), b"PK\x03\x04rows");
    assert!(receipt
        .artifact
        .path
        .starts_with(config.storage.artifacts_dir().join(&receipt.run_id)));
    assert_eq!(receipt.expires_in_secs(), 3600);
    assert_eq!(
        orchestrator.registry().resolve(&receipt.token),
        Ok(receipt.artifact.path.clone())
    );

    assert_eq!(
        launcher.filled(&Locator::css("#Company_code")),
        Some("85".to_string())
    );
    assert_eq!(launcher.filled(&Locator::css("#Date")), Some("2024-01-15".to_string()));
    assert_eq!(launcher.live_sessions(), 0);
    assert!(launcher.download_dirs().iter().all(|d| !d.exists()));
    assert!(orchestrator.debug_store().list().is_empty());
}

#[tokio::test]
async fn test_missing_download_fails_with_debug_capture() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = logged_in_portal()
        .on_click(
            view_button(),
            vec![FakeEffect::OpenWindow(VIEWER_URL.to_string())],
        )
        .page(VIEWER_URL, vec![Locator::link_text("Excel")]);
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let failure = orchestrator.run(request()).await.unwrap_err();

    assert_eq!(failure.stage, Stage::Downloading);
    assert_eq!(failure.kind, FailureKind::DownloadTimeout);
    assert_eq!(failure.debug.context.run_id, failure.run_id);
    assert_eq!(failure.debug.files.len(), 3);
    assert_eq!(failure.debug.page_url.as_deref(), Some(VIEWER_URL));

    let stored = orchestrator.debug_store().get(failure.debug_id()).unwrap();
    assert_eq!(stored.context.kind, FailureKind::DownloadTimeout);
    assert!(orchestrator.registry().is_empty());
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_login_timeout_registers_nothing() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = FakeScript::new().page(
        LOGIN_URL,
        vec![
            Locator::css("#Company_code"),
            Locator::css("#Username"),
            Locator::css("#pass"),
            Locator::css("#Login"),
        ],
    );
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let failure = orchestrator.run(request()).await.unwrap_err();

    assert_eq!(failure.stage, Stage::LoggingIn);
    assert_eq!(failure.kind, FailureKind::LoginFailed);
    assert!(failure.reason.contains("no landing indicator"));
    assert!(orchestrator.registry().is_empty());
    assert!(!launcher.journal().iter().any(|call| call.contains(REPORT_URL)));
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_rejected_login_reports_portal_message() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let error_box = Locator::css(".validation-summary-errors, .alert-danger, .field-validation-error");
    let script = FakeScript::new()
        .page(
            LOGIN_URL,
            vec![
                Locator::css("#Company_code"),
                Locator::css("#Username"),
                Locator::css("#pass"),
                Locator::css("#Login"),
            ],
        )
        .on_click(Locator::css("#Login"), vec![FakeEffect::Reveal(error_box.clone())])
        .text(error_box, "Invalid username or password");
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let failure = orchestrator.run(request()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::LoginFailed);
    assert_eq!(failure.reason, "portal rejected login: Invalid username or password");
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let launcher = FakeLauncher::new(new_window_portal());
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);
    let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let first = ReportRequest::new(Credentials::new("85", "octa", "secret"), date);
    let second = ReportRequest::new(Credentials::new("86", "other", "hunter2"), date);

    let (a, b) = tokio::join!(orchestrator.run(first), orchestrator.run(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    let company = Locator::css("#Company_code");
    let username = Locator::css("#Username");
    assert_eq!(launcher.filled_in(&a.run_id, &company).as_deref(), Some("85"));
    assert_eq!(launcher.filled_in(&a.run_id, &username).as_deref(), Some("octa"));
    assert_eq!(launcher.filled_in(&b.run_id, &company).as_deref(), Some("86"));
    assert_eq!(launcher.filled_in(&b.run_id, &username).as_deref(), Some("other"));

    assert_ne!(a.run_id, b.run_id);
    assert_ne!(a.token, b.token);
    assert_ne!(a.artifact.path, b.artifact.path);
    assert!(a.artifact.path.exists());
    assert!(b.artifact.path.exists());
    assert_eq!(orchestrator.registry().len(), 2);
    assert_eq!(launcher.sessions_opened(), 2);
    assert_eq!(launcher.peak_live_sessions(), 2);
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_queued_run_honours_cancellation() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.workflow.max_concurrent_runs = 1;
    config.workflow.login_timeout_ms = 5_000;
    config.workflow.request_deadline_secs = 2;
    // Login never lands, so the first run holds the only slot
    let launcher = FakeLauncher::new(
        FakeScript::new().page(
            LOGIN_URL,
            vec![
                Locator::css("#Company_code"),
                Locator::css("#Username"),
                Locator::css("#pass"),
                Locator::css("#Login"),
            ],
        ),
    );
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let holder = orchestrator.run(request());
    let queued = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let result = orchestrator.run_with_cancel(request(), &cancel).await;
        (result, started.elapsed())
    };

    let (held, (queued, waited)) = tokio::join!(holder, queued);
    let failure = queued.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage, Stage::Idle);
    assert!(waited < Duration::from_secs(1), "queued run waited {:?}", waited);
    assert!(orchestrator.debug_store().get(failure.debug_id()).is_some());

    assert!(held.is_err());
    assert_eq!(launcher.sessions_opened(), 1);
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_run_limit_queues_extra_runs() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.workflow.max_concurrent_runs = 1;
    let launcher = FakeLauncher::new(new_window_portal());
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let (a, b, c) = tokio::join!(
        orchestrator.run(request()),
        orchestrator.run(request()),
        orchestrator.run(request())
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(launcher.sessions_opened(), 3);
    assert_eq!(launcher.peak_live_sessions(), 1);
}

#[tokio::test]
async fn test_in_page_marker_found_after_other_strategies() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let marker = Locator::css("a[onclick*=\"exportReport\"]");
    let script = logged_in_portal()
        .on_click(view_button(), vec![FakeEffect::Reveal(marker.clone())])
        .on_click(
            marker.clone(),
            vec![FakeEffect::download("export.xls", b"legacy".to_vec())],
        );
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let receipt = orchestrator.run(request()).await.unwrap();

    assert_eq!(receipt.detection.outcome, DetectionOutcome::ElementFound(marker));
    assert_eq!(
        receipt.detection.tried(),
        vec!["new_window", "url_change", "dom_marker"]
    );
    assert_eq!(receipt.artifact.file_name, "attendance_report_2024-01-15.xls");
    assert!(!launcher
        .journal()
        .iter()
        .any(|call| call.starts_with("switch_to_window")));
}

#[tokio::test]
async fn test_script_export_used_when_no_link_appears() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = logged_in_portal()
        .on_click(
            view_button(),
            vec![FakeEffect::OpenWindow(VIEWER_URL.to_string())],
        )
        .page(VIEWER_URL, vec![])
        .on_script(
            "$find('ReportViewer1')",
            serde_json::json!(true),
            vec![FakeEffect::after(
                Duration::from_millis(20),
                FakeEffect::download("ReportViewer1.xlsx", b"viewer".to_vec()),
            )],
        );
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let receipt = orchestrator.run(request()).await.unwrap();
    assert_eq!(std::fs::read(&receipt.artifact.path).unwrap(), b"viewer");
}

#[tokio::test]
async fn test_nothing_detected_fails_in_detecting_stage() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let launcher = FakeLauncher::new(logged_in_portal());
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let failure = orchestrator.run(request()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Detecting);
    assert_eq!(failure.kind, FailureKind::DetectionFailed);
    assert!(failure.reason.contains("new_window, url_change, dom_marker"));
}

#[tokio::test]
async fn test_browser_crash_still_yields_debug_session() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = logged_in_portal().on_click(view_button(), vec![FakeEffect::Crash]);
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let failure = orchestrator.run(request()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Detecting);
    assert!(failure.debug.files.is_empty());
    assert_eq!(failure.debug.failures.len(), 3);
    assert!(failure.debug.page_url.is_none());
    assert!(orchestrator.debug_store().get(failure.debug_id()).is_some());
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_caller_cancellation_stops_run() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.workflow.login_timeout_ms = 10_000;
    let script = FakeScript::new().page(
        LOGIN_URL,
        vec![
            Locator::css("#Company_code"),
            Locator::css("#Username"),
            Locator::css("#pass"),
            Locator::css("#Login"),
        ],
    );
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let failure = orchestrator
        .run_with_cancel(request(), &cancel)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage, Stage::LoggingIn);
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_request_deadline_cancels_run() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.workflow.login_timeout_ms = 30_000;
    config.workflow.request_deadline_secs = 1;
    let script = FakeScript::new().page(
        LOGIN_URL,
        vec![
            Locator::css("#Company_code"),
            Locator::css("#Username"),
            Locator::css("#pass"),
            Locator::css("#Login"),
        ],
    );
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::sekure_id(), &launcher);

    let started = std::time::Instant::now();
    let failure = orchestrator.run(request()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.reason, "request deadline exceeded");
}

#[tokio::test]
async fn test_cookie_capture_after_login() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = FakeScript::new()
        .page(
            "https://www.vollna.com/login",
            vec![
                Locator::css("input[name='email']"),
                Locator::css("input[name='password']"),
                Locator::css("button[type='submit']"),
            ],
        )
        .on_click(
            Locator::css("button[type='submit']"),
            vec![FakeEffect::Navigate("https://www.vollna.com/dashboard".to_string())],
        )
        .cookie("session", "abc", ".vollna.com")
        .cookie("XSRF-TOKEN", "xyz", ".vollna.com");
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::vollna(), &launcher);

    let capture = orchestrator
        .capture_cookies(
            &Credentials::new("", "ops@example.com", "pw"),
            "https://www.vollna.com/dashboard/projects",
        )
        .await
        .unwrap();

    assert_eq!(capture.cookie_header, "session=abc; XSRF-TOKEN=xyz");
    assert_eq!(capture.cookie_names, vec!["session", "XSRF-TOKEN"]);
    assert_eq!(capture.url, "https://www.vollna.com/dashboard/projects");
    assert_eq!(
        launcher.filled(&Locator::css("input[name='email']")),
        Some("ops@example.com".to_string())
    );
    assert_eq!(launcher.live_sessions(), 0);
}

#[tokio::test]
async fn test_cookie_capture_unreachable_target() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = test_config(temp.path());
    let script = FakeScript::new()
        .page(
            "https://www.vollna.com/login",
            vec![
                Locator::css("input[name='email']"),
                Locator::css("input[name='password']"),
                Locator::css("button[type='submit']"),
            ],
        )
        .on_click(
            Locator::css("button[type='submit']"),
            vec![FakeEffect::Navigate("https://www.vollna.com/dashboard".to_string())],
        )
        .unreachable("https://vollna.invalid/");
    let launcher = FakeLauncher::new(script);
    let orchestrator = orchestrator_with(&config, PortalProfile::vollna(), &launcher);

    let failure = orchestrator
        .capture_cookies(&Credentials::new("", "ops@example.com", "pw"), "https://vollna.invalid/")
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Authenticated);
    assert_eq!(failure.kind, FailureKind::TriggerFailed);
}
