//! Route handlers

use crate::error::ApiError;
use crate::state::{AppState, SharedState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use tally_core::{
    parse_report_date, portal_today, CaptureFailure, Credentials, DebugSession, FailureKind,
    ReportRequest, Stage, REPORT_DATE_FORMAT,
};
use tally_workflow::{is_valid_debug_id, DebugStore, ReportReceipt};
use tracing::{info, warn};

/// Body of `POST /generate-report`; every field falls back to the configured default
#[derive(Debug, Default, Deserialize)]
pub struct GenerateReportBody {
    #[serde(default)]
    pub company_code: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// `YYYY-MM-DD`; today in the portal's time zone when omitted
    #[serde(default)]
    pub report_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub status: &'static str,
    pub report_url: String,
    pub file_id: String,
    pub file_name: String,
    pub report_date: String,
    pub generated_at: DateTime<Utc>,
    /// Seconds until `report_url` stops working
    pub expires_in: i64,
}

/// Body of `POST /session-cookies`
#[derive(Debug, Default, Deserialize)]
pub struct SessionCookiesBody {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionCookiesResponse {
    pub status: &'static str,
    pub cookies: String,
    pub cookie_names: Vec<String>,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DebugSummary {
    pub debug_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
    pub page_url: Option<String>,
    pub file_count: usize,
    pub details_url: String,
}

#[derive(Debug, Serialize)]
pub struct DebugListResponse {
    pub count: usize,
    pub sessions: Vec<DebugSummary>,
}

#[derive(Debug, Serialize)]
pub struct DebugFileLink {
    pub file_name: String,
    pub kind: tally_core::CaptureKind,
    pub size_bytes: u64,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DebugDetailResponse {
    pub debug_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
    pub page_url: Option<String>,
    pub files: Vec<DebugFileLink>,
    pub capture_failures: Vec<CaptureFailure>,
}

fn pick(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

/// Resolve defaults and validate the date before any browser is started
fn build_request(state: &AppState, body: GenerateReportBody) -> Result<ReportRequest, ApiError> {
    let defaults = &state.defaults;
    let credentials = Credentials::new(
        pick(body.company_code, &defaults.company_code),
        pick(body.username, &defaults.username),
        pick(body.password, &defaults.password),
    );
    let report_date = match body.report_date.filter(|d| !d.is_empty()) {
        Some(raw) => parse_report_date(&raw)
            .ok_or_else(|| ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string()))?,
        None => portal_today(state.portal_utc_offset_minutes),
    };
    Ok(ReportRequest::new(credentials, report_date))
}

async fn generate(state: &AppState, request: ReportRequest) -> Result<ReportReceipt, ApiError> {
    state
        .reports
        .run(request)
        .await
        .map_err(|failure| ApiError::run(state, &failure))
}

fn report_response(state: &AppState, receipt: &ReportReceipt) -> ReportResponse {
    ReportResponse {
        status: "success",
        report_url: state.download_url(&receipt.token),
        file_id: receipt.token.clone(),
        file_name: receipt.artifact.file_name.clone(),
        report_date: receipt.report_date.format(REPORT_DATE_FORMAT).to_string(),
        generated_at: receipt.generated_at,
        expires_in: receipt.expires_in_secs(),
    }
}

/// Debug store lookups read manifests from disk; keep them off the async workers
async fn with_debug_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&DebugStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = state.debug_store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("Debug store lookup failed: {}", e)))
}

async fn file_response(
    path: &FsPath,
    content_type: &str,
    attachment: Option<&str>,
) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        warn!("Could not read {}: {}", path.display(), e);
        ApiError::NotFound("File no longer available".to_string())
    })?;

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.to_string())],
        bytes,
    )
        .into_response();
    if let Some(file_name) = attachment {
        let disposition = format!("attachment; filename={}", file_name);
        match header::HeaderValue::from_str(&disposition) {
            Ok(value) => {
                response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
            }
            Err(e) => warn!("Skipping Content-Disposition for {}: {}", file_name, e),
        }
    }
    Ok(response)
}

/// GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Tally report generator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /generate-report": "Generate a report and return a download link",
            "GET /get-report-default": "Generate a report with the default credentials",
            "GET /get-report-default-direct": "Generate a report with the default credentials and return the file",
            "GET /download/{file_id}": "Download a generated report",
            "GET /debug": "List debug sessions",
            "GET /debug/{debug_id}": "Show one debug session",
            "GET /files/debug_{debug_id}/{file}": "Fetch a captured debug file",
            "POST /session-cookies": "Log into the cookie portal and return its session cookies",
            "GET /health": "Health check"
        }
    }))
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// POST /generate-report
pub async fn generate_report(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<ReportResponse>, ApiError> {
    let request = build_request(&state, parse_body(&body)?)?;
    let receipt = generate(&state, request).await?;
    info!("Report {} ready for {}", receipt.artifact.file_name, receipt.run_id);
    Ok(Json(report_response(&state, &receipt)))
}

/// GET /get-report-default
pub async fn report_default(State(state): State<SharedState>) -> Result<Json<ReportResponse>, ApiError> {
    let request = build_request(&state, GenerateReportBody::default())?;
    let receipt = generate(&state, request).await?;
    Ok(Json(report_response(&state, &receipt)))
}

/// GET /get-report-default-direct
pub async fn report_default_direct(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let request = build_request(&state, GenerateReportBody::default())?;
    let receipt = generate(&state, request).await?;
    file_response(
        &receipt.artifact.path,
        &receipt.artifact.content_type,
        Some(&receipt.artifact.file_name),
    )
    .await
}

/// GET /download/:file_id
pub async fn download(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let entry = state.registry.lookup(&file_id)?;
    file_response(
        &entry.artifact.path,
        &entry.artifact.content_type,
        Some(&entry.artifact.file_name),
    )
    .await
}

/// GET /debug
pub async fn list_debug(
    State(state): State<SharedState>,
) -> Result<Json<DebugListResponse>, ApiError> {
    let sessions: Vec<DebugSummary> = with_debug_store(&state, |store| store.list())
        .await?
        .into_iter()
        .map(|session| DebugSummary {
            details_url: format!("{}/{}", state.debug_index_url(), session.debug_id),
            file_count: session.files.len(),
            debug_id: session.debug_id,
            created_at: session.created_at,
            run_id: session.context.run_id,
            stage: session.context.stage,
            kind: session.context.kind,
            reason: session.context.reason,
            page_url: session.page_url,
        })
        .collect();
    Ok(Json(DebugListResponse {
        count: sessions.len(),
        sessions,
    }))
}

fn debug_detail(state: &AppState, session: DebugSession) -> DebugDetailResponse {
    let dir_name = session.dir_name();
    DebugDetailResponse {
        files: session
            .files
            .iter()
            .map(|file| DebugFileLink {
                file_name: file.file_name.clone(),
                kind: file.kind,
                size_bytes: file.size_bytes,
                url: state.debug_file_url(&dir_name, &file.file_name),
            })
            .collect(),
        debug_id: session.debug_id,
        created_at: session.created_at,
        run_id: session.context.run_id,
        stage: session.context.stage,
        kind: session.context.kind,
        reason: session.context.reason,
        page_url: session.page_url,
        capture_failures: session.failures,
    }
}

/// GET /debug/:debug_id
pub async fn show_debug(
    State(state): State<SharedState>,
    Path(debug_id): Path<String>,
) -> Result<Json<DebugDetailResponse>, ApiError> {
    let lookup_id = debug_id.clone();
    let session = with_debug_store(&state, move |store| store.get(&lookup_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Debug session {} not found", debug_id)))?;
    Ok(Json(debug_detail(&state, session)))
}

/// GET /files/:dir/:file, where `dir` is `debug_{id}`
pub async fn debug_file(
    State(state): State<SharedState>,
    Path((dir, file)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound("File not found".to_string());
    let debug_id = dir.strip_prefix("debug_").ok_or_else(not_found)?;
    if !is_valid_debug_id(debug_id) {
        return Err(not_found());
    }
    let debug_id = debug_id.to_string();
    let path = with_debug_store(&state, move |store| store.file_path(&debug_id, &file))
        .await?
        .ok_or_else(not_found)?;
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    file_response(&path, &content_type, None).await
}

/// POST /session-cookies
pub async fn session_cookies(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<SessionCookiesResponse>, ApiError> {
    let service = state
        .cookies
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("Cookie portal is not configured".to_string()))?;
    let body: SessionCookiesBody = parse_body(&body)?;

    let credentials = Credentials::new(
        "",
        pick(body.email, &service.defaults.username),
        pick(body.password, &service.defaults.password),
    );
    if credentials.username.is_empty() || credentials.password.is_empty() {
        return Err(ApiError::BadRequest("email and password are required".to_string()));
    }
    let target_url = pick(body.url, &service.target_url);

    let capture = service
        .orchestrator
        .capture_cookies(&credentials, &target_url)
        .await
        .map_err(|failure| ApiError::run(&state, &failure))?;

    Ok(Json(SessionCookiesResponse {
        status: "success",
        cookies: capture.cookie_header,
        cookie_names: capture.cookie_names,
        url: capture.url,
    }))
}
