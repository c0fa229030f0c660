//! HTTP error responses

use crate::state::AppState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tally_core::{FailureKind, Stage};
use tally_workflow::{RegistryError, RunFailure};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Where a failed run's diagnostics can be fetched
#[derive(Debug, Clone, Serialize)]
pub struct DebugLinks {
    pub debug_id: String,
    pub debug_files: Vec<String>,
    pub view_all_url: String,
}

/// Body of a failed generation request
#[derive(Debug, Clone, Serialize)]
pub struct FailureResponse {
    pub error: String,
    pub kind: FailureKind,
    pub stage: Stage,
    pub run_id: String,
    pub debug: DebugLinks,
}

impl FailureResponse {
    pub fn new(state: &AppState, failure: &RunFailure) -> Self {
        let dir_name = failure.debug.dir_name();
        Self {
            error: failure.reason.clone(),
            kind: failure.kind,
            stage: failure.stage,
            run_id: failure.run_id.clone(),
            debug: DebugLinks {
                debug_id: failure.debug_id().to_string(),
                debug_files: failure
                    .debug
                    .files
                    .iter()
                    .map(|file| state.debug_file_url(&dir_name, &file.file_name))
                    .collect(),
                view_all_url: state.debug_index_url(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            FailureKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Everything a handler can fail with
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Gone(String),
    Unavailable(String),
    Internal(String),
    Run(Box<FailureResponse>),
}

impl ApiError {
    pub fn run(state: &AppState, failure: &RunFailure) -> Self {
        ApiError::Run(Box::new(FailureResponse::new(state, failure)))
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::NotFound(err.to_string()),
            RegistryError::Expired => ApiError::Gone(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Run(failure) => return (failure.status(), Json(*failure)).into_response(),
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            ApiError::Gone(e) => (StatusCode::GONE, e),
            ApiError::Unavailable(e) => (StatusCode::SERVICE_UNAVAILABLE, e),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}
