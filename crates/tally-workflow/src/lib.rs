//! # tally-workflow
//!
//! Report workflow orchestration for Tally.
//!
//! This crate provides:
//! - Portal profiles (locators, landing indicators, export methods)
//! - Login, report trigger and ordered artifact detection
//! - Export activation and download completion detection
//! - Failure-time debug capture and the on-disk debug store
//! - The short-lived download token registry
//! - The per-run state machine and the orchestrator that drives it

mod auth;
mod debug_recorder;
mod detector;
mod download;
mod error;
mod export;
mod orchestrator;
mod profile;
mod registry;
mod state_machine;
mod trigger;

pub use auth::{Authenticated, Authenticator};
pub use debug_recorder::{is_valid_debug_id, new_debug_id, DebugRecorder, DebugStore, MANIFEST_FILE};
pub use detector::{
    ArtifactDetector, Detection, DetectionBaseline, DetectionStrategy, DomMarkerStrategy,
    NewWindowStrategy, StrategyAttempt, UrlChangeStrategy,
};
pub use download::{artifact_file_name, store_artifact, DownloadHandle, DownloadWatcher};
pub use error::{RegistryError, RunFailure, StepFailure, StepResult};
pub use export::{enter_result_context, export_chain, run_export};
pub use orchestrator::{CookieCapture, Orchestrator, OrchestratorConfig, ReportReceipt};
pub use profile::{
    DownloadRules, ExportMethod, LandingIndicator, LoginField, PortalProfile, ReportPage,
};
pub use registry::{ArtifactRegistry, RegistryEntry};
pub use state_machine::{transition, Action, Event, State};
pub use trigger::{ReportTrigger, Triggered};
