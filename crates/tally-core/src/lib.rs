//! # tally-core
//!
//! Core types for the Tally report automation service.
//!
//! Tally drives a third-party, login-gated web portal through a headless browser,
//! asks it to generate a tabular report, and hands the resulting file out through a
//! short-lived download token. This crate holds the pieces every other layer shares:
//!
//! - The failure taxonomy and the unified [`TallyError`]
//! - The run data model (credentials, requests, detection outcomes, debug captures)
//! - Process-wide configuration loaded once at startup
//! - The cancellable "poll until predicate or deadline" primitive

pub mod config;
mod error;
pub mod fail_open;
pub mod poll;
mod types;

pub use config::{TallyConfig, DEFAULT_CONFIG_PATH};
pub use error::{FailureKind, Result, TallyError};
pub use poll::{poll_until, PollOutcome, PollSpec};
pub use types::*;

pub use tokio_util::sync::CancellationToken;
