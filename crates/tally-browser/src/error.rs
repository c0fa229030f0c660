//! Browser error types - re-exports the unified TallyError from tally-core
//!
//! Browser failures use these variants:
//! - Browser(String) - launch, CDP and script evaluation failures
//! - Navigation { url, reason } - page load failures
//! - ElementNotFound(String) - a locator matched nothing
//! - SessionClosed - any call after `close()`

pub use tally_core::{Result, TallyError};

pub type BrowserError = TallyError;
