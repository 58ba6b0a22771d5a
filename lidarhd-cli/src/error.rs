//! CLI-level errors.
//!
//! Everything fatal in the binary funnels into [`CliError`] so `main` has a
//! single place to render failures and pick an exit code.

use std::fmt;

use lidarhd::RunError;

/// Fatal CLI failures.
#[derive(Debug)]
pub enum CliError {
    /// The AOI file could not be read or contains no usable polygon.
    Aoi(String),
    /// A network client could not be constructed.
    Client(String),
    /// The run itself died before producing a report.
    Run(RunError),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Aoi(msg) => write!(f, "AOI error: {}", msg),
            CliError::Client(msg) => write!(f, "client error: {}", msg),
            CliError::Run(e) => write!(f, "run failed: {}", e),
        }
    }
}

impl std::error::Error for CliError {}

impl From<RunError> for CliError {
    fn from(e: RunError) -> Self {
        CliError::Run(e)
    }
}
