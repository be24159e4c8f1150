//! Crate-level error type.
//!
//! Every fallible operation in the pipeline returns [`crate::Result`].
//! The taxonomy mirrors the recovery rules: configuration and training
//! errors are fatal for a run, dependency and hardware errors are
//! recovered locally, deployment incompatibilities trigger strategy
//! fallback before they ever reach the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Pipeline error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or incomplete configuration, detected before any
    /// external call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Training-data file missing, unreadable, or empty after
    /// validation.
    #[error("training data error: {0}")]
    Data(String),

    /// A required external dependency is missing and on-demand
    /// installation failed.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Exception inside the optimization loop. Fatal for the run.
    #[error("training failed: {0}")]
    Training(String),

    /// Deployment failed after all applicable strategies were tried.
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Adapter weight consolidation failed beyond the per-parameter
    /// recovery rules.
    #[error("merge failed: {0}")]
    Merge(String),

    /// An external tool could not be located on any search path.
    #[error("external tool not found: {0}")]
    ToolNotFound(String),

    /// An external tool ran but exited unsuccessfully.
    #[error("{tool} failed (exit {code:?}): {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// An external tool exceeded its timeout and was killed.
    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    /// Adapter id not present in the registry.
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    /// Registry record exists but its weights directory is gone.
    #[error("adapter weights missing at {0}")]
    WeightsMissing(PathBuf),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
