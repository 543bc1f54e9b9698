//! Typed error hierarchy for the Anvil build engine.
//!
//! Two top-level enums cover the two failure domains:
//! - `EngineError`: API-boundary failures (trigger validation, persistence)
//! - `BuildFailure`: failures inside a running build that finalize the
//!   record as `fail` (source sync, command exit, command timeout)
//!
//! Anything that escapes both domains is an internal fault: the orchestrator
//! catches it at the top of the build task and finalizes the record as
//! `error` so infrastructure faults stay distinguishable from broken builds.

use thiserror::Error;

/// Errors surfaced at the engine's API boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Repository {owner}/{repo} not found")]
    UnknownRepository { owner: String, repo: String },

    #[error("Repository {owner}/{repo} already registered")]
    DuplicateRepository { owner: String, repo: String },

    #[error("Build {id} not found")]
    BuildNotFound { id: i64 },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures inside a running build.
///
/// Every variant carries the output captured up to the point of failure so
/// the orchestrator can append it to the build log before finalizing.
#[derive(Debug, Error)]
pub enum BuildFailure {
    #[error("Source synchronization failed: {message}")]
    Sync { message: String, output: String },

    #[error("Command `{command}` exited with code {exit_code}")]
    Command {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Command `{command}` timed out after {timeout_secs}s")]
    Timeout {
        command: String,
        timeout_secs: u64,
        output: String,
    },
}

impl BuildFailure {
    /// Output captured before the failure occurred.
    pub fn output(&self) -> &str {
        match self {
            Self::Sync { output, .. }
            | Self::Command { output, .. }
            | Self::Timeout { output, .. } => output,
        }
    }
}
