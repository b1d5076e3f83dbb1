//! Typed error hierarchy.
//!
//! Domain-specific failures are typed `thiserror` enums; `main.rs` converts
//! them to `anyhow::Error` with `.context(...)` at the boundary.

use thiserror::Error;

/// Failures loading or saving the durable workflow state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file at {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create artifact directory {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Failures inferring state from on-disk artifacts.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no task description could be inferred from any artifact")]
    NoTaskInferred,

    #[error("failed to read artifact {path}: {source}")]
    ReadArtifact {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Usage errors surfaced directly to the process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(
        "no task provided and no existing run found in the working directory; \
         pass a task description or run from a directory with an existing .cloudforge/"
    )]
    NoTaskAndNoRun,

    #[error("--continue-session {session_id} was given but no state file exists")]
    ContinueSessionNotFound { session_id: String },

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}
