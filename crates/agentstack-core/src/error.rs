//! Error types for AgentStack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("export '{export}' conflict: {message}")]
    Conflict { export: String, message: String },

    #[error(
        "unresolved import '{export}'{}",
        .stack.as_ref().map(|s| format!(" required by stack '{}'", s)).unwrap_or_default()
    )]
    UnresolvedImport {
        export: String,
        stack: Option<String>,
    },

    #[error("invalid statement on identity '{identity}': {message}")]
    InvalidStatement { identity: String, message: String },

    #[error(
        "duplicate {kind} name '{name}' in stack '{stack}'{}",
        .owner.as_ref().map(|o| format!(", already owned by stack '{}'", o)).unwrap_or_default()
    )]
    DuplicateResourceName {
        kind: String,
        name: String,
        /// Stack declaring the duplicate.
        stack: String,
        /// Stack already holding the name, when it is another one.
        owner: Option<String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("deployment of stack '{stack}' failed: {message}")]
    DeploymentFailed { stack: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn conflict(export: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            export: export.into(),
            message: message.into(),
        }
    }

    pub fn unresolved(export: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::UnresolvedImport {
            export: export.into(),
            stack: Some(stack.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
