//! Task execution error types

use std::path::PathBuf;

use anvil_cas::CasError;
use anvil_core::SerializationError;
use thiserror::Error;

/// Result type alias for task execution
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors raised while setting up or performing task actions
#[derive(Debug, Error)]
pub enum TaskError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Content store error
    #[error(transparent)]
    Cas(#[from] CasError),

    /// Persisted payload could not be decoded
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// The task does not carry the payload its action expects
    #[error("invalid payload for {0}")]
    InvalidPayload(&'static str),

    /// No action is registered for a tool identifier
    #[error("unknown tool identifier '{0}'")]
    UnknownTool(String),

    /// A dynamic task key does not match the tool that was asked to build it
    #[error("unexpected task key for tool '{0}'")]
    UnexpectedTaskKey(String),

    /// No planned build is registered under the identifier
    #[error("no planned build for '{0}'")]
    MissingPlannedBuild(String),

    /// A driver job key is not part of the planned build
    #[error("no driver job {key} in planned build '{identifier}'")]
    MissingDriverJob { identifier: String, key: String },

    /// A cache hit does not fit the task being replayed
    #[error("Unexpectedly found cache hit with {found} outputs for task with {expected} outputs")]
    OutputCountMismatch { found: usize, expected: usize },

    /// A process could not be started
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A command line with no program
    #[error("empty command line")]
    EmptyCommandLine,

    /// A required file is missing
    #[error("missing input: {0}")]
    MissingInput(PathBuf),

    /// The scheduler delivered a callback the action was not prepared for
    #[error("{0}")]
    Protocol(String),

    /// The operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Create a scheduler-contract violation
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }
}
