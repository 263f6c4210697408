//! CAS error types

use std::path::PathBuf;

use anvil_core::SerializationError;
use thiserror::Error;

use crate::object::DataId;

/// Result type alias for CAS operations
pub type Result<T> = std::result::Result<T, CasError>;

/// Errors raised by content stores and the tree import/export layer
#[derive(Debug, Error)]
pub enum CasError {
    /// IO error against the store or the file system being imported
    #[error("CAS IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored object could not be decoded
    #[error("CAS object decoding failed: {0}")]
    Serialization(#[from] SerializationError),

    /// A referenced object is not present in the store
    #[error("CAS object not found: {0}")]
    ObjectNotFound(DataId),

    /// An object exists but does not describe a file system node
    #[error("invalid file system node {id}: {message}")]
    InvalidNode { id: DataId, message: String },

    /// A path cannot be imported (sockets, devices)
    #[error("unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),

    /// A configured size limit could not be parsed
    #[error("invalid {origin}: '{value}'")]
    InvalidSizeLimit { value: String, origin: String },

    /// The remote mirror failed
    #[error("remote cache error: {0}")]
    Remote(String),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
