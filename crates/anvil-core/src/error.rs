//! Error types for anvil

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using AnvilError
pub type Result<T> = std::result::Result<T, AnvilError>;

/// Main error type for anvil core operations
#[derive(Debug, Error)]
pub enum AnvilError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binary codec errors
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding the aggregate binary format
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    /// Input ended before the value was complete
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    /// An aggregate header carried a different element count
    #[error("aggregate count mismatch: expected {expected}, found {found}")]
    AggregateCountMismatch { expected: usize, found: usize },

    /// The next value has a different type than requested
    #[error("incorrect type at offset {offset}: expected {expected}, found marker 0x{marker:02x}")]
    IncorrectType {
        expected: &'static str,
        marker: u8,
        offset: usize,
    },

    /// A decoded integer does not fit the requested type
    #[error("integer {value} out of range for {target}")]
    IntegerOutOfRange { value: i128, target: &'static str },

    /// String payload is not valid UTF-8
    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// An enum tag is not known to this version
    #[error("unsupported {type_name} tag {tag}")]
    UnsupportedVariant { type_name: &'static str, tag: u64 },

    /// A value decoded but failed its own validation
    #[error("invalid {type_name}: {message}")]
    InvalidValue {
        type_name: &'static str,
        message: String,
    },

    /// Bytes were left over after decoding a complete value
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

impl AnvilError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}
