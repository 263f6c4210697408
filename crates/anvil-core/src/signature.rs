//! Content signatures
//!
//! Signatures fingerprint task configurations for incremental rebuild checks
//! and identify activities. Every component is length-prefixed before being
//! hashed so that `["ab", "c"]` and `["a", "bc"]` never collide.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SerializationError;
use crate::serialization::{Deserializer, Serializable, Serializer};

/// A SHA-256 digest rendered as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    /// Signature over a single string
    pub fn of_str(value: &str) -> Self {
        let mut builder = SignatureBuilder::new();
        builder.add_str(value);
        builder.finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serializable for Signature {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_str(&self.0);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        let value = deserializer.read_string()?;
        if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SerializationError::InvalidValue {
                type_name: "Signature",
                message: format!("'{value}' is not a SHA-256 digest"),
            });
        }
        Ok(Self(value))
    }
}

/// Incrementally builds a [`Signature`]
#[derive(Clone, Default)]
pub struct SignatureBuilder {
    hasher: Sha256,
}

impl SignatureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_str(&mut self, value: &str) -> &mut Self {
        self.add_bytes(value.as_bytes())
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    pub fn add_number(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.hasher.update([value as u8]);
        self
    }

    pub fn add_path(&mut self, value: &Path) -> &mut Self {
        self.add_str(&value.to_string_lossy())
    }

    /// Mix in another signature
    pub fn add_signature(&mut self, value: &Signature) -> &mut Self {
        self.add_str(value.as_str())
    }

    pub fn finish(&self) -> Signature {
        let digest = self.hasher.clone().finalize();
        Signature(hex(&digest))
    }
}

/// Lowercase hex rendering of a byte slice
pub fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
