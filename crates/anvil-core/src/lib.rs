//! Anvil Core - shared foundation for the anvil build service
//!
//! This crate provides the error taxonomy, configuration loading, the
//! aggregate binary codec used to persist task actions and cache objects,
//! and content signatures.

pub mod config;
pub mod error;
pub mod serialization;
pub mod signature;

pub use config::{find_config, load_config, load_config_or_default, Config};
pub use error::{AnvilError, ConfigError, Result, SerializationError};
pub use serialization::{ByteString, Deserializer, Serializable, Serializer};
pub use signature::{Signature, SignatureBuilder};
