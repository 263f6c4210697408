//! Object identity and payloads

use std::fmt;

use anvil_core::serialization::{self, Deserializer, Serializable, Serializer};
use anvil_core::signature::hex;
use anvil_core::{ByteString, SerializationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content id of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(String);

impl DataId {
    /// Wrap an id previously produced by [`CasObject::id`]
    pub fn from_hex(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let valid = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character fan-out prefix used for on-disk layout
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serializable for DataId {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_str(&self.0);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        let value = deserializer.read_string()?;
        Self::from_hex(value.clone()).ok_or(SerializationError::InvalidValue {
            type_name: "DataId",
            message: format!("'{value}' is not a content id"),
        })
    }
}

/// An immutable object: payload bytes plus ordered references
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CasObject {
    pub data: ByteString,
    pub refs: Vec<DataId>,
}

impl CasObject {
    pub fn new(data: impl Into<ByteString>, refs: Vec<DataId>) -> Self {
        Self {
            data: data.into(),
            refs,
        }
    }

    /// Object with no references
    pub fn leaf(data: impl Into<ByteString>) -> Self {
        Self::new(data, Vec::new())
    }

    /// The content id: a hash over the payload and every reference, in order
    pub fn id(&self) -> DataId {
        let mut hasher = Sha256::new();
        hasher.update((self.refs.len() as u64).to_le_bytes());
        for reference in &self.refs {
            hasher.update(reference.as_str().as_bytes());
        }
        hasher.update((self.data.len() as u64).to_le_bytes());
        hasher.update(self.data.as_bytes());
        DataId(hex(&hasher.finalize()))
    }

    /// Encoded form used by on-disk stores
    pub fn to_bytes(&self) -> Vec<u8> {
        serialization::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        serialization::from_bytes(bytes)
    }
}

impl Serializable for CasObject {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| {
            s.serialize(&self.data);
            s.serialize(&self.refs);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        Ok(Self {
            data: deserializer.deserialize()?,
            refs: deserializer.deserialize()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_depends_on_refs() {
        let child = CasObject::leaf("child");
        let a = CasObject::new("parent", vec![child.id()]);
        let b = CasObject::leaf("parent");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_object_encoding_round_trip() {
        let child = CasObject::leaf("x");
        let object = CasObject::new(vec![0u8, 159, 255], vec![child.id()]);
        let decoded = CasObject::from_bytes(&object.to_bytes()).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_data_id_validation() {
        let id = CasObject::leaf("a").id();
        assert_eq!(DataId::from_hex(id.as_str()), Some(id.clone()));
        assert!(DataId::from_hex("not-hex").is_none());
        assert_eq!(id.prefix().len(), 2);
    }
}
