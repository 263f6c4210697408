//! Aggregate binary codec
//!
//! A MessagePack-compatible encoding used to persist task actions and the
//! objects the caching layer stores in the CAS. Composite values are written
//! as aggregates: an array header carrying the element count, followed by
//! exactly that many values. Decoders call [`Deserializer::begin_aggregate`]
//! with the count they expect, so a writer that adds a field without bumping
//! the count on both sides is detected instead of silently desynchronizing.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::SerializationError;

type Result<T> = std::result::Result<T, SerializationError>;

const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const INT8: u8 = 0xd0;
const INT16: u8 = 0xd1;
const INT32: u8 = 0xd2;
const INT64: u8 = 0xd3;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;
const ARRAY32: u8 = 0xdd;

/// A value that can round-trip through the aggregate codec
pub trait Serializable: Sized {
    /// Write this value
    fn serialize(&self, serializer: &mut Serializer);

    /// Read a value previously written by [`Serializable::serialize`]
    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self>;
}

/// Encode a single value into a fresh buffer
pub fn to_bytes<T: Serializable>(value: &T) -> Vec<u8> {
    let mut serializer = Serializer::new();
    value.serialize(&mut serializer);
    serializer.into_bytes()
}

/// Decode a single value, rejecting trailing bytes
pub fn from_bytes<T: Serializable>(bytes: &[u8]) -> Result<T> {
    let mut deserializer = Deserializer::new(bytes);
    let value = T::deserialize(&mut deserializer)?;
    if !deserializer.is_at_end() {
        return Err(SerializationError::TrailingBytes(deserializer.remaining()));
    }
    Ok(value)
}

#[derive(Debug)]
struct AggregateFrame {
    expected: usize,
    written: usize,
}

/// Writer half of the codec
#[derive(Debug, Default)]
pub struct Serializer {
    buf: Vec<u8>,
    frames: Vec<AggregateFrame>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize any value
    pub fn serialize<T: Serializable>(&mut self, value: &T) {
        value.serialize(self);
    }

    /// Start an aggregate of exactly `count` elements
    pub fn begin_aggregate(&mut self, count: usize) {
        self.note_element();
        self.write_array_header(count);
        self.frames.push(AggregateFrame {
            expected: count,
            written: 0,
        });
    }

    /// Close the innermost aggregate
    pub fn end_aggregate(&mut self) {
        let frame = self.frames.pop();
        debug_assert!(frame.is_some(), "end_aggregate without begin_aggregate");
        if let Some(frame) = frame {
            debug_assert_eq!(
                frame.written, frame.expected,
                "aggregate declared {} elements but {} were written",
                frame.expected, frame.written
            );
        }
    }

    /// Write an aggregate whose body is produced by `body`
    pub fn serialize_aggregate(&mut self, count: usize, body: impl FnOnce(&mut Self)) {
        self.begin_aggregate(count);
        body(self);
        self.end_aggregate();
    }

    pub fn serialize_nil(&mut self) {
        self.note_element();
        self.buf.push(NIL);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.note_element();
        self.buf.push(if value { TRUE } else { FALSE });
    }

    pub fn write_u64(&mut self, value: u64) {
        self.note_element();
        if value < 0x80 {
            self.buf.push(value as u8);
        } else if value <= u8::MAX as u64 {
            self.buf.push(UINT8);
            self.buf.push(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.push(UINT16);
            self.buf.extend_from_slice(&(value as u16).to_be_bytes());
        } else if value <= u32::MAX as u64 {
            self.buf.push(UINT32);
            self.buf.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buf.push(UINT64);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn write_i64(&mut self, value: i64) {
        if value >= 0 {
            self.write_u64(value as u64);
            return;
        }
        self.note_element();
        if value >= -32 {
            self.buf.push(value as i8 as u8);
        } else if value >= i8::MIN as i64 {
            self.buf.push(INT8);
            self.buf.push(value as i8 as u8);
        } else if value >= i16::MIN as i64 {
            self.buf.push(INT16);
            self.buf.extend_from_slice(&(value as i16).to_be_bytes());
        } else if value >= i32::MIN as i64 {
            self.buf.push(INT32);
            self.buf.extend_from_slice(&(value as i32).to_be_bytes());
        } else {
            self.buf.push(INT64);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn write_str(&mut self, value: &str) {
        self.note_element();
        let len = value.len();
        if len < 32 {
            self.buf.push(0xa0 | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.push(STR8);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.push(STR16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(STR32);
            self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.note_element();
        let len = value.len();
        if len <= u8::MAX as usize {
            self.buf.push(BIN8);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.push(BIN16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(BIN32);
            self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(value);
    }

    /// The bytes written so far
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.frames.is_empty(), "unterminated aggregate");
        self.buf
    }

    fn note_element(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.written += 1;
        }
    }

    fn write_array_header(&mut self, count: usize) {
        if count < 16 {
            self.buf.push(0x90 | count as u8);
        } else if count <= u16::MAX as usize {
            self.buf.push(ARRAY16);
            self.buf.extend_from_slice(&(count as u16).to_be_bytes());
        } else {
            self.buf.push(ARRAY32);
            self.buf.extend_from_slice(&(count as u32).to_be_bytes());
        }
    }
}

/// Reader half of the codec
#[derive(Debug)]
pub struct Deserializer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Deserialize any value
    pub fn deserialize<T: Serializable>(&mut self) -> Result<T> {
        T::deserialize(self)
    }

    /// Read an aggregate header and require it to carry `expected` elements
    pub fn begin_aggregate(&mut self, expected: usize) -> Result<()> {
        let found = self.read_aggregate_len()?;
        if found != expected {
            return Err(SerializationError::AggregateCountMismatch { expected, found });
        }
        Ok(())
    }

    /// Read an aggregate header of any size, returning its element count
    pub fn read_aggregate_len(&mut self) -> Result<usize> {
        let offset = self.pos;
        let marker = self.read_u8()?;
        match marker {
            0x90..=0x9f => Ok((marker & 0x0f) as usize),
            ARRAY16 => Ok(u16::from_be_bytes(self.read_array()?) as usize),
            ARRAY32 => Ok(u32::from_be_bytes(self.read_array()?) as usize),
            _ => Err(self.incorrect("aggregate", marker, offset)),
        }
    }

    /// Consume a nil if one is next, returning whether it did
    pub fn deserialize_nil(&mut self) -> bool {
        if self.peek() == Some(NIL) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let offset = self.pos;
        match self.read_u8()? {
            TRUE => Ok(true),
            FALSE => Ok(false),
            marker => Err(self.incorrect("bool", marker, offset)),
        }
    }

    pub fn read_i128(&mut self) -> Result<i128> {
        let offset = self.pos;
        let marker = self.read_u8()?;
        let value = match marker {
            0x00..=0x7f => marker as i128,
            0xe0..=0xff => marker as i8 as i128,
            UINT8 => self.read_u8()? as i128,
            UINT16 => u16::from_be_bytes(self.read_array()?) as i128,
            UINT32 => u32::from_be_bytes(self.read_array()?) as i128,
            UINT64 => u64::from_be_bytes(self.read_array()?) as i128,
            INT8 => self.read_u8()? as i8 as i128,
            INT16 => i16::from_be_bytes(self.read_array()?) as i128,
            INT32 => i32::from_be_bytes(self.read_array()?) as i128,
            INT64 => i64::from_be_bytes(self.read_array()?) as i128,
            _ => return Err(self.incorrect("integer", marker, offset)),
        };
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.read_i128()?;
        u64::try_from(value).map_err(|_| SerializationError::IntegerOutOfRange {
            value,
            target: "u64",
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let value = self.read_i128()?;
        i64::try_from(value).map_err(|_| SerializationError::IntegerOutOfRange {
            value,
            target: "i64",
        })
    }

    pub fn read_string(&mut self) -> Result<String> {
        let offset = self.pos;
        let marker = self.read_u8()?;
        let len = match marker {
            0xa0..=0xbf => (marker & 0x1f) as usize,
            STR8 => self.read_u8()? as usize,
            STR16 => u16::from_be_bytes(self.read_array()?) as usize,
            STR32 => u32::from_be_bytes(self.read_array()?) as usize,
            _ => return Err(self.incorrect("string", marker, offset)),
        };
        let start = self.pos;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| SerializationError::InvalidUtf8 { offset: start })
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let offset = self.pos;
        let marker = self.read_u8()?;
        let len = match marker {
            BIN8 => self.read_u8()? as usize,
            BIN16 => u16::from_be_bytes(self.read_array()?) as usize,
            BIN32 => u32::from_be_bytes(self.read_array()?) as usize,
            _ => return Err(self.incorrect("bytes", marker, offset)),
        };
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = self
            .peek()
            .ok_or(SerializationError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(SerializationError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn incorrect(&self, expected: &'static str, marker: u8, offset: usize) -> SerializationError {
        SerializationError::IncorrectType {
            expected,
            marker,
            offset,
        }
    }
}

/// An owned byte string, encoded as a binary value rather than an array of ints
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteString(pub Vec<u8>);

impl ByteString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Lossy UTF-8 view, for diagnostics
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteString({:?})", self.as_string())
    }
}

impl From<&str> for ByteString {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Serializable for ByteString {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_bytes(&self.0);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        deserializer.read_bytes().map(Self)
    }
}

impl Serializable for bool {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_bool(*self);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        deserializer.read_bool()
    }
}

macro_rules! unsigned_serializable {
    ($($ty:ty),*) => {$(
        impl Serializable for $ty {
            fn serialize(&self, serializer: &mut Serializer) {
                serializer.write_u64(*self as u64);
            }

            fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
                let value = deserializer.read_i128()?;
                <$ty>::try_from(value).map_err(|_| SerializationError::IntegerOutOfRange {
                    value,
                    target: stringify!($ty),
                })
            }
        }
    )*};
}

macro_rules! signed_serializable {
    ($($ty:ty),*) => {$(
        impl Serializable for $ty {
            fn serialize(&self, serializer: &mut Serializer) {
                serializer.write_i64(*self as i64);
            }

            fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
                let value = deserializer.read_i128()?;
                <$ty>::try_from(value).map_err(|_| SerializationError::IntegerOutOfRange {
                    value,
                    target: stringify!($ty),
                })
            }
        }
    )*};
}

unsigned_serializable!(u8, u16, u32, u64, usize);
signed_serializable!(i32, i64);

impl Serializable for String {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_str(self);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        deserializer.read_string()
    }
}

impl Serializable for PathBuf {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.write_str(&self.to_string_lossy());
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        deserializer.read_string().map(PathBuf::from)
    }
}

impl<T: Serializable> Serializable for Option<T> {
    fn serialize(&self, serializer: &mut Serializer) {
        match self {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_nil(),
        }
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        if deserializer.deserialize_nil() {
            Ok(None)
        } else {
            T::deserialize(deserializer).map(Some)
        }
    }
}

impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.begin_aggregate(self.len());
        for item in self {
            item.serialize(serializer);
        }
        serializer.end_aggregate();
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        let count = deserializer.read_aggregate_len()?;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(T::deserialize(deserializer)?);
        }
        Ok(items)
    }
}

impl<K: Serializable + Ord, V: Serializable> Serializable for BTreeMap<K, V> {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.begin_aggregate(self.len());
        for (key, value) in self {
            serializer.serialize_aggregate(2, |s| {
                key.serialize(s);
                value.serialize(s);
            });
        }
        serializer.end_aggregate();
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        let count = deserializer.read_aggregate_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            deserializer.begin_aggregate(2)?;
            let key = K::deserialize(deserializer)?;
            let value = V::deserialize(deserializer)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
        paths: Vec<PathBuf>,
        limit: Option<i64>,
    }

    impl Serializable for Sample {
        fn serialize(&self, serializer: &mut Serializer) {
            serializer.serialize_aggregate(4, |s| {
                s.serialize(&self.name);
                s.serialize(&self.count);
                s.serialize(&self.paths);
                s.serialize(&self.limit);
            });
        }

        fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
            deserializer.begin_aggregate(4)?;
            Ok(Self {
                name: deserializer.deserialize()?,
                count: deserializer.deserialize()?,
                paths: deserializer.deserialize()?,
                limit: deserializer.deserialize()?,
            })
        }
    }

    #[test]
    fn test_aggregate_round_trip() {
        let sample = Sample {
            name: "swift-driver".to_string(),
            count: 70_000,
            paths: vec![PathBuf::from("/tmp/a.o"), PathBuf::from("/tmp/b.o")],
            limit: Some(-4096),
        };

        let bytes = to_bytes(&sample);
        let decoded: Sample = from_bytes(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_aggregate_count_mismatch_is_detected() {
        let mut serializer = Serializer::new();
        serializer.serialize_aggregate(2, |s| {
            s.serialize(&1u8);
            s.serialize(&2u8);
        });
        let bytes = serializer.into_bytes();

        let mut deserializer = Deserializer::new(&bytes);
        let err = deserializer.begin_aggregate(3).unwrap_err();
        assert_eq!(
            err,
            SerializationError::AggregateCountMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn test_integer_encoding_is_msgpack_compatible() {
        assert_eq!(to_bytes(&5u64), vec![0x05]);
        assert_eq!(to_bytes(&200u64), vec![0xcc, 200]);
        assert_eq!(to_bytes(&-1i64), vec![0xff]);
        assert_eq!(to_bytes(&-100i64), vec![0xd0, (-100i8) as u8]);
        assert_eq!(to_bytes(&"hi".to_string()), vec![0xa2, b'h', b'i']);
    }

    #[test]
    fn test_option_uses_nil() {
        let none: Option<String> = None;
        assert_eq!(to_bytes(&none), vec![0xc0]);
        let decoded: Option<String> = from_bytes(&[0xc0]).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_byte_string_is_binary() {
        let value = ByteString::from("out");
        let bytes = to_bytes(&value);
        assert_eq!(bytes[0], 0xc4);
        let decoded: ByteString = from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("TMPDIR".to_string(), "/tmp".to_string());
        map.insert("PATH".to_string(), "/usr/bin".to_string());
        let decoded: BTreeMap<String, String> = from_bytes(&to_bytes(&map)).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = to_bytes(&"a longer string value".to_string());
        let err = from_bytes::<String>(&bytes[..4]).unwrap_err();
        assert!(matches!(err, SerializationError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = to_bytes(&true);
        bytes.push(0x01);
        let err = from_bytes::<bool>(&bytes).unwrap_err();
        assert_eq!(err, SerializationError::TrailingBytes(1));
    }

    #[test]
    fn test_incorrect_type_reported() {
        let bytes = to_bytes(&7u8);
        let err = from_bytes::<String>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            SerializationError::IncorrectType {
                expected: "string",
                ..
            }
        ));
    }
}
