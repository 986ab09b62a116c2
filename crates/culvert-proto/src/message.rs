//! Typed protocol messages and their binary encoding
//!
//! A message is a command tag, a logical connection identifier, and an
//! ordered property table. The encoding is deterministic: iteration
//! order is insertion order, every length field is explicit, and every
//! value carries its type tag, so a round trip reproduces the input
//! byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Well-known property keys
pub mod key {
    pub const ADDRESS: &str = "address";
    pub const PORT: &str = "port";
    pub const CONFIGURATION: &str = "configuration";
    pub const PACKETS: &str = "packets";
    pub const PROTOCOLS: &str = "protocols";
    pub const RESULT_CODE: &str = "result-code";
    pub const TUNNEL_TYPE: &str = "tunnel-type";
    pub const HOST: &str = "host";
    pub const IDENTIFIER: &str = "identifier";
    pub const NETMASK: &str = "netmask";
    pub const DNS: &str = "dns";
    pub const OVERHEAD: &str = "overhead";
}

/// Message-level codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown command tag: {0}")]
    UnknownCommand(u8),

    #[error("Unknown value tag: {0}")]
    UnknownValueTag(u8),

    #[error("Duplicate property key: {0}")]
    DuplicateKey(String),

    #[error("Truncated message")]
    Truncated,

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),

    #[error("Invalid UTF-8 in key or string value")]
    InvalidUtf8,

    #[error("Value length {len} invalid for tag {tag}")]
    InvalidValueLength { tag: u8, len: usize },

    #[error("Field overflow: {0}")]
    FieldOverflow(&'static str),

    #[error("Encoded message too large: {0} bytes")]
    TooLarge(usize),
}

/// Protocol command vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Data = 1,
    Suspend = 2,
    Resume = 3,
    Close = 4,
    Dns = 5,
    Open = 6,
    OpenResult = 7,
    Packets = 8,
    FetchConfiguration = 9,
}

impl TryFrom<u8> for Command {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Data),
            2 => Ok(Command::Suspend),
            3 => Ok(Command::Resume),
            4 => Ok(Command::Close),
            5 => Ok(Command::Dns),
            6 => Ok(Command::Open),
            7 => Ok(Command::OpenResult),
            8 => Ok(Command::Packets),
            9 => Ok(Command::FetchConfiguration),
            _ => Err(MessageError::UnknownCommand(value)),
        }
    }
}

/// Result codes carried by OpenResult messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenResultCode {
    Success = 0,
    InvalidParam = 1,
    NoSuchIdentifier = 2,
    InternalError = 3,
}

impl OpenResultCode {
    /// Resolve a result-code property value to a known code.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(OpenResultCode::Success),
            1 => Some(OpenResultCode::InvalidParam),
            2 => Some(OpenResultCode::NoSuchIdentifier),
            3 => Some(OpenResultCode::InternalError),
            _ => None,
        }
    }
}

/// Tagged property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Bytes),
}

impl Value {
    const TAG_INT: u8 = 0;
    const TAG_STR: u8 = 1;
    const TAG_BYTES: u8 = 2;

    fn tag(&self) -> u8 {
        match self {
            Value::Int(_) => Self::TAG_INT,
            Value::Str(_) => Self::TAG_STR,
            Value::Bytes(_) => Self::TAG_BYTES,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Int(_) => 8,
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

/// Insertion-ordered property table with unique keys.
///
/// Nested configuration mappings travel as a `Bytes` value holding a
/// table encoded with [`Properties::encode`], keeping the value union
/// closed while still carrying structured data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, Value)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing any existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Typed accessors return None on an absent key or a mismatched variant.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        match self.get(key) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encode as a standalone property table.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a standalone property table, rejecting trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Properties, MessageError> {
        let mut buf = bytes;
        let props = Self::decode_from(&mut buf)?;
        if !buf.is_empty() {
            return Err(MessageError::TrailingBytes(buf.len()));
        }
        Ok(props)
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        if self.entries.len() > u16::MAX as usize {
            return Err(MessageError::FieldOverflow("property count"));
        }
        buf.put_u16(self.entries.len() as u16);

        for (key, value) in &self.entries {
            if key.len() > u16::MAX as usize {
                return Err(MessageError::FieldOverflow("key length"));
            }
            let value_len = value.encoded_len();
            if value_len > u32::MAX as usize {
                return Err(MessageError::FieldOverflow("value length"));
            }

            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u8(value.tag());
            buf.put_u32(value_len as u32);
            match value {
                Value::Int(v) => buf.put_i64(*v),
                Value::Str(s) => buf.put_slice(s.as_bytes()),
                Value::Bytes(b) => buf.put_slice(b),
            }
        }

        Ok(())
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Properties, MessageError> {
        if buf.remaining() < 2 {
            return Err(MessageError::Truncated);
        }
        let count = buf.get_u16() as usize;

        let mut props = Properties::new();
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(MessageError::Truncated);
            }
            let key_len = buf.get_u16() as usize;
            if buf.remaining() < key_len {
                return Err(MessageError::Truncated);
            }
            let key = std::str::from_utf8(&buf[..key_len])
                .map_err(|_| MessageError::InvalidUtf8)?
                .to_string();
            buf.advance(key_len);

            if buf.remaining() < 5 {
                return Err(MessageError::Truncated);
            }
            let tag = buf.get_u8();
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                return Err(MessageError::Truncated);
            }

            let value = match tag {
                Value::TAG_INT => {
                    if value_len != 8 {
                        return Err(MessageError::InvalidValueLength {
                            tag,
                            len: value_len,
                        });
                    }
                    Value::Int(buf.get_i64())
                }
                Value::TAG_STR => {
                    let s = std::str::from_utf8(&buf[..value_len])
                        .map_err(|_| MessageError::InvalidUtf8)?
                        .to_string();
                    buf.advance(value_len);
                    Value::Str(s)
                }
                Value::TAG_BYTES => {
                    let b = Bytes::copy_from_slice(&buf[..value_len]);
                    buf.advance(value_len);
                    Value::Bytes(b)
                }
                other => return Err(MessageError::UnknownValueTag(other)),
            };

            if props.get(&key).is_some() {
                return Err(MessageError::DuplicateKey(key));
            }
            props.entries.push((key, value));
        }

        Ok(props)
    }
}

/// A decoded, typed protocol command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub connection_id: u32,
    pub properties: Properties,
}

impl Message {
    /// Fixed header: command (1) + connection id (4) = 5 bytes
    const HEADER_LEN: usize = 5;

    pub fn new(command: Command, connection_id: u32) -> Self {
        Self {
            command,
            connection_id,
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Control-channel request for the session configuration.
    pub fn fetch_configuration() -> Self {
        Self::new(Command::FetchConfiguration, crate::CONTROL_CONNECTION_ID)
    }

    /// Request to open a logical connection of the given tunnel type.
    pub fn open(connection_id: u32, tunnel_type: &str) -> Self {
        Self::new(Command::Open, connection_id).with_property(key::TUNNEL_TYPE, tunnel_type)
    }

    /// Report the outcome of an open request.
    pub fn open_result(connection_id: u32, code: OpenResultCode) -> Self {
        Self::new(Command::OpenResult, connection_id)
            .with_property(key::RESULT_CODE, code as u8 as i64)
    }

    /// Application payload for a logical connection.
    pub fn data(connection_id: u32, payload: Bytes) -> Self {
        Self::new(Command::Data, connection_id).with_property(key::PACKETS, payload)
    }

    /// Encode to frame payload bytes.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN);
        buf.put_u8(self.command as u8);
        buf.put_u32(self.connection_id);
        self.properties.encode_into(&mut buf)?;

        let framed = buf.len() + crate::LENGTH_PREFIX_LEN;
        if framed > crate::MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge(framed));
        }

        Ok(buf.freeze())
    }

    /// Decode from frame payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Message, MessageError> {
        let mut buf = payload;
        if buf.remaining() < Self::HEADER_LEN {
            return Err(MessageError::Truncated);
        }

        let command = Command::try_from(buf.get_u8())?;
        let connection_id = buf.get_u32();
        let properties = Properties::decode_from(&mut buf)?;

        if buf.has_remaining() {
            return Err(MessageError::TrailingBytes(buf.remaining()));
        }

        Ok(Message {
            command,
            connection_id,
            properties,
        })
    }
}
