// src/resp/message.rs

//! The decoded RESP value the wire hands back to callers: [`Message`].
//!
//! A `Message` is a thin wrapper around [`Value`] (the tagged union of the RESP2/
//! RESP3 shapes) plus the three pieces of side-channel state spec §3 calls out:
//! an optional RESP3 attribute map, a client-side-cache mark, and a packed
//! expire-at so a cached reply can carry its TTL without a second allocation.

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{Error, ServerError};

/// The RESP2/RESP3 tagged union. Children of aggregate types are contiguous
/// `Vec`s, matching the "arena" mental model of spec §3 closely enough that the
/// binary cache format (see [`crate::cache::binary`]) can walk them structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SimpleString(Bytes),
    BlobString(Bytes),
    VerbatimString { format: [u8; 3], data: Bytes },
    BigNumber(Bytes),
    SimpleError(Bytes),
    BlobError(Bytes),
    Integer(i64),
    Double(ordered_float::OrderedFloat<f64>),
    Bool(bool),
    Null,
    Array(Vec<Message>),
    Set(Vec<Message>),
    Map(Vec<(Message, Message)>),
    Push(Vec<Message>),
}

/// A fully decoded RESP reply, with its RESP3 attribute (if any) and client-side
/// cache bookkeeping attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub value: Value,
    /// RESP3 `|...` attribute frame that preceded this message, if the server sent one.
    pub attributes: Option<Box<Vec<(Message, Message)>>>,
    /// Set once this message has been admitted into the client-side cache.
    pub cache_mark: bool,
    /// Milliseconds-since-epoch at which a cached copy of this message expires.
    /// `0` means "the server did not cap the TTL" (see spec §4.5 `update`).
    pub expire_at_ms: u64,
}

impl Message {
    pub fn new(value: Value) -> Self {
        Message { value, attributes: None, cache_mark: false, expire_at_ms: 0 }
    }

    pub fn with_attributes(mut self, attrs: Vec<(Message, Message)>) -> Self {
        self.attributes = if attrs.is_empty() { None } else { Some(Box::new(attrs)) };
        self
    }

    pub fn nil() -> Self {
        Message::new(Value::Null)
    }

    pub fn ok() -> Self {
        Message::new(Value::SimpleString(Bytes::from_static(b"OK")))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    /// Whether this reply was served from the client-side cache rather than
    /// fetched from the server just now (spec §4.5's `DoCache` result shape).
    pub fn is_cache_hit(&self) -> bool {
        self.cache_mark
    }

    /// Milliseconds-since-epoch at which a cached reply expires, or `0` if
    /// this reply was never admitted into the cache.
    pub fn cache_pxat(&self) -> u64 {
        self.expire_at_ms
    }

    /// Milliseconds remaining until a cached reply expires, or `0` if it
    /// already has (or was never cached).
    pub fn cache_pttl(&self) -> u64 {
        if self.expire_at_ms == 0 {
            return 0;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.expire_at_ms.saturating_sub(now)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.value, Value::SimpleError(_) | Value::BlobError(_))
    }

    /// If this message is a RESP error reply, returns the classified [`ServerError`].
    pub fn as_server_error(&self) -> Option<ServerError> {
        match &self.value {
            Value::SimpleError(b) | Value::BlobError(b) => {
                Some(ServerError::classify(String::from_utf8_lossy(b).to_string()))
            }
            _ => None,
        }
    }

    /// Converts an error-shaped message into `Err`, otherwise passes it through.
    pub fn into_result(self) -> Result<Message, Error> {
        if let Some(server_err) = self.as_server_error() {
            return Err(Error::Server(server_err));
        }
        Ok(self)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.value {
            Value::SimpleString(b) | Value::BlobString(b) | Value::BigNumber(b) => Some(b),
            Value::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Result<Bytes, Error> {
        match self.value {
            Value::SimpleString(b) | Value::BlobString(b) | Value::BigNumber(b) => Ok(b),
            Value::VerbatimString { data, .. } => Ok(data),
            Value::Null => Err(Error::Nil),
            other => Err(Error::Parse(format!("expected a string reply, found {other:?}"))),
        }
    }

    pub fn into_string(self) -> Result<String, Error> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Parse(e.to_string()))
    }

    pub fn into_i64(self) -> Result<i64, Error> {
        match self.value {
            Value::Integer(i) => Ok(i),
            Value::SimpleString(b) | Value::BlobString(b) => String::from_utf8_lossy(&b)
                .parse::<i64>()
                .map_err(|e| Error::Parse(e.to_string())),
            Value::Null => Err(Error::Nil),
            other => Err(Error::Parse(format!("expected an integer reply, found {other:?}"))),
        }
    }

    pub fn into_f64(self) -> Result<f64, Error> {
        match self.value {
            Value::Double(d) => Ok(d.into_inner()),
            Value::Integer(i) => Ok(i as f64),
            Value::SimpleString(b) | Value::BlobString(b) => String::from_utf8_lossy(&b)
                .parse::<f64>()
                .map_err(|e| Error::Parse(e.to_string())),
            Value::Null => Err(Error::Nil),
            other => Err(Error::Parse(format!("expected a double reply, found {other:?}"))),
        }
    }

    pub fn into_bool(self) -> Result<bool, Error> {
        match self.value {
            Value::Bool(b) => Ok(b),
            Value::Integer(i) => Ok(i != 0),
            other => Err(Error::Parse(format!("expected a boolean reply, found {other:?}"))),
        }
    }

    pub fn into_array(self) -> Result<Vec<Message>, Error> {
        match self.value {
            Value::Array(a) | Value::Set(a) | Value::Push(a) => Ok(a),
            Value::Null => Err(Error::Nil),
            other => Err(Error::Parse(format!("expected an array reply, found {other:?}"))),
        }
    }

    pub fn into_map(self) -> Result<HashMap<Bytes, Message>, Error> {
        match self.value {
            Value::Map(entries) => {
                let mut out = HashMap::with_capacity(entries.len());
                for (k, v) in entries {
                    out.insert(k.into_bytes()?, v);
                }
                Ok(out)
            }
            Value::Array(items) => {
                let mut out = HashMap::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    out.insert(k.into_bytes()?, v);
                }
                Ok(out)
            }
            other => Err(Error::Parse(format!("expected a map reply, found {other:?}"))),
        }
    }

    /// Whether this message is a RESP3 push frame (`>`), which the wire must
    /// dispatch to invalidation/pubsub handling rather than matching to a slot.
    pub fn is_push(&self) -> bool {
        matches!(self.value, Value::Push(_))
    }

    /// The push "kind" token (`invalidate`, `message`, `subscribe`, ...), if this
    /// is a push frame whose first element is a simple/blob string.
    pub fn push_kind(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Push(items) => items.first().and_then(|m| m.as_bytes()).map(|b| b.as_ref()),
            _ => None,
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::new(value)
    }
}
