// src/cache/binary.rs

//! The compact binary format a [`super::store::CacheStore`] entry is
//! marshalled to/from when a caller asks for the raw cached bytes (spec §4.5:
//! "the cache format is a flat byte encoding, not a second RESP pass").
//!
//! Layout: a 7-byte big-endian PXAT (milliseconds since epoch, truncated to 56
//! bits — ample until the year 4147), a 1-byte type tag, then a type-specific
//! body. Aggregate bodies nest the same `tag + body` shape for each child
//! (without re-stating PXAT), so decoding is a single recursive descent.

use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::resp::{Message, Value};

const TAG_NULL: u8 = 0;
const TAG_SIMPLE_STRING: u8 = 1;
const TAG_BLOB_STRING: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_BOOL: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_SET: u8 = 7;
const TAG_MAP: u8 = 8;
const TAG_BIG_NUMBER: u8 = 9;
const TAG_VERBATIM: u8 = 10;
const TAG_SIMPLE_ERROR: u8 = 11;
const TAG_BLOB_ERROR: u8 = 12;
const TAG_PUSH: u8 = 13;

const PXAT_LEN: usize = 7;

/// Encodes `message` (including its PXAT) to the binary cache format.
pub fn marshal(message: &Message) -> Bytes {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&message.expire_at_ms.to_be_bytes()[1..8]);
    encode_value(&message.value, &mut out);
    Bytes::from(out)
}

/// Decodes a buffer produced by [`marshal`] back into a [`Message`]. Any
/// truncation or malformed length is reported as [`Error::CacheUnmarshal`]
/// rather than panicking, since these bytes may have been read back from an
/// external store.
pub fn unmarshal(buf: &[u8]) -> Result<Message, Error> {
    if buf.len() < PXAT_LEN + 1 {
        return Err(Error::CacheUnmarshal("buffer shorter than the fixed header".into()));
    }
    let mut pxat_bytes = [0u8; 8];
    pxat_bytes[1..8].copy_from_slice(&buf[..PXAT_LEN]);
    let expire_at_ms = u64::from_be_bytes(pxat_bytes);

    let mut cursor = &buf[PXAT_LEN..];
    let value = decode_value(&mut cursor)?;
    Ok(Message { value, attributes: None, cache_mark: true, expire_at_ms })
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::SimpleString(b) => encode_blob(TAG_SIMPLE_STRING, b, out),
        Value::BlobString(b) => encode_blob(TAG_BLOB_STRING, b, out),
        Value::BigNumber(b) => encode_blob(TAG_BIG_NUMBER, b, out),
        Value::SimpleError(b) => encode_blob(TAG_SIMPLE_ERROR, b, out),
        Value::BlobError(b) => encode_blob(TAG_BLOB_ERROR, b, out),
        Value::VerbatimString { format, data } => {
            out.push(TAG_VERBATIM);
            out.extend_from_slice(format);
            out.extend_from_slice(&(data.len() as u64).to_be_bytes());
            out.extend_from_slice(data);
        }
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Double(d) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&d.into_inner().to_be_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Array(items) => encode_aggregate(TAG_ARRAY, items, out),
        Value::Set(items) => encode_aggregate(TAG_SET, items, out),
        Value::Push(items) => encode_aggregate(TAG_PUSH, items, out),
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u64).to_be_bytes());
            for (k, v) in entries {
                encode_value(&k.value, out);
                encode_value(&v.value, out);
            }
        }
    }
}

fn encode_blob(tag: u8, data: &Bytes, out: &mut Vec<u8>) {
    out.push(tag);
    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(data);
}

fn encode_aggregate(tag: u8, items: &[Message], out: &mut Vec<u8>) {
    out.push(tag);
    out.extend_from_slice(&(items.len() as u64).to_be_bytes());
    for item in items {
        encode_value(&item.value, out);
    }
}

fn decode_value(cursor: &mut &[u8]) -> Result<Value, Error> {
    let tag = take_u8(cursor)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_SIMPLE_STRING => Ok(Value::SimpleString(take_blob(cursor)?)),
        TAG_BLOB_STRING => Ok(Value::BlobString(take_blob(cursor)?)),
        TAG_BIG_NUMBER => Ok(Value::BigNumber(take_blob(cursor)?)),
        TAG_SIMPLE_ERROR => Ok(Value::SimpleError(take_blob(cursor)?)),
        TAG_BLOB_ERROR => Ok(Value::BlobError(take_blob(cursor)?)),
        TAG_VERBATIM => {
            let mut format = [0u8; 3];
            if cursor.len() < 3 {
                return Err(Error::CacheUnmarshal("truncated verbatim-string format".into()));
            }
            format.copy_from_slice(&cursor[..3]);
            cursor.advance(3);
            let data = take_blob(cursor)?;
            Ok(Value::VerbatimString { format, data })
        }
        TAG_INTEGER => {
            if cursor.len() < 8 {
                return Err(Error::CacheUnmarshal("truncated integer".into()));
            }
            let i = i64::from_be_bytes(cursor[..8].try_into().unwrap());
            cursor.advance(8);
            Ok(Value::Integer(i))
        }
        TAG_DOUBLE => {
            if cursor.len() < 8 {
                return Err(Error::CacheUnmarshal("truncated double".into()));
            }
            let d = f64::from_be_bytes(cursor[..8].try_into().unwrap());
            cursor.advance(8);
            Ok(Value::Double(ordered_float::OrderedFloat(d)))
        }
        TAG_BOOL => Ok(Value::Bool(take_u8(cursor)? != 0)),
        TAG_ARRAY => Ok(Value::Array(take_aggregate(cursor)?)),
        TAG_SET => Ok(Value::Set(take_aggregate(cursor)?)),
        TAG_PUSH => Ok(Value::Push(take_aggregate(cursor)?)),
        TAG_MAP => {
            let count = take_u64(cursor)? as usize;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let k = Message::new(decode_value(cursor)?);
                let v = Message::new(decode_value(cursor)?);
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        other => Err(Error::CacheUnmarshal(format!("unknown type tag {other}"))),
    }
}

fn take_aggregate(cursor: &mut &[u8]) -> Result<Vec<Message>, Error> {
    let count = take_u64(cursor)? as usize;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        items.push(Message::new(decode_value(cursor)?));
    }
    Ok(items)
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, Error> {
    if cursor.is_empty() {
        return Err(Error::CacheUnmarshal("truncated type tag".into()));
    }
    let b = cursor[0];
    cursor.advance(1);
    Ok(b)
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64, Error> {
    if cursor.len() < 8 {
        return Err(Error::CacheUnmarshal("truncated length prefix".into()));
    }
    let n = u64::from_be_bytes(cursor[..8].try_into().unwrap());
    cursor.advance(8);
    Ok(n)
}

fn take_blob(cursor: &mut &[u8]) -> Result<Bytes, Error> {
    let len = take_u64(cursor)? as usize;
    if cursor.len() < len {
        return Err(Error::CacheUnmarshal("blob length exceeds remaining buffer".into()));
    }
    let data = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_blob_string_with_pxat() {
        let mut msg = Message::new(Value::BlobString(Bytes::from_static(b"hello")));
        msg.expire_at_ms = 1_893_456_000_000;
        let encoded = marshal(&msg);
        let decoded = unmarshal(&encoded).unwrap();
        assert_eq!(decoded.value, msg.value);
        assert_eq!(decoded.expire_at_ms, msg.expire_at_ms);
        assert!(decoded.cache_mark);
    }

    #[test]
    fn round_trips_nested_aggregates() {
        let msg = Message::new(Value::Array(vec![
            Message::new(Value::Integer(42)),
            Message::new(Value::BlobString(Bytes::from_static(b"x"))),
            Message::new(Value::Null),
        ]));
        let decoded = unmarshal(&marshal(&msg)).unwrap();
        assert_eq!(decoded.value, msg.value);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = unmarshal(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, Error::CacheUnmarshal(_)));
    }

    #[test]
    fn truncated_blob_length_is_rejected() {
        let msg = Message::new(Value::BlobString(Bytes::from_static(b"hello world")));
        let mut encoded = marshal(&msg).to_vec();
        encoded.truncate(encoded.len() - 3);
        let err = unmarshal(&encoded).unwrap_err();
        assert!(matches!(err, Error::CacheUnmarshal(_)));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut buf = vec![0u8; PXAT_LEN];
        buf.push(250);
        let err = unmarshal(&buf).unwrap_err();
        assert!(matches!(err, Error::CacheUnmarshal(_)));
    }
}
