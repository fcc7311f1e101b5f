// src/resp/codec.rs

//! The RESP2/RESP3 wire codec (component C1).
//!
//! Structured the way the teacher's `core::protocol::resp_frame` codec is:
//! a `tokio_util::codec::{Encoder, Decoder}` pair driving a `Framed` transport.
//! Unlike the teacher (which only ever *replies* with RESP), this codec also
//! encodes outbound command token-lists, since it sits on the client side of
//! the wire.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, Value};
use crate::error::Error;

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

/// Protocol-level limits mirroring the teacher's DoS guards.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;

/// A single outbound command: an ordered list of argument bytes, encoded as a
/// RESP array of bulk strings (`*<n>\r\n$<len>\r\n<bytes>\r\n...`).
#[derive(Debug, Clone)]
pub struct OutboundCommand(pub Vec<Bytes>);

/// The RESP codec. Tracks the negotiated protocol version so RESP3-only types
/// (maps, sets, doubles, booleans, big numbers, verbatim strings, attributes,
/// pushes) can be rejected cleanly on a RESP2 connection, exactly as the
/// teacher's encoder does for the server-to-client direction.
#[derive(Debug, Clone, Copy)]
pub struct RespCodec {
    pub protocol_version: u8,
}

impl RespCodec {
    pub fn new(protocol_version: u8) -> Self {
        Self { protocol_version }
    }
}

impl Encoder<OutboundCommand> for RespCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(b"*");
        dst.extend_from_slice(item.0.len().to_string().as_bytes());
        dst.extend_from_slice(CRLF);
        for arg in item.0 {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(arg.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(&arg);
            dst.extend_from_slice(CRLF);
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_message(src, self.protocol_version) {
            Ok(Some((msg, len))) => {
                src.advance(len);
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Returns `Ok(None)` when more bytes are needed. This is the single entry point
/// dispatching on the RESP type-prefix byte, with attribute frames folded onto
/// the message that follows them.
fn parse_message(src: &[u8], proto: u8) -> Result<Option<(Message, usize)>, Error> {
    if src.is_empty() {
        return Ok(None);
    }
    if src[0] == b'|' {
        let Some((attrs, attr_len)) = parse_kv_block(&src[1..], proto)? else {
            return Ok(None);
        };
        let Some((mut inner, inner_len)) = parse_message(&src[1 + attr_len..], proto)? else {
            return Ok(None);
        };
        inner = inner.with_attributes(attrs);
        return Ok(Some((inner, 1 + attr_len + inner_len)));
    }
    let Some((value, len)) = parse_value(src, proto)? else {
        return Ok(None);
    };
    Ok(Some((Message::new(value), len)))
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|w| w == CRLF)
}

fn parse_line(src: &[u8]) -> Result<Option<(&[u8], usize)>, Error> {
    Ok(find_crlf(src).map(|pos| (&src[..pos], pos + CRLF_LEN)))
}

fn require_protocol3(proto: u8, type_name: &str) -> Result<(), Error> {
    if proto < 3 {
        Err(Error::Protocol(format!("{type_name} is not representable in RESP2")))
    } else {
        Ok(())
    }
}

fn parse_value(src: &[u8], proto: u8) -> Result<Option<(Value, usize)>, Error> {
    if src.is_empty() {
        return Ok(None);
    }
    let tag = src[0];
    let body = &src[1..];
    match tag {
        b'+' => Ok(parse_line(body)?
            .map(|(line, len)| (Value::SimpleString(Bytes::copy_from_slice(line)), len + 1))),
        b'-' => Ok(parse_line(body)?
            .map(|(line, len)| (Value::SimpleError(Bytes::copy_from_slice(line)), len + 1))),
        b':' => {
            let Some((line, len)) = parse_line(body)? else { return Ok(None) };
            let i = parse_ascii::<i64>(line)?;
            Ok(Some((Value::Integer(i), len + 1)))
        }
        b'$' => parse_blob(body, MAX_BULK_STRING_SIZE).map(|opt| {
            opt.map(|res| match res {
                BlobResult::Value(b, len) => (Value::BlobString(b), len + 1),
                BlobResult::Null(len) => (Value::Null, len + 1),
            })
        }),
        b'*' => {
            require_not_streaming(body)?;
            parse_aggregate(body, proto)?
                .map(|(items, len)| match items {
                    None => Ok((Value::Null, len + 1)),
                    Some(items) => Ok((Value::Array(items), len + 1)),
                })
                .transpose()
        }
        b'%' => {
            require_protocol3(proto, "map")?;
            require_not_streaming(body)?;
            parse_map(body, proto)?
                .map(|(entries, len)| Ok((Value::Map(entries), len + 1)))
                .transpose()
        }
        b'~' => {
            require_protocol3(proto, "set")?;
            parse_aggregate(body, proto)?
                .map(|(items, len)| Ok((Value::Set(items.unwrap_or_default()), len + 1)))
                .transpose()
        }
        b'>' => {
            require_protocol3(proto, "push")?;
            parse_aggregate(body, proto)?
                .map(|(items, len)| Ok((Value::Push(items.unwrap_or_default()), len + 1)))
                .transpose()
        }
        b'#' => {
            require_protocol3(proto, "boolean")?;
            let Some((line, len)) = parse_line(body)? else { return Ok(None) };
            match line {
                b"t" => Ok(Some((Value::Bool(true), len + 1))),
                b"f" => Ok(Some((Value::Bool(false), len + 1))),
                _ => Err(Error::Protocol("invalid boolean frame".into())),
            }
        }
        b',' => {
            require_protocol3(proto, "double")?;
            let Some((line, len)) = parse_line(body)? else { return Ok(None) };
            let text = std::str::from_utf8(line).map_err(|_| Error::Protocol("invalid double".into()))?;
            let d = match text {
                "inf" | "+inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                other => other.parse::<f64>().map_err(|_| Error::Protocol("invalid double".into()))?,
            };
            Ok(Some((Value::Double(ordered_float::OrderedFloat(d)), len + 1)))
        }
        b'(' => {
            require_protocol3(proto, "big number")?;
            let Some((line, len)) = parse_line(body)? else { return Ok(None) };
            Ok(Some((Value::BigNumber(Bytes::copy_from_slice(line)), len + 1)))
        }
        b'!' => {
            require_protocol3(proto, "blob error")?;
            parse_blob(body, MAX_BULK_STRING_SIZE).map(|opt| {
                opt.map(|res| match res {
                    BlobResult::Value(b, len) => (Value::BlobError(b), len + 1),
                    BlobResult::Null(len) => (Value::Null, len + 1),
                })
            })
        }
        b'=' => {
            require_protocol3(proto, "verbatim string")?;
            let Some(res) = parse_blob(body, MAX_BULK_STRING_SIZE)? else { return Ok(None) };
            let (data, len) = match res {
                BlobResult::Value(b, len) => (b, len),
                BlobResult::Null(len) => return Ok(Some((Value::Null, len + 1))),
            };
            if data.len() < 4 || data[3] != b':' {
                return Err(Error::Protocol("malformed verbatim string".into()));
            }
            let mut format = [0u8; 3];
            format.copy_from_slice(&data[..3]);
            Ok(Some((Value::VerbatimString { format, data: data.slice(4..) }, len + 1)))
        }
        b'_' => {
            require_protocol3(proto, "null")?;
            let Some((_, len)) = parse_line(body)? else { return Ok(None) };
            Ok(Some((Value::Null, len + 1)))
        }
        other => Err(Error::Protocol(format!("unknown RESP type byte {other:#x}"))),
    }
}

fn require_not_streaming(body: &[u8]) -> Result<(), Error> {
    if body.first() == Some(&b'?') {
        return Err(Error::Protocol(
            "streaming (chunked) aggregate lengths are not supported".into(),
        ));
    }
    Ok(())
}

enum BlobResult {
    Value(Bytes, usize),
    Null(usize),
}

fn parse_blob(body: &[u8], max_len: usize) -> Result<Option<BlobResult>, Error> {
    if body.first() == Some(&b'?') {
        return Err(Error::Protocol("streaming blob strings are not supported".into()));
    }
    let Some((line, len_of_line)) = parse_line(body)? else { return Ok(None) };
    let n = parse_ascii::<i64>(line)?;
    if n == -1 {
        return Ok(Some(BlobResult::Null(len_of_line)));
    }
    if n < 0 {
        return Err(Error::Protocol("negative bulk length".into()));
    }
    let n = n as usize;
    if n > max_len {
        return Err(Error::OversizedFrame);
    }
    let total_prefix = len_of_line;
    if body.len() < total_prefix + n + CRLF_LEN {
        return Ok(None);
    }
    if &body[total_prefix + n..total_prefix + n + CRLF_LEN] != CRLF {
        return Err(Error::Protocol("missing trailing CRLF on bulk string".into()));
    }
    let data = Bytes::copy_from_slice(&body[total_prefix..total_prefix + n]);
    Ok(Some(BlobResult::Value(data, total_prefix + n + CRLF_LEN)))
}

/// Parses `*n\r\n` / `~n\r\n` / `>n\r\n` followed by `n` child messages.
/// Returns `(None, len)` for a null array (`*-1\r\n`).
fn parse_aggregate(body: &[u8], proto: u8) -> Result<Option<(Option<Vec<Message>>, usize)>, Error> {
    let Some((line, len_of_line)) = parse_line(body)? else { return Ok(None) };
    let n = parse_ascii::<i64>(line)?;
    if n == -1 {
        return Ok(Some((None, len_of_line)));
    }
    if n < 0 {
        return Err(Error::Protocol("negative aggregate length".into()));
    }
    let n = n as usize;
    if n > MAX_FRAME_ELEMENTS {
        return Err(Error::OversizedFrame);
    }
    let mut items = Vec::with_capacity(n.min(4096));
    let mut cursor = len_of_line;
    for _ in 0..n {
        let Some((msg, len)) = parse_message(&body[cursor..], proto)? else { return Ok(None) };
        items.push(msg);
        cursor += len;
    }
    Ok(Some((Some(items), cursor)))
}

fn parse_map(body: &[u8], proto: u8) -> Result<Option<(Vec<(Message, Message)>, usize)>, Error> {
    let Some((line, len_of_line)) = parse_line(body)? else { return Ok(None) };
    let n = parse_ascii::<i64>(line)?;
    if n < 0 {
        return Err(Error::Protocol("negative map length".into()));
    }
    let n = n as usize;
    if n > MAX_FRAME_ELEMENTS {
        return Err(Error::OversizedFrame);
    }
    let mut entries = Vec::with_capacity(n.min(4096));
    let mut cursor = len_of_line;
    for _ in 0..n {
        let Some((k, klen)) = parse_message(&body[cursor..], proto)? else { return Ok(None) };
        cursor += klen;
        let Some((v, vlen)) = parse_message(&body[cursor..], proto)? else { return Ok(None) };
        cursor += vlen;
        entries.push((k, v));
    }
    Ok(Some((entries, cursor)))
}

/// Parses the `n\r\n` + `n` key/value pairs shape shared by attribute frames.
fn parse_kv_block(body: &[u8], proto: u8) -> Result<Option<(Vec<(Message, Message)>, usize)>, Error> {
    parse_map(body, proto)
}

fn parse_ascii<T: std::str::FromStr>(line: &[u8]) -> Result<T, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| Error::Protocol("malformed integer in frame header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(proto: u8, bytes: &[u8]) -> Message {
        let mut codec = RespCodec::new(proto);
        let mut buf = BytesMut::from(bytes);
        codec.decode(&mut buf).unwrap().expect("complete frame")
    }

    #[test]
    fn decodes_simple_string() {
        let msg = decode_all(2, b"+OK\r\n");
        assert_eq!(msg.value, Value::SimpleString(Bytes::from_static(b"OK")));
    }

    #[test]
    fn decodes_bulk_string() {
        let msg = decode_all(2, b"$3\r\nval\r\n");
        assert_eq!(msg.into_bytes().unwrap(), Bytes::from_static(b"val"));
    }

    #[test]
    fn decodes_null_bulk_string() {
        let msg = decode_all(2, b"$-1\r\n");
        assert!(msg.is_nil());
    }

    #[test]
    fn decodes_array() {
        let msg = decode_all(2, b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        let arr = msg.into_array().unwrap();
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn decodes_resp3_map_and_double_and_bool() {
        let msg = decode_all(3, b"%1\r\n+k\r\n,1.5\r\n");
        let map = msg.into_map().unwrap();
        let v = map.get(&Bytes::from_static(b"k")).unwrap();
        assert_eq!(v.clone().into_f64().unwrap(), 1.5);

        let msg = decode_all(3, b"#t\r\n");
        assert!(msg.into_bool().unwrap());
    }

    #[test]
    fn rejects_resp3_types_on_resp2() {
        let mut codec = RespCodec::new(2);
        let mut buf = BytesMut::from(&b"#t\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn push_frame_round_trips_invalidation() {
        let msg = decode_all(3, b">2\r\n$10\r\ninvalidate\r\n*1\r\n$1\r\nk\r\n");
        assert!(msg.is_push());
        assert_eq!(msg.push_kind(), Some(&b"invalidate"[..]));
    }

    #[test]
    fn attribute_frame_attaches_to_following_message() {
        let msg = decode_all(3, b"|1\r\n+ttl\r\n:100\r\n$3\r\nfoo\r\n");
        assert!(msg.attributes.is_some());
        assert_eq!(msg.into_bytes().unwrap(), Bytes::from_static(b"foo"));
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut codec = RespCodec::new(2);
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn streaming_length_fails_cleanly() {
        let mut codec = RespCodec::new(3);
        let mut buf = BytesMut::from(&b"$?\r\n;4\r\ntest\r\n;0\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_command_as_array_of_bulk_strings() {
        let mut codec = RespCodec::new(2);
        let mut buf = BytesMut::new();
        codec
            .encode(
                OutboundCommand(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")]),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"[..]);
    }
}
