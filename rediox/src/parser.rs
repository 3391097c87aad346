//! Incremental parsing of the reply stream.
//!
//! The decoder understands both the legacy and the extended reply encodings;
//! which one the server actually speaks is decided at handshake time and
//! does not change what the decoder accepts. Malformed frames are fatal to
//! the connection that produced them.

use std::str::from_utf8;

use bytes::{Buf, Bytes, BytesMut};
use num_bigint::BigInt;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, ErrorKind, RedioxResult};
use crate::types::{PushKind, ServerError, Value, VerbatimFormat};

fn protocol_error(detail: &str) -> Error {
    Error::from((
        ErrorKind::ProtocolError,
        "Invalid reply from the server",
        detail.to_string(),
    ))
}

/// Reads one CRLF-terminated line starting at `pos`. Returns the line without
/// the terminator and the position just past it, or `None` when the buffer
/// does not hold the full line yet.
fn read_line(input: &[u8], pos: usize) -> RedioxResult<Option<(&[u8], usize)>> {
    let hay = &input[pos.min(input.len())..];
    match hay.iter().position(|&b| b == b'\r') {
        Some(idx) => {
            if pos + idx + 1 >= input.len() {
                return Ok(None);
            }
            if input[pos + idx + 1] != b'\n' {
                return Err(protocol_error("expected CRLF line terminator"));
            }
            Ok(Some((&input[pos..pos + idx], pos + idx + 2)))
        }
        None => Ok(None),
    }
}

fn parse_line_int(line: &[u8]) -> RedioxResult<i64> {
    from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol_error("expected an integer length"))
}

fn parse_line_double(line: &[u8]) -> RedioxResult<f64> {
    match line {
        b"inf" => Ok(f64::INFINITY),
        b"-inf" => Ok(f64::NEG_INFINITY),
        b"nan" => Ok(f64::NAN),
        _ => from_utf8(line)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| protocol_error("expected a double")),
    }
}

fn split_error_line(line: &[u8]) -> RedioxResult<ServerError> {
    let text = from_utf8(line).map_err(|_| protocol_error("error line is not UTF-8"))?;
    let (code, detail) = text.split_once(' ').unwrap_or((text, ""));
    Ok(ServerError {
        code: code.to_string(),
        detail: detail.to_string(),
    })
}

fn parse_aggregate(
    input: &[u8],
    mut pos: usize,
    count: usize,
) -> RedioxResult<Option<(Vec<Value>, usize)>> {
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        match parse_at(input, pos)? {
            Some((value, next)) => {
                items.push(value);
                pos = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((items, pos)))
}

/// Parses one value starting at `pos`. `Ok(None)` means the buffer does not
/// hold a complete value yet.
fn parse_at(input: &[u8], pos: usize) -> RedioxResult<Option<(Value, usize)>> {
    if pos >= input.len() {
        return Ok(None);
    }
    let marker = input[pos];
    let Some((line, cursor)) = read_line(input, pos + 1)? else {
        return Ok(None);
    };
    match marker {
        b'+' => {
            let value = if line == b"OK" {
                Value::Okay
            } else {
                Value::SimpleString(
                    from_utf8(line)
                        .map_err(|_| protocol_error("status line is not UTF-8"))?
                        .to_string(),
                )
            };
            Ok(Some((value, cursor)))
        }
        b'-' => Ok(Some((Value::ServerError(split_error_line(line)?), cursor))),
        b':' => Ok(Some((Value::Int(parse_line_int(line)?), cursor))),
        b'$' | b'=' => {
            let len = parse_line_int(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, cursor)));
            }
            let len = len as usize;
            if input.len() < cursor + len + 2 {
                return Ok(None);
            }
            let payload = &input[cursor..cursor + len];
            if &input[cursor + len..cursor + len + 2] != b"\r\n" {
                return Err(protocol_error("bulk payload not CRLF terminated"));
            }
            let value = if marker == b'$' {
                Value::BulkString(payload.to_vec())
            } else {
                // verbatim strings lead with a three character format tag
                if len < 4 || payload[3] != b':' {
                    return Err(protocol_error("verbatim string without format tag"));
                }
                let format = match &payload[..3] {
                    b"txt" => VerbatimFormat::Text,
                    b"mkd" => VerbatimFormat::Markdown,
                    other => VerbatimFormat::Unknown(String::from_utf8_lossy(other).into_owned()),
                };
                Value::VerbatimString {
                    format,
                    text: from_utf8(&payload[4..])
                        .map_err(|_| protocol_error("verbatim string is not UTF-8"))?
                        .to_string(),
                }
            };
            Ok(Some((value, cursor + len + 2)))
        }
        b'!' => {
            let len = parse_line_int(line)?;
            if len < 0 {
                return Err(protocol_error("negative blob error length"));
            }
            let len = len as usize;
            if input.len() < cursor + len + 2 {
                return Ok(None);
            }
            let err = split_error_line(&input[cursor..cursor + len])?;
            Ok(Some((Value::ServerError(err), cursor + len + 2)))
        }
        b'*' => {
            let len = parse_line_int(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, cursor)));
            }
            Ok(parse_aggregate(input, cursor, len as usize)?
                .map(|(items, next)| (Value::Array(items), next)))
        }
        b'~' => {
            let len = parse_line_int(line)?;
            if len < 0 {
                return Err(protocol_error("negative set length"));
            }
            Ok(parse_aggregate(input, cursor, len as usize)?
                .map(|(items, next)| (Value::Set(items), next)))
        }
        b'%' => {
            let len = parse_line_int(line)?;
            if len < 0 {
                return Err(protocol_error("negative map length"));
            }
            Ok(
                parse_aggregate(input, cursor, len as usize * 2)?.map(|(items, next)| {
                    let mut pairs = Vec::with_capacity(len as usize);
                    let mut iter = items.into_iter();
                    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                        pairs.push((k, v));
                    }
                    (Value::Map(pairs), next)
                }),
            )
        }
        b'>' => {
            let len = parse_line_int(line)?;
            if len < 1 {
                return Err(protocol_error("push message without a kind"));
            }
            Ok(
                parse_aggregate(input, cursor, len as usize)?.map(|(mut items, next)| {
                    let kind = match items.remove(0) {
                        Value::BulkString(bytes) => {
                            PushKind::from_kind_str(&String::from_utf8_lossy(&bytes))
                        }
                        Value::SimpleString(s) => PushKind::from_kind_str(&s),
                        other => PushKind::Other(format!("{other:?}")),
                    };
                    (Value::Push { kind, data: items }, next)
                }),
            )
        }
        b'_' => Ok(Some((Value::Nil, cursor))),
        b'#' => match line {
            b"t" => Ok(Some((Value::Boolean(true), cursor))),
            b"f" => Ok(Some((Value::Boolean(false), cursor))),
            _ => Err(protocol_error("invalid boolean reply")),
        },
        b',' => Ok(Some((Value::Double(parse_line_double(line)?), cursor))),
        b'(' => match BigInt::parse_bytes(line, 10) {
            Some(n) => Ok(Some((Value::BigNumber(n), cursor))),
            None => Err(protocol_error("invalid big number reply")),
        },
        _ => Err(protocol_error("unknown reply type byte")),
    }
}

/// Parses a single complete value from `input`, failing on truncation.
pub fn parse_reply(input: &[u8]) -> RedioxResult<Value> {
    match parse_at(input, 0)? {
        Some((value, _)) => Ok(value),
        None => Err(protocol_error("truncated reply")),
    }
}

/// Serializes a [`Value`] back into its wire form. The counterpart of the
/// decoder, used by the scripted test server and by pipeline bookkeeping.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    let mut ibuf = itoa::Buffer::new();
    match value {
        Value::Nil => out.extend_from_slice(b"$-1\r\n"),
        Value::Okay => out.extend_from_slice(b"+OK\r\n"),
        Value::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::Int(n) => {
            out.push(b':');
            out.extend_from_slice(ibuf.format(*n).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::BulkString(bytes) => {
            out.push(b'$');
            out.extend_from_slice(ibuf.format(bytes.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        Value::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(ibuf.format(items.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Set(items) => {
            out.push(b'~');
            out.extend_from_slice(ibuf.format(items.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Map(pairs) => {
            out.push(b'%');
            out.extend_from_slice(ibuf.format(pairs.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            for (k, v) in pairs {
                encode_value(k, out);
                encode_value(v, out);
            }
        }
        Value::Double(d) => {
            out.push(b',');
            if d.is_nan() {
                out.extend_from_slice(b"nan");
            } else if d.is_infinite() {
                out.extend_from_slice(if *d > 0.0 { b"inf" } else { b"-inf" });
            } else {
                let mut fbuf = ryu::Buffer::new();
                out.extend_from_slice(fbuf.format(*d).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Value::Boolean(b) => {
            out.extend_from_slice(if *b { b"#t\r\n" } else { b"#f\r\n" });
        }
        Value::VerbatimString { format, text } => {
            let tag = match format {
                VerbatimFormat::Text => "txt",
                VerbatimFormat::Markdown => "mkd",
                VerbatimFormat::Unknown(tag) => tag.as_str(),
            };
            out.push(b'=');
            out.extend_from_slice(ibuf.format(text.len() + 4).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(tag.as_bytes());
            out.push(b':');
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::BigNumber(n) => {
            out.push(b'(');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::Push { kind, data } => {
            out.push(b'>');
            out.extend_from_slice(ibuf.format(data.len() + 1).as_bytes());
            out.extend_from_slice(b"\r\n");
            let kind = match kind {
                PushKind::Message => "message".to_string(),
                PushKind::PMessage => "pmessage".to_string(),
                PushKind::SMessage => "smessage".to_string(),
                PushKind::Subscribe => "subscribe".to_string(),
                PushKind::PSubscribe => "psubscribe".to_string(),
                PushKind::SSubscribe => "ssubscribe".to_string(),
                PushKind::Unsubscribe => "unsubscribe".to_string(),
                PushKind::PUnsubscribe => "punsubscribe".to_string(),
                PushKind::SUnsubscribe => "sunsubscribe".to_string(),
                PushKind::Other(s) => s.clone(),
            };
            encode_value(&Value::BulkString(kind.into_bytes()), out);
            for item in data {
                encode_value(item, out);
            }
        }
        Value::ServerError(err) => {
            out.push(b'-');
            out.extend_from_slice(err.code().as_bytes());
            if !err.detail().is_empty() {
                out.push(b' ');
                out.extend_from_slice(err.detail().as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Codec for the reply stream: decodes replies, writes pre-packed command
/// bytes through untouched.
#[derive(Default)]
pub struct ValueCodec;

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Error> {
        match parse_at(src, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for ValueCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut input: &[u8]) -> Vec<Value> {
        let mut out = vec![];
        while !input.is_empty() {
            let (value, consumed) = parse_at(input, 0).unwrap().unwrap();
            out.push(value);
            input = &input[consumed..];
        }
        out
    }

    #[test]
    fn parses_legacy_replies() {
        assert_eq!(parse_reply(b"+OK\r\n").unwrap(), Value::Okay);
        assert_eq!(
            parse_reply(b"+PONG\r\n").unwrap(),
            Value::SimpleString("PONG".into())
        );
        assert_eq!(parse_reply(b":1234\r\n").unwrap(), Value::Int(1234));
        assert_eq!(
            parse_reply(b"$5\r\nhello\r\n").unwrap(),
            Value::BulkString(b"hello".to_vec())
        );
        assert_eq!(parse_reply(b"$0\r\n\r\n").unwrap(), Value::BulkString(vec![]));
        assert_eq!(parse_reply(b"$-1\r\n").unwrap(), Value::Nil);
        assert_eq!(parse_reply(b"*-1\r\n").unwrap(), Value::Nil);
        assert_eq!(
            parse_reply(b"*2\r\n:1\r\n$3\r\nfoo\r\n").unwrap(),
            Value::Array(vec![Value::Int(1), Value::BulkString(b"foo".to_vec())])
        );
    }

    #[test]
    fn parses_error_replies_in_band() {
        match parse_reply(b"-MOVED 3999 127.0.0.1:6381\r\n").unwrap() {
            Value::ServerError(err) => {
                assert_eq!(err.code(), "MOVED");
                assert_eq!(err.detail(), "3999 127.0.0.1:6381");
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn parses_extended_replies() {
        assert_eq!(parse_reply(b"_\r\n").unwrap(), Value::Nil);
        assert_eq!(parse_reply(b"#t\r\n").unwrap(), Value::Boolean(true));
        assert_eq!(parse_reply(b",3.5\r\n").unwrap(), Value::Double(3.5));
        assert_eq!(
            parse_reply(b",-inf\r\n").unwrap(),
            Value::Double(f64::NEG_INFINITY)
        );
        assert_eq!(
            parse_reply(b"%1\r\n+key\r\n:1\r\n").unwrap(),
            Value::Map(vec![(Value::SimpleString("key".into()), Value::Int(1))])
        );
        assert_eq!(
            parse_reply(b"~2\r\n:1\r\n:2\r\n").unwrap(),
            Value::Set(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            parse_reply(b"=8\r\ntxt:abcd\r\n").unwrap(),
            Value::VerbatimString {
                format: VerbatimFormat::Text,
                text: "abcd".into()
            }
        );
        match parse_reply(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n").unwrap() {
            Value::Push { kind, data } => {
                assert_eq!(kind, PushKind::Message);
                assert_eq!(data.len(), 2);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn incomplete_input_asks_for_more() {
        assert!(parse_at(b"$5\r\nhel", 0).unwrap().is_none());
        assert!(parse_at(b"*2\r\n:1\r\n", 0).unwrap().is_none());
        assert!(parse_at(b"+OK", 0).unwrap().is_none());
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        assert!(parse_at(b"?boom\r\n", 0).is_err());
        assert!(parse_at(b"+OK\rxx", 0).is_err());
        assert!(parse_at(b"#x\r\n", 0).is_err());
    }

    #[test]
    fn multiple_replies_decode_in_sequence() {
        let values = decode_all(b"+OK\r\n:2\r\n$1\r\na\r\n");
        assert_eq!(
            values,
            vec![Value::Okay, Value::Int(2), Value::BulkString(b"a".to_vec())]
        );
    }

    #[test]
    fn encode_round_trips() {
        let original = Value::Array(vec![
            Value::Okay,
            Value::Nil,
            Value::Int(-3),
            Value::BulkString(b"bin\x00ary".to_vec()),
            Value::Map(vec![(Value::SimpleString("k".into()), Value::Boolean(false))]),
            Value::Double(1.25),
        ]);
        let mut wire = Vec::new();
        encode_value(&original, &mut wire);
        assert_eq!(parse_reply(&wire).unwrap(), original);
    }
}
