//! Frame codec (C1): encodes command argument vectors to RESP arrays of bulk
//! strings and decodes server frames into the [`Value`] tree.
//!
//! The decoder is streaming in the sense spec §4.1 requires: [`decode_value`]
//! consumes as much as it can from a byte slice and returns `Ok(None)` (decoded
//! as [`tokio_util::codec::Decoder::decode`]'s `Ok(None)`) when the buffer holds
//! an incomplete frame, rather than requiring the whole message to be
//! buffered up front. This matters for large aggregates (e.g. a multi-
//! thousand-element `Array`) arriving in several TCP segments.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cmd::Command;
use crate::error::RespError;
use crate::value::{PushKind, Value};

/// `tokio_util::codec` pair for a RESP2/RESP3 connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Encoder<Command> for RespCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_command(&item, dst);
        Ok(())
    }
}

/// Encodes one already-resolved command (e.g. `ASKING` prefixed onto a
/// redirected command, spec §4.7) straight into `dst` without allocating a
/// `Command`.
pub fn encode_raw(parts: &[&[u8]], dst: &mut BytesMut) {
    dst.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        dst.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        dst.extend_from_slice(part);
        dst.extend_from_slice(b"\r\n");
    }
}

pub fn encode_command(cmd: &Command, dst: &mut BytesMut) {
    dst.extend_from_slice(format!("*{}\r\n", cmd.args.len()).as_bytes());
    for arg in &cmd.args {
        dst.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        dst.extend_from_slice(arg);
        dst.extend_from_slice(b"\r\n");
    }
}

impl Decoder for RespCodec {
    type Item = Value;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, RespError> {
        match decode_value(&src[..])? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Find the offset of the next `\r\n` in `buf`, if a complete one is present.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse one line (up to but excluding `\r\n`) as UTF-8, returning the line
/// and the number of bytes consumed including the terminator.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = find_crlf(buf)?;
    Some((&buf[..pos], pos + 2))
}

fn parse_int_line(buf: &[u8]) -> Result<Option<(i64, usize)>, RespError> {
    match read_line(buf) {
        None => Ok(None),
        Some((line, consumed)) => {
            let s = std::str::from_utf8(line).map_err(|_| RespError::InvalidInteger)?;
            let n = s.parse::<i64>().map_err(|_| RespError::InvalidInteger)?;
            Ok(Some((n, consumed)))
        }
    }
}

/// Attempt to decode exactly one value from the front of `buf`. Returns
/// `Ok(None)` if `buf` holds an incomplete frame. Never panics on malformed
/// input; returns a [`RespError`] instead so the caller can tear the
/// connection down (spec §4.2: any decode error marks the connection
/// `Broken`).
pub fn decode_value(buf: &[u8]) -> Result<Option<(Value, usize)>, RespError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let prefix = buf[0];
    let rest = &buf[1..];
    match prefix {
        b'+' => match read_line(rest) {
            None => Ok(None),
            Some((line, consumed)) => {
                let s = String::from_utf8_lossy(line).into_owned();
                let value = if s == "OK" { Value::Ok } else { Value::SimpleString(s) };
                Ok(Some((value, 1 + consumed)))
            }
        },
        b'-' => match read_line(rest) {
            None => Ok(None),
            Some((line, consumed)) => {
                let text = String::from_utf8_lossy(line).into_owned();
                let mut parts = text.splitn(2, ' ');
                let kind = parts.next().unwrap_or_default().to_string();
                let message = parts.next().unwrap_or_default().to_string();
                Ok(Some((Value::Error { kind, message }, 1 + consumed)))
            }
        },
        b':' => match parse_int_line(rest)? {
            None => Ok(None),
            Some((n, consumed)) => Ok(Some((Value::Int(n), 1 + consumed))),
        },
        b'_' => match read_line(rest) {
            None => Ok(None),
            Some((_, consumed)) => Ok(Some((Value::Nil, 1 + consumed))),
        },
        b'#' => match read_line(rest) {
            None => Ok(None),
            Some((line, consumed)) => {
                let b = match line {
                    b"t" => true,
                    b"f" => false,
                    _ => return Err(RespError::InvalidInteger),
                };
                Ok(Some((Value::Bool(b), 1 + consumed)))
            }
        },
        b',' => match read_line(rest) {
            None => Ok(None),
            Some((line, consumed)) => {
                let s = std::str::from_utf8(line).map_err(|_| RespError::InvalidInteger)?;
                let d = s.parse::<f64>().map_err(|_| RespError::InvalidInteger)?;
                Ok(Some((Value::Double(d), 1 + consumed)))
            }
        },
        b'(' => match read_line(rest) {
            None => Ok(None),
            Some((line, consumed)) => Ok(Some((Value::BigNumber(line.to_vec()), 1 + consumed))),
        },
        b'$' => decode_bulk(rest).map(|opt| opt.map(|(v, n)| (v, 1 + n))),
        b'=' => decode_verbatim(rest).map(|opt| opt.map(|(v, n)| (v, 1 + n))),
        b'*' => decode_aggregate(rest, AggKind::Array)?
            .map(|(values, consumed)| (Value::Array(values), 1 + consumed))
            .map(Some)
            .map_or(Ok(None), |v| Ok(Some(v))),
        b'~' => decode_aggregate(rest, AggKind::Set)?
            .map(|(values, consumed)| (Value::Set(values), 1 + consumed))
            .map(Some)
            .map_or(Ok(None), |v| Ok(Some(v))),
        b'>' => decode_aggregate(rest, AggKind::Push)?
            .map(|(values, consumed)| (decode_push(values), 1 + consumed))
            .map(Some)
            .map_or(Ok(None), |v| Ok(Some(v))),
        b'%' => decode_map(rest)?
            .map(|(pairs, consumed)| (Value::Map(pairs), 1 + consumed))
            .map(Some)
            .map_or(Ok(None), |v| Ok(Some(v))),
        other => Err(RespError::InvalidPrefix(other)),
    }
}

fn decode_push(mut values: Vec<Value>) -> Value {
    let kind = if values.is_empty() {
        PushKind::Other
    } else {
        match &values[0] {
            Value::Bulk(b) => PushKind::from_str(&String::from_utf8_lossy(b)),
            Value::SimpleString(s) => PushKind::from_str(s),
            _ => PushKind::Other,
        }
    };
    if !values.is_empty() {
        values.remove(0);
    }
    Value::Push { kind, data: values }
}

fn decode_bulk(buf: &[u8]) -> Result<Option<(Value, usize)>, RespError> {
    let (len, header_len) = match parse_int_line(buf)? {
        None => return Ok(None),
        Some(pair) => pair,
    };
    if len < 0 {
        return Ok(Some((Value::Nil, header_len)));
    }
    let len = len as usize;
    let body_start = header_len;
    let body_end = body_start + len;
    let total = body_end + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[body_end..total] != b"\r\n" {
        return Err(RespError::UnterminatedFrame);
    }
    Ok(Some((Value::Bulk(buf[body_start..body_end].to_vec()), total)))
}

fn decode_verbatim(buf: &[u8]) -> Result<Option<(Value, usize)>, RespError> {
    match decode_bulk(buf)? {
        None => Ok(None),
        Some((Value::Bulk(bytes), consumed)) => {
            if bytes.len() < 4 || bytes[3] != b':' {
                return Err(RespError::UnterminatedFrame);
            }
            let format = String::from_utf8_lossy(&bytes[..3]).into_owned();
            let text = String::from_utf8_lossy(&bytes[4..]).into_owned();
            Ok(Some((Value::VerbatimString { format, text }, consumed)))
        }
        Some((Value::Nil, consumed)) => Ok(Some((
            Value::VerbatimString {
                format: String::new(),
                text: String::new(),
            },
            consumed,
        ))),
        _ => unreachable!("decode_bulk only returns Bulk or Nil"),
    }
}

enum AggKind {
    Array,
    Set,
    Push,
}

fn decode_aggregate(buf: &[u8], _kind: AggKind) -> Result<Option<(Vec<Value>, usize)>, RespError> {
    let (len, header_len) = match parse_int_line(buf)? {
        None => return Ok(None),
        Some(pair) => pair,
    };
    if len < 0 {
        return Ok(Some((Vec::new(), header_len)));
    }
    let len = len as usize;
    let mut offset = header_len;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        match decode_value(&buf[offset..])? {
            None => return Ok(None),
            Some((value, consumed)) => {
                values.push(value);
                offset += consumed;
            }
        }
    }
    Ok(Some((values, offset)))
}

fn decode_map(buf: &[u8]) -> Result<Option<(Vec<(Value, Value)>, usize)>, RespError> {
    let (len, header_len) = match parse_int_line(buf)? {
        None => return Ok(None),
        Some(pair) => pair,
    };
    if len < 0 {
        return Ok(Some((Vec::new(), header_len)));
    }
    let len = len as usize;
    let mut offset = header_len;
    let mut pairs = Vec::with_capacity(len);
    for _ in 0..len {
        let (key, key_consumed) = match decode_value(&buf[offset..])? {
            None => return Ok(None),
            Some(pair) => pair,
        };
        offset += key_consumed;
        let (val, val_consumed) = match decode_value(&buf[offset..])? {
            None => return Ok(None),
            Some(pair) => pair,
        };
        offset += val_consumed;
        pairs.push((key, val));
    }
    Ok(Some((pairs, offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_string() {
        let (v, n) = decode_value(b"+PONG\r\n").unwrap().unwrap();
        assert_eq!(v, Value::SimpleString("PONG".into()));
        assert_eq!(n, 7);
    }

    #[test]
    fn decodes_ok() {
        let (v, _) = decode_value(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(v, Value::Ok);
    }

    #[test]
    fn decodes_error_with_kind() {
        let (v, _) = decode_value(b"-MOVED 12182 127.0.0.1:6380\r\n")
            .unwrap()
            .unwrap();
        match v {
            Value::Error { kind, message } => {
                assert_eq!(kind, "MOVED");
                assert_eq!(message, "12182 127.0.0.1:6380");
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn decodes_bulk_and_nil() {
        let (v, n) = decode_value(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(v, Value::Bulk(b"hello".to_vec()));
        assert_eq!(n, 11);

        let (v, _) = decode_value(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(v, Value::Nil);
    }

    #[test]
    fn needs_more_on_partial_bulk() {
        assert!(decode_value(b"$5\r\nhel").unwrap().is_none());
        assert!(decode_value(b"$5\r\n").unwrap().is_none());
        assert!(decode_value(b"*2\r\n$1\r\na\r\n").unwrap().is_none());
    }

    #[test]
    fn decodes_nested_array() {
        let input = b"*2\r\n$3\r\nfoo\r\n*1\r\n:1\r\n";
        let (v, n) = decode_value(input).unwrap().unwrap();
        assert_eq!(n, input.len());
        match v {
            Value::Array(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0], Value::Bulk(b"foo".to_vec()));
                assert_eq!(items[1], Value::Array(vec![Value::Int(1)]));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn decodes_resp3_types() {
        assert_eq!(decode_value(b"#t\r\n").unwrap().unwrap().0, Value::Bool(true));
        assert_eq!(
            decode_value(b",3.14\r\n").unwrap().unwrap().0,
            Value::Double(3.14)
        );
        assert_eq!(decode_value(b"_\r\n").unwrap().unwrap().0, Value::Nil);

        let (v, _) = decode_value(b"%1\r\n$1\r\na\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(v, Value::Map(vec![(Value::Bulk(b"a".to_vec()), Value::Int(1))]));
    }

    #[test]
    fn decodes_push_frame() {
        let input = b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n";
        let (v, _) = decode_value(input).unwrap().unwrap();
        match v {
            Value::Push { kind, data } => {
                assert_eq!(kind, PushKind::Message);
                assert_eq!(data, vec![Value::Bulk(b"ch".to_vec()), Value::Bulk(b"hello".to_vec())]);
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn rejects_invalid_prefix() {
        assert!(matches!(
            decode_value(b"!oops\r\n"),
            Err(RespError::InvalidPrefix(b'!'))
        ));
    }

    #[test]
    fn encodes_command_as_bulk_array() {
        let cmd = Command::new(crate::cmd::CommandKind::SingleKey)
            .arg("GET")
            .arg("foo");
        let mut buf = BytesMut::new();
        encode_command(&cmd, &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    }
}
