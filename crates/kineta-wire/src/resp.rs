//! The RESP-family wire protocol: requests are always an array of bulk
//! strings; replies are one of the RESP2 base forms, or the richer RESP3
//! container kinds once a connection has upgraded via `HELLO 3`.

use bytes::{Buf, BytesMut};
use kineta_base::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::find_crlf;

/// A reply value. The RESP3-only variants (`Set`, `Map`, `Push`, `Double`,
/// `Null`) are always constructible; whether they render in their RESP3
/// form or flatten to a RESP2-compatible shape (maps into `2n`-element
/// arrays, doubles into bulk strings) is decided by [`RespCodec::resp3`]
/// at encode time.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
    Set(Vec<RespValue>),
    Map(Vec<(RespValue, RespValue)>),
    Push(Vec<RespValue>),
    Double(f64),
    Null,
}

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn bulk(bytes: impl Into<Vec<u8>>) -> RespValue {
        RespValue::Bulk(Some(bytes.into()))
    }

    /// Renders a [`kineta_base::CommandError`] as `-<KIND> <message>\r\n`,
    /// where `KIND` is the error kind's uppercase token.
    pub fn from_command_error(err: &kineta_base::CommandError) -> RespValue {
        RespValue::Error(format!("{} {}", err.kind.resp_token(), err.message))
    }
}

/// A client request is always a flat array of byte strings; inline
/// (non-multibulk) commands are not part of this protocol surface.
pub type RespRequest = Vec<Vec<u8>>;

/// Tokio codec for the RESP-family protocol. `resp3` is flipped by the
/// connection layer once a client sends `HELLO 3`.
#[derive(Debug, Default)]
pub struct RespCodec {
    pub resp3: bool,
}

impl RespCodec {
    pub fn new() -> Self {
        RespCodec { resp3: false }
    }
}

enum ParseOutcome {
    Incomplete,
    Invalid(String),
    Complete { consumed: usize, value: RespRequest },
}

fn parse_len(buf: &[u8]) -> Option<i64> {
    std::str::from_utf8(buf).ok()?.parse().ok()
}

fn parse_request(buf: &[u8]) -> ParseOutcome {
    if buf.is_empty() {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != b'*' {
        return ParseOutcome::Invalid(format!("expected '*' to start a request, got {:?}", buf[0] as char));
    }
    let Some(header_end) = find_crlf(buf, 1) else {
        return ParseOutcome::Incomplete;
    };
    let Some(count) = parse_len(&buf[1..header_end]) else {
        return ParseOutcome::Invalid("malformed array length".to_string());
    };
    if count < 0 {
        return ParseOutcome::Complete { consumed: header_end + 2, value: Vec::new() };
    }

    let mut pos = header_end + 2;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return ParseOutcome::Incomplete;
        }
        if buf[pos] != b'$' {
            return ParseOutcome::Invalid("expected '$' to start a bulk string".to_string());
        }
        let Some(len_end) = find_crlf(buf, pos + 1) else {
            return ParseOutcome::Incomplete;
        };
        let Some(len) = parse_len(&buf[pos + 1..len_end]) else {
            return ParseOutcome::Invalid("malformed bulk string length".to_string());
        };
        if len < 0 {
            return ParseOutcome::Invalid("null bulk string is not valid inside a request".to_string());
        }
        let data_start = len_end + 2;
        let data_end = data_start + len as usize;
        if buf.len() < data_end + 2 {
            return ParseOutcome::Incomplete;
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return ParseOutcome::Invalid("bulk string missing CRLF terminator".to_string());
        }
        items.push(buf[data_start..data_end].to_vec());
        pos = data_end + 2;
    }
    ParseOutcome::Complete { consumed: pos, value: items }
}

impl Decoder for RespCodec {
    type Item = RespRequest;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_request(src) {
            ParseOutcome::Incomplete => Ok(None),
            ParseOutcome::Invalid(msg) => Err(Error::Protocol(msg)),
            ParseOutcome::Complete { consumed, value } => {
                src.advance(consumed);
                Ok(Some(value))
            }
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_value(&item, self.resp3, dst);
        Ok(())
    }
}

fn write_value(value: &RespValue, resp3: bool, out: &mut BytesMut) {
    use std::fmt::Write as _;
    match value {
        RespValue::SimpleString(s) => {
            out.extend_from_slice(b"+");
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.extend_from_slice(b"-");
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            let mut line = String::new();
            let _ = write!(line, ":{n}\r\n");
            out.extend_from_slice(line.as_bytes());
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(bytes)) => {
            let mut header = String::new();
            let _ = write!(header, "${}\r\n", bytes.len());
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => write_container(b'*', items.len(), items.iter(), resp3, out),
        RespValue::Set(items) => {
            write_container(if resp3 { b'~' } else { b'*' }, items.len(), items.iter(), resp3, out)
        }
        RespValue::Push(items) => {
            write_container(if resp3 { b'>' } else { b'*' }, items.len(), items.iter(), resp3, out)
        }
        RespValue::Map(pairs) => {
            if resp3 {
                let mut header = String::new();
                let _ = write!(header, "%{}\r\n", pairs.len());
                out.extend_from_slice(header.as_bytes());
            } else {
                let mut header = String::new();
                let _ = write!(header, "*{}\r\n", pairs.len() * 2);
                out.extend_from_slice(header.as_bytes());
            }
            for (k, v) in pairs {
                write_value(k, resp3, out);
                write_value(v, resp3, out);
            }
        }
        RespValue::Double(d) => {
            let rendered = format_double(*d);
            if resp3 {
                out.extend_from_slice(b",");
                out.extend_from_slice(rendered.as_bytes());
                out.extend_from_slice(b"\r\n");
            } else {
                write_value(&RespValue::Bulk(Some(rendered.into_bytes())), resp3, out);
            }
        }
        RespValue::Null => {
            if resp3 {
                out.extend_from_slice(b"_\r\n");
            } else {
                out.extend_from_slice(b"$-1\r\n");
            }
        }
    }
}

fn write_container<'a>(
    tag: u8,
    len: usize,
    items: impl Iterator<Item = &'a RespValue>,
    resp3: bool,
    out: &mut BytesMut,
) {
    use std::fmt::Write as _;
    let mut header = String::new();
    let _ = write!(header, "{}{}\r\n", tag as char, len);
    out.extend_from_slice(header.as_bytes());
    for item in items {
        write_value(item, resp3, out);
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        if d > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{d}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_a_multibulk_request() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"[..]);
        let mut codec = RespCodec::new();
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, vec![b"GET".to_vec(), b"k".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_more_bytes_on_partial_frame() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r\n"[..]);
        let mut codec = RespCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        // Buffer is left untouched so the next read can append to it.
        assert_eq!(&buf[..], &b"*2\r\n$3\r\nGET\r\n$1\r\n"[..]);
    }

    #[test]
    fn decode_rejects_non_array_input() {
        let mut buf = BytesMut::from(&b"+OK\r\n"[..]);
        let mut codec = RespCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_handles_two_pipelined_requests_in_one_buffer() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        let mut codec = RespCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, vec![b"PING".to_vec()]);
        assert_eq!(second, vec![b"PING".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn resp2_flattens_maps_and_renders_doubles_as_bulk_strings() {
        let mut codec = RespCodec { resp3: false };
        let mut out = BytesMut::new();
        codec
            .encode(RespValue::Map(vec![(RespValue::bulk("a"), RespValue::Integer(1))]), &mut out)
            .unwrap();
        assert_eq!(&out[..], &b"*2\r\n$1\r\na\r\n:1\r\n"[..]);

        let mut out = BytesMut::new();
        codec.encode(RespValue::Double(1.5), &mut out).unwrap();
        assert_eq!(&out[..], &b"$3\r\n1.5\r\n"[..]);
    }

    #[test]
    fn resp3_emits_native_map_and_double_forms() {
        let mut codec = RespCodec { resp3: true };
        let mut out = BytesMut::new();
        codec
            .encode(RespValue::Map(vec![(RespValue::bulk("a"), RespValue::Integer(1))]), &mut out)
            .unwrap();
        assert_eq!(&out[..], &b"%1\r\n$1\r\na\r\n:1\r\n"[..]);

        let mut out = BytesMut::new();
        codec.encode(RespValue::Double(1.5), &mut out).unwrap();
        assert_eq!(&out[..], &b",1.5\r\n"[..]);

        let mut out = BytesMut::new();
        codec.encode(RespValue::Null, &mut out).unwrap();
        assert_eq!(&out[..], &b"_\r\n"[..]);
    }

    #[test]
    fn command_error_renders_with_uppercase_kind_token() {
        let err = kineta_base::CommandError::new(kineta_base::CommandErrorKind::WrongType, "Operation against a key holding the wrong kind of value");
        let value = RespValue::from_command_error(&err);
        assert_eq!(value, RespValue::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string()));
    }

    #[test]
    fn moved_error_renders_slot_and_host_port() {
        let err = kineta_base::CommandError::moved(kineta_base::SlotId(1234), "10.0.0.1:6379");
        let value = RespValue::from_command_error(&err);
        assert_eq!(value, RespValue::Error("MOVED 1234 10.0.0.1:6379".to_string()));
    }
}
