//! The memcache text protocol: newline-terminated command lines, with
//! `set`/`add`/`replace` carrying a raw data block of a declared byte
//! length immediately after the command line.

use bytes::{Buf, BytesMut};
use kineta_base::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::find_crlf;

#[derive(Debug, Clone, PartialEq)]
pub enum MemcacheRequest {
    Get { keys: Vec<Vec<u8>> },
    Store { verb: StoreVerb, key: Vec<u8>, flags: u32, exptime: i64, payload: Vec<u8>, noreply: bool },
    Delete { key: Vec<u8>, noreply: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemcacheValue {
    pub key: Vec<u8>,
    pub flags: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemcacheReply {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Error,
    ClientError(String),
    ServerError(String),
    Values(Vec<MemcacheValue>),
}

#[derive(Debug, Clone)]
struct PendingStore {
    verb: StoreVerb,
    key: Vec<u8>,
    flags: u32,
    exptime: i64,
    bytes: usize,
    noreply: bool,
}

#[derive(Debug, Default)]
pub struct MemcacheCodec {
    pending: Option<PendingStore>,
}

impl MemcacheCodec {
    pub fn new() -> Self {
        MemcacheCodec::default()
    }
}

impl Decoder for MemcacheCodec {
    type Item = MemcacheRequest;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pending) = self.pending.take() {
            return self.decode_pending_payload(pending, src);
        }

        let Some(line_end) = find_crlf(src, 0) else {
            return Ok(None);
        };
        let line = src[..line_end].to_vec();
        src.advance(line_end + 2);

        match parse_command_line(&line)? {
            ParsedLine::Immediate(req) => Ok(Some(req)),
            ParsedLine::NeedsPayload(pending) => self.decode_pending_payload(pending, src),
        }
    }
}

impl MemcacheCodec {
    fn decode_pending_payload(&mut self, pending: PendingStore, src: &mut BytesMut) -> Result<Option<MemcacheRequest>, Error> {
        let need = pending.bytes + 2;
        if src.len() < need {
            // Remember the declared length so the next read resumes the
            // data block instead of re-parsing it as a command line.
            self.pending = Some(pending);
            return Ok(None);
        }
        let payload = src.split_to(pending.bytes).to_vec();
        if &src[..2] != b"\r\n" {
            return Err(Error::Protocol("data block missing CRLF terminator".to_string()));
        }
        src.advance(2);
        Ok(Some(MemcacheRequest::Store {
            verb: pending.verb,
            key: pending.key,
            flags: pending.flags,
            exptime: pending.exptime,
            payload,
            noreply: pending.noreply,
        }))
    }
}

enum ParsedLine {
    Immediate(MemcacheRequest),
    NeedsPayload(PendingStore),
}

fn parse_command_line(line: &[u8]) -> Result<ParsedLine, Error> {
    let text = std::str::from_utf8(line).map_err(|_| Error::Protocol("command line is not valid utf-8".to_string()))?;
    let mut parts = text.split_ascii_whitespace();
    let verb = parts.next().ok_or_else(|| Error::Protocol("empty command line".to_string()))?;

    match verb {
        "get" | "gets" => {
            let keys = parts.map(|k| k.as_bytes().to_vec()).collect::<Vec<_>>();
            if keys.is_empty() {
                return Err(Error::Protocol("get requires at least one key".to_string()));
            }
            Ok(ParsedLine::Immediate(MemcacheRequest::Get { keys }))
        }
        "set" | "add" | "replace" => {
            let verb = match verb {
                "set" => StoreVerb::Set,
                "add" => StoreVerb::Add,
                _ => StoreVerb::Replace,
            };
            let key = parts.next().ok_or_else(|| Error::Protocol("missing key".to_string()))?.as_bytes().to_vec();
            let flags: u32 = parts
                .next()
                .ok_or_else(|| Error::Protocol("missing flags".to_string()))?
                .parse()
                .map_err(|_| Error::Protocol("malformed flags".to_string()))?;
            let exptime: i64 = parts
                .next()
                .ok_or_else(|| Error::Protocol("missing exptime".to_string()))?
                .parse()
                .map_err(|_| Error::Protocol("malformed exptime".to_string()))?;
            let bytes: usize = parts
                .next()
                .ok_or_else(|| Error::Protocol("missing byte count".to_string()))?
                .parse()
                .map_err(|_| Error::Protocol("malformed byte count".to_string()))?;
            let noreply = parts.next() == Some("noreply");
            Ok(ParsedLine::NeedsPayload(PendingStore { verb, key, flags, exptime, bytes, noreply }))
        }
        "delete" => {
            let key = parts.next().ok_or_else(|| Error::Protocol("missing key".to_string()))?.as_bytes().to_vec();
            let noreply = parts.next() == Some("noreply");
            Ok(ParsedLine::Immediate(MemcacheRequest::Delete { key, noreply }))
        }
        other => Err(Error::Protocol(format!("unsupported command: {other}"))),
    }
}

impl Encoder<MemcacheReply> for MemcacheCodec {
    type Error = Error;

    fn encode(&mut self, item: MemcacheReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            MemcacheReply::Stored => dst.extend_from_slice(b"STORED\r\n"),
            MemcacheReply::NotStored => dst.extend_from_slice(b"NOT_STORED\r\n"),
            MemcacheReply::Deleted => dst.extend_from_slice(b"DELETED\r\n"),
            MemcacheReply::NotFound => dst.extend_from_slice(b"NOT_FOUND\r\n"),
            MemcacheReply::Error => dst.extend_from_slice(b"ERROR\r\n"),
            MemcacheReply::ClientError(msg) => {
                dst.extend_from_slice(b"CLIENT_ERROR ");
                dst.extend_from_slice(msg.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            MemcacheReply::ServerError(msg) => {
                dst.extend_from_slice(b"SERVER_ERROR ");
                dst.extend_from_slice(msg.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            MemcacheReply::Values(values) => {
                for v in values {
                    dst.extend_from_slice(b"VALUE ");
                    dst.extend_from_slice(&v.key);
                    dst.extend_from_slice(format!(" {} {}\r\n", v.flags, v.payload.len()).as_bytes());
                    dst.extend_from_slice(&v.payload);
                    dst.extend_from_slice(b"\r\n");
                }
                dst.extend_from_slice(b"END\r\n");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_get_with_multiple_keys() {
        let mut buf = BytesMut::from(&b"get a b c\r\n"[..]);
        let mut codec = MemcacheCodec::new();
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, MemcacheRequest::Get { keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] });
    }

    #[test]
    fn decodes_set_with_data_block_arriving_in_one_shot() {
        let mut buf = BytesMut::from(&b"set foo 0 0 3\r\nbar\r\n"[..]);
        let mut codec = MemcacheCodec::new();
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            MemcacheRequest::Store { verb: StoreVerb::Set, key: b"foo".to_vec(), flags: 0, exptime: 0, payload: b"bar".to_vec(), noreply: false }
        );
    }

    #[test]
    fn decode_waits_for_data_block_split_across_reads() {
        let mut buf = BytesMut::from(&b"set foo 0 0 3\r\n"[..]);
        let mut codec = MemcacheCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"bar\r\n");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            MemcacheRequest::Store { verb: StoreVerb::Set, key: b"foo".to_vec(), flags: 0, exptime: 0, payload: b"bar".to_vec(), noreply: false }
        );
    }

    #[test]
    fn noreply_flag_is_parsed() {
        let mut buf = BytesMut::from(&b"delete foo noreply\r\n"[..]);
        let mut codec = MemcacheCodec::new();
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, MemcacheRequest::Delete { key: b"foo".to_vec(), noreply: true });
    }

    #[test]
    fn encodes_values_followed_by_end() {
        let mut codec = MemcacheCodec::new();
        let mut out = BytesMut::new();
        codec
            .encode(MemcacheReply::Values(vec![MemcacheValue { key: b"foo".to_vec(), flags: 0, payload: b"bar".to_vec() }]), &mut out)
            .unwrap();
        assert_eq!(&out[..], &b"VALUE foo 0 3\r\nbar\r\nEND\r\n"[..]);
    }

    #[test]
    fn unsupported_verb_is_a_protocol_error() {
        let mut buf = BytesMut::from(&b"flush_all\r\n"[..]);
        let mut codec = MemcacheCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }
}
