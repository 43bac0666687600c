//! The two client-facing wire protocols: a RESP-family request/response
//! codec and the memcache text protocol, plus the HTTP probe used to route
//! a brand-new connection to one or the other (or to a separate HTTP admin
//! handler).

pub mod memcache;
pub mod resp;

pub use memcache::{MemcacheCodec, MemcacheReply, MemcacheRequest, MemcacheValue, StoreVerb};
pub use resp::{RespCodec, RespRequest, RespValue};

/// Finds the index of a `\r\n` starting at or after `from`, returning the
/// index of the `\r`. Shared by both codecs since both protocols delimit
/// lines and length-prefixed blocks with CRLF.
pub(crate) fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from > buf.len() {
        return None;
    }
    memchr::memchr(b'\n', &buf[from..]).and_then(|rel| {
        let idx = from + rel;
        if idx > from && buf[idx - 1] == b'\r' {
            Some(idx - 1)
        } else {
            None
        }
    })
}

/// `true` if `line` looks like an HTTP/1.1 GET request line. The
/// connection layer calls this on the first bytes of a new connection
/// before committing to either protocol parser.
pub fn looks_like_http_request_line(line: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(line) else {
        return false;
    };
    text.starts_with("GET ") && text.ends_with(" HTTP/1.1")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn http_probe_matches_get_request_lines() {
        assert!(looks_like_http_request_line(b"GET /metrics HTTP/1.1"));
        assert!(!looks_like_http_request_line(b"*2\r\n$3\r\nGET\r\n"));
        assert!(!looks_like_http_request_line(b"POST / HTTP/1.1"));
    }

    #[test]
    fn find_crlf_locates_terminator_and_ignores_bare_lf() {
        assert_eq!(find_crlf(b"abc\r\ndef", 0), Some(3));
        assert_eq!(find_crlf(b"abc\ndef", 0), None);
        assert_eq!(find_crlf(b"abc\r\ndef", 4), None);
    }
}
