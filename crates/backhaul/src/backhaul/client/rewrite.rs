use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

/// A stateful transform applied to each chunk read off a stream.
pub trait ByteTransform: Send {
    fn transform(&mut self, chunk: Bytes) -> Bytes;
}

fn host_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)(\r\n[Hh]ost: )\S+").expect("static regex"))
}

/// Rewrites the value of the first `Host:` header seen on a stream.
///
/// Matching happens per chunk: a header split across two reads is not recognized.
/// Once a rewrite happened every later chunk passes through untouched, including
/// further `Host:` lines of pipelined requests.
#[derive(Debug, Clone)]
pub struct HostHeaderRewriter {
    host: String,
    replaced: bool,
}

impl HostHeaderRewriter {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            host: if host.trim().is_empty() {
                "localhost".to_string()
            } else {
                host
            },
            replaced: false,
        }
    }

    pub fn replaced(&self) -> bool {
        self.replaced
    }
}

impl ByteTransform for HostHeaderRewriter {
    fn transform(&mut self, chunk: Bytes) -> Bytes {
        if self.replaced {
            return chunk;
        }
        let Some(caps) = host_header_re().captures(&chunk) else {
            return chunk;
        };
        let (Some(whole), Some(prefix)) = (caps.get(0), caps.get(1)) else {
            return chunk;
        };

        let mut out = BytesMut::with_capacity(chunk.len() + self.host.len());
        out.extend_from_slice(&chunk[..prefix.end()]);
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&chunk[whole.end()..]);
        self.replaced = true;
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(rw: &mut HostHeaderRewriter, chunk: &str) -> String {
        let out = rw.transform(Bytes::copy_from_slice(chunk.as_bytes()));
        String::from_utf8(out.to_vec()).expect("utf8")
    }

    #[test]
    fn rewrites_first_host_only() {
        let mut rw = HostHeaderRewriter::new("127.0.0.1");
        let out = run(
            &mut rw,
            "GET / HTTP/1.1\r\nHost: foo.example.com\r\nX: y\r\n\r\nGET /b HTTP/1.1\r\nHost: bar.example.com\r\n\r\n",
        );
        assert_eq!(
            out,
            "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nX: y\r\n\r\nGET /b HTTP/1.1\r\nHost: bar.example.com\r\n\r\n"
        );
        assert!(rw.replaced());
    }

    #[test]
    fn later_chunks_untouched_after_rewrite() {
        let mut rw = HostHeaderRewriter::new("local");
        assert_eq!(
            run(&mut rw, "GET / HTTP/1.1\r\nhost: a.example\r\n\r\n"),
            "GET / HTTP/1.1\r\nhost: local\r\n\r\n"
        );
        assert_eq!(
            run(&mut rw, "GET / HTTP/1.1\r\nHost: b.example\r\n\r\n"),
            "GET / HTTP/1.1\r\nHost: b.example\r\n\r\n"
        );
    }

    #[test]
    fn header_split_across_chunks_is_not_matched() {
        let mut rw = HostHeaderRewriter::new("local");
        assert_eq!(run(&mut rw, "GET / HTTP/1.1\r\nHo"), "GET / HTTP/1.1\r\nHo");
        assert_eq!(run(&mut rw, "st: a.example\r\n\r\n"), "st: a.example\r\n\r\n");
        assert!(!rw.replaced());

        // The next complete header in a single chunk still gets the one rewrite.
        assert_eq!(
            run(&mut rw, "GET /x HTTP/1.1\r\nHost: b.example\r\n\r\n"),
            "GET /x HTTP/1.1\r\nHost: local\r\n\r\n"
        );
    }

    #[test]
    fn non_utf8_bytes_survive() {
        let mut rw = HostHeaderRewriter::new("local");
        let mut input = b"POST / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec();
        input.extend_from_slice(&[0xff, 0x00, 0xfe]);
        let out = rw.transform(Bytes::from(input));
        let mut want = b"POST / HTTP/1.1\r\nHost: local\r\n\r\n".to_vec();
        want.extend_from_slice(&[0xff, 0x00, 0xfe]);
        assert_eq!(out.as_ref(), want.as_slice());
    }

    #[test]
    fn empty_host_defaults_to_localhost() {
        let mut rw = HostHeaderRewriter::new("");
        assert_eq!(
            run(&mut rw, "GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n"
        );
    }
}
