use crate::error::Error;
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HANDSHAKE_HEADERS: usize = 64;
// Limit the maximum amount of header data read to prevent a denial of
// service attack.
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Header map with case-insensitive keys. Repeated keys merge their values
/// with `", "` as HTTP prescribes for list-valued fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        let value = value.trim();
        self.entries
            .entry(key.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// True when the (comma-separated) header value contains `token`,
    /// compared case-insensitively. `Connection: keep-alive, Upgrade`
    /// contains `upgrade`.
    pub fn contains_token(&self, key: &str, token: &str) -> bool {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as `key: value` lines, each CRLF-terminated.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            let _ = write!(out, "{}: {}\r\n", key, self.entries[key]);
        }
        out
    }
}

/// A parsed HTTP request head (start line + headers, no body).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

/// A parsed HTTP response head.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Parse a request head out of `buf`. `Ok(None)` means more bytes are
/// needed; on success the returned offset is where the body begins.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HANDSHAKE_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);

    match parsed.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(offset) => {
            let mut headers = Headers::new();
            for header in parsed.headers.iter() {
                headers.insert(header.name, &String::from_utf8_lossy(header.value));
            }
            let request = Request {
                method: parsed.method.ok_or(Error::IncompleteHTTPRequest)?.to_string(),
                uri: parsed.path.ok_or(Error::IncompleteHTTPRequest)?.to_string(),
                version: parsed.version.ok_or(Error::IncompleteHTTPRequest)?,
                headers,
            };
            Ok(Some((request, offset)))
        }
    }
}

pub fn parse_response(buf: &[u8]) -> Result<Option<(Response, usize)>, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HANDSHAKE_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);

    match parsed.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(offset) => {
            let mut headers = Headers::new();
            for header in parsed.headers.iter() {
                headers.insert(header.name, &String::from_utf8_lossy(header.value));
            }
            let response = Response {
                version: parsed.version.ok_or(Error::IncompleteHTTPRequest)?,
                status: parsed.code.ok_or(Error::IncompleteHTTPRequest)?,
                reason: parsed.reason.unwrap_or_default().to_string(),
                headers,
            };
            Ok(Some((response, offset)))
        }
    }
}

/// Read from `stream` into `buf` until the blank line ending the header
/// block arrives. Returns the offset just past the terminator; bytes beyond
/// it (an early frame, or a Hixie Key3) stay in `buf`.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<usize, Error>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_terminator(buf) {
            return Ok(pos + HEADER_TERMINATOR.len());
        }
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Err(Error::IncompleteHTTPRequest);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
}

/// Ensure at least `n` bytes follow `offset` in `buf`, reading more if
/// required. Hixie-76 needs this for the 8-byte Key3 after the headers.
pub async fn read_body_bytes<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    offset: usize,
    n: usize,
) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < offset + n {
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
    Ok(buf[offset..offset + n].to_vec())
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Key", "abc");
        assert_eq!(headers.get("sec-websocket-key"), Some("abc"));
        assert_eq!(headers.get("SEC-WEBSOCKET-KEY"), Some("abc"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn repeated_keys_merge_with_comma() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Protocol", "chat");
        headers.insert("sec-websocket-protocol", "superchat");
        assert_eq!(headers.get("Sec-WebSocket-Protocol"), Some("chat, superchat"));
    }

    #[test]
    fn token_matching() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(!headers.contains_token("connection", "websocket"));
    }

    #[test]
    fn format_parse_round_trip_preserves_lookup() {
        let mut headers = Headers::new();
        headers.insert("Host", "example.com");
        headers.insert("Sec-WebSocket-Protocol", "a");
        headers.insert("Sec-WebSocket-Protocol", "b");

        let raw = format!("GET / HTTP/1.1\r\n{}\r\n", headers.format());
        let (request, _) = parse_request(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(request.headers.get("HOST"), Some("example.com"));
        assert_eq!(request.headers.get("sec-websocket-protocol"), Some("a, b"));
    }

    #[test]
    fn parses_upgrade_request() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com:9000\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        let (request, offset) = parse_request(raw).unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/chat");
        assert_eq!(request.version, 1);
        assert_eq!(offset, raw.len());
        assert!(request.headers.contains_token("upgrade", "websocket"));
    }

    #[test]
    fn partial_request_needs_more() {
        assert!(parse_request(b"GET /chat HTTP/1.1\r\nHost: e")
            .unwrap()
            .is_none());
    }

    #[test]
    fn parses_switching_protocols_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let (response, _) = parse_response(raw).unwrap().unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(response.reason, "Switching Protocols");
        assert_eq!(
            response.headers.get("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[tokio::test]
    async fn read_head_leaves_trailing_bytes() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nKEY3KEY3extra".to_vec();
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut client, &raw)
            .await
            .unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let offset = read_head(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf[..offset], b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let key3 = read_body_bytes(&mut server, &mut buf, offset, 8)
            .await
            .unwrap();
        assert_eq!(key3, b"KEY3KEY3");
    }
}
