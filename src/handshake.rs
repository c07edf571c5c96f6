use crate::config::{ClientConfig, Settings};
use crate::connection::Connection;
use crate::error::Error;
use crate::handler::Handler;
use crate::hixie;
use crate::http::{self, Headers, Request};
use crate::uri::WsUri;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::{Buf, BytesMut};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub(crate) const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SUPPORTED_VERSIONS: &str = "13, 8, 7";

/// Wire protocol variants this endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Hixie76,
    Hybi07,
    Hybi08,
    Hybi13,
}

impl Version {
    pub fn is_hybi(&self) -> bool {
        !matches!(self, Version::Hixie76)
    }

    /// Which request header carries the origin for this version.
    fn origin_header(&self) -> &'static str {
        match self {
            Version::Hybi07 | Version::Hybi08 => "sec-websocket-origin",
            _ => "origin",
        }
    }
}

/// Everything negotiated during the opening handshake.
#[derive(Debug, Clone)]
pub struct SessionDetails {
    pub version: Version,
    pub uri: WsUri,
    pub origin: Option<String>,
    pub offered_subprotocols: Vec<String>,
    pub subprotocol: Option<String>,
    /// Extension names the peer offered. Enumerated only; nothing is ever
    /// negotiated back.
    pub extensions: Vec<String>,
    pub request_headers: Headers,
}

/// Compute `Sec-WebSocket-Accept` for a request key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// 16 random bytes, Base64-encoded: the client handshake nonce.
pub fn generate_key() -> String {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let nonce: [u8; 16] = rng.random();
    BASE64_STANDARD.encode(nonce)
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Outcome of serving an inbound HTTP request.
pub(crate) enum ServerHandshake {
    /// Upgrade accepted; the connection is now a WebSocket.
    WebSocket(SessionDetails),
    /// Plain HTTP request, answered via the handler's `http` hook.
    Http,
}

/// Run the server side of the opening handshake. On success the 101
/// response has been written and `buf` has been advanced past the request,
/// leaving any early frame bytes for the frame processor.
pub(crate) async fn server_handshake<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    settings: &Settings,
    secure: bool,
    handler: &dyn Handler,
    conn: &Connection,
) -> Result<ServerHandshake, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head_end = http::read_head(stream, buf).await?;
    let (request, parsed_len) = http::parse_request(&buf[..head_end])?
        .ok_or(Error::IncompleteHTTPRequest)?;
    debug_assert_eq!(parsed_len, head_end);

    // Anything that isn't an upgrade attempt falls through to plain HTTP.
    // A malformed upgrade attempt (wrong method, missing keys) is NOT plain
    // HTTP; it fails below with a 400.
    if !request.headers.contains_token("upgrade", "websocket") {
        let response = handler.http(conn, &request);
        stream.write_all(&response.format()).await?;
        stream.flush().await?;
        buf.advance(head_end);
        return Ok(ServerHandshake::Http);
    }

    match negotiate_upgrade(stream, buf, head_end, &request, settings, secure, handler, conn).await
    {
        Ok(details) => Ok(ServerHandshake::WebSocket(details)),
        Err(err) => {
            // Failures before the 101 get an HTTP error response where one
            // hasn't been written yet.
            let (status, extra) = match &err {
                Error::HandshakeRejected(status) => (*status, None),
                Error::UnsupportedVersion(_) => {
                    (400, Some(("Sec-WebSocket-Version", SUPPORTED_VERSIONS)))
                }
                _ => (400, None),
            };
            write_error_response(stream, settings, status, extra).await?;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn negotiate_upgrade<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    head_end: usize,
    request: &Request,
    settings: &Settings,
    secure: bool,
    handler: &dyn Handler,
    conn: &Connection,
) -> Result<SessionDetails, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if request.method != "GET" {
        return Err(Error::InvalidHTTPHandshake);
    }
    if request.version < 1 {
        return Err(Error::InvalidHTTPHandshake);
    }
    if !request.headers.contains_token("connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    let host = request
        .headers
        .get("host")
        .ok_or(Error::NoHostHeaderPresent)?
        .to_string();

    let version = match request.headers.get("sec-websocket-version") {
        None => Version::Hixie76,
        Some("7") => Version::Hybi07,
        Some("8") => Version::Hybi08,
        Some("13") => Version::Hybi13,
        Some(other) => return Err(Error::UnsupportedVersion(other.to_string())),
    };

    // Version-specific key material is validated up front: the handler
    // hooks below must never observe a request that still fails the
    // structural checks.
    enum KeyMaterial {
        Hixie([u8; 16]),
        Hybi(String),
    }
    let key_material = match version {
        Version::Hixie76 => {
            let key1 = request
                .headers
                .get("sec-websocket-key1")
                .ok_or(Error::NoSecWebsocketKey)
                .and_then(hixie::decode_challenge_key)?;
            let key2 = request
                .headers
                .get("sec-websocket-key2")
                .ok_or(Error::NoSecWebsocketKey)
                .and_then(hixie::decode_challenge_key)?;
            let key3: [u8; 8] = http::read_body_bytes(stream, buf, head_end, 8)
                .await?
                .try_into()
                .map_err(|_| Error::InvalidHixieKey)?;
            buf.advance(head_end + 8);
            KeyMaterial::Hixie(hixie::challenge_response(key1, key2, &key3))
        }
        _ => {
            let key = request
                .headers
                .get("sec-websocket-key")
                .ok_or(Error::NoSecWebsocketKey)?;
            buf.advance(head_end);
            KeyMaterial::Hybi(accept_key(key))
        }
    };

    let uri = WsUri::from_host_header(secure, &host, &request.uri)?;
    let origin = request
        .headers
        .get(version.origin_header())
        .map(str::to_string);
    let offered_subprotocols = split_list(request.headers.get("sec-websocket-protocol"));
    let extensions = split_list(request.headers.get("sec-websocket-extensions"));

    let mut details = SessionDetails {
        version,
        uri,
        origin,
        offered_subprotocols,
        subprotocol: None,
        extensions,
        request_headers: request.headers.clone(),
    };

    handler.on_handshake_init(conn);
    // The validate hook may veto the connection with a specific status, or
    // pick one of the offered subprotocols.
    details.subprotocol = handler
        .validate(conn, &details)
        .map_err(Error::HandshakeRejected)?;

    match key_material {
        KeyMaterial::Hixie(digest) => {
            let mut response = String::new();
            response.push_str("HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
            response.push_str("Upgrade: WebSocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            if let Some(origin) = &details.origin {
                response.push_str(&format!("Sec-WebSocket-Origin: {}\r\n", origin));
            }
            response.push_str(&format!("Sec-WebSocket-Location: {}\r\n", details.uri));
            if let Some(proto) = &details.subprotocol {
                response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", proto));
            }
            response.push_str(&format!("Server: {}\r\n\r\n", settings.agent));

            let mut bytes = response.into_bytes();
            bytes.extend_from_slice(&digest);
            stream.write_all(&bytes).await?;
        }
        KeyMaterial::Hybi(accept) => {
            let mut response = String::new();
            response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
            response.push_str("Upgrade: websocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
            if let Some(proto) = &details.subprotocol {
                response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", proto));
            }
            response.push_str(&format!("Server: {}\r\n\r\n", settings.agent));
            stream.write_all(response.as_bytes()).await?;
        }
    }
    stream.flush().await?;

    info!(
        "handshake complete: {} version {:?} resource {}",
        details.uri, details.version, details.uri.resource
    );
    Ok(details)
}

async fn write_error_response<S>(
    stream: &mut S,
    settings: &Settings,
    status: u16,
    extra: Option<(&str, &str)>,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let reason = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason);
    if let Some((key, value)) = extra {
        response.push_str(&format!("{}: {}\r\n", key, value));
    }
    response.push_str(&format!("Server: {}\r\nContent-Length: 0\r\n\r\n", settings.agent));
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the client side of the opening handshake over an established
/// transport. Returns the negotiated session; `buf` keeps any bytes the
/// server sent past its response head.
pub(crate) async fn client_handshake<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    uri: &WsUri,
    config: &ClientConfig,
) -> Result<SessionDetails, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let expected_accept = accept_key(&key);

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        uri.resource,
        uri.host_header(),
        key,
    );
    if let Some(origin) = &config.origin {
        request.push_str(&format!("Origin: {}\r\n", origin));
    }
    if !config.subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            config.subprotocols.join(", ")
        ));
    }
    request.push_str(&format!("User-Agent: {}\r\n\r\n", config.settings.agent));

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head_end = http::read_head(stream, buf).await?;
    let (response, _) =
        http::parse_response(&buf[..head_end])?.ok_or(Error::IncompleteHTTPRequest)?;
    buf.advance(head_end);

    if response.status != 101 {
        return Err(Error::HandshakeRejected(response.status));
    }
    if !response.headers.contains_token("upgrade", "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !response.headers.contains_token("connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if response.headers.get("sec-websocket-accept") != Some(expected_accept.as_str()) {
        return Err(Error::InvalidAcceptKey);
    }

    let subprotocol = response
        .headers
        .get("sec-websocket-protocol")
        .map(str::to_string);
    if let Some(proto) = &subprotocol {
        if !config.subprotocols.iter().any(|p| p == proto) {
            debug!("server selected unoffered subprotocol {}", proto);
            return Err(Error::NoUpgrade);
        }
    }

    Ok(SessionDetails {
        version: Version::Hybi13,
        uri: uri.clone(),
        origin: config.origin.clone(),
        offered_subprotocols: config.subprotocols.clone(),
        subprotocol,
        extensions: Vec::new(),
        request_headers: response.headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_distinct_base64() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64_STANDARD.decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn list_splitting() {
        assert_eq!(
            split_list(Some("chat, superchat")),
            vec!["chat".to_string(), "superchat".to_string()]
        );
        assert!(split_list(None).is_empty());
        assert!(split_list(Some("  ")).is_empty());
    }

    #[test]
    fn origin_header_depends_on_version() {
        assert_eq!(Version::Hybi13.origin_header(), "origin");
        assert_eq!(Version::Hybi08.origin_header(), "sec-websocket-origin");
        assert_eq!(Version::Hybi07.origin_header(), "sec-websocket-origin");
        assert_eq!(Version::Hixie76.origin_header(), "origin");
    }
}
