use crate::connection::Connection;
use crate::error::Error;
use crate::handshake::SessionDetails;
use crate::http::{Headers, Request};
use crate::message::Message;

/// Application-facing connection observer.
///
/// Every hook has a default no-op implementation, so handlers implement
/// only what they care about. For a given connection, hooks are invoked
/// from a single task: `on_open` before any `on_message`, messages in
/// arrival order, and exactly one of `on_fail` (pre-open) or `on_close`
/// (post-open) last.
pub trait Handler: Send + Sync + 'static {
    /// The opening handshake request has been parsed.
    fn on_handshake_init(&self, conn: &Connection) {
        let _ = conn;
    }

    /// Server-side veto point. Return `Err(status)` to reject with that
    /// HTTP status, or `Ok(Some(proto))` to select a subprotocol from
    /// `session.offered_subprotocols`.
    fn validate(&self, conn: &Connection, session: &SessionDetails) -> Result<Option<String>, u16> {
        let _ = (conn, session);
        Ok(None)
    }

    fn on_open(&self, conn: &Connection) {
        let _ = conn;
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        let _ = (conn, message);
    }

    /// Inbound ping. Return false to suppress the automatic pong.
    fn on_ping(&self, conn: &Connection, payload: &[u8]) -> bool {
        let _ = (conn, payload);
        true
    }

    fn on_pong(&self, conn: &Connection, payload: &[u8]) {
        let _ = (conn, payload);
    }

    /// The connection reached CLOSED after having been open. Final codes
    /// and the clean flag are in `conn.close_state()`.
    fn on_close(&self, conn: &Connection) {
        let _ = conn;
    }

    /// The connection failed before reaching OPEN.
    fn on_fail(&self, conn: &Connection, error: &Error) {
        let _ = (conn, error);
    }

    /// An inbound request that was not a WebSocket upgrade. The returned
    /// response is written verbatim and the transport closed.
    fn http(&self, conn: &Connection, request: &Request) -> HttpResponse {
        let _ = (conn, request);
        HttpResponse::upgrade_required()
    }
}

/// Minimal response surface for the `http` hook.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.insert("content-type", content_type);
        self.body = body;
        self
    }

    pub fn upgrade_required() -> Self {
        Self::new(426, "Upgrade Required")
    }

    pub(crate) fn format(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        head.push_str(&self.headers.format());
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// No-op handler, useful as a default and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl Handler for NullHandler {}
