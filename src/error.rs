use httparse::Error as HttpParseError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("channel communication error")]
    CommunicationError,

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Handshake Errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Host header missing in the request")]
    NoHostHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Unsupported WebSocket protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Handshake rejected with HTTP status {0}")]
    HandshakeRejected(u16),

    #[error("Malformed Hixie-76 challenge key")]
    InvalidHixieKey,

    // Framing Errors
    #[error("Reserved bit used")]
    ReservedBitsNotZero,

    #[error("Reserved opcode used: {0}")]
    ReservedOpcode(u8),

    #[error("Control frames must not be fragmented")]
    ControlFrameFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Payload length not minimally encoded")]
    NonMinimalLength,

    #[error("64-bit payload length has the high bit set")]
    JumboPayloadSize,

    #[error("Max message size reached")]
    MessageTooBig,

    // Fragmentation Errors
    #[error("New data message while another is still in progress")]
    DataMessageInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8Payload,

    #[error("Invalid close frame payload")]
    InvalidClosePayload,

    // Lifecycle Errors
    #[error("Operation invalid in endpoint state")]
    InvalidState,

    #[error("No free message buffers")]
    OutOfMessages,

    #[error("wss:// URI requires a TLS-capable endpoint")]
    EndpointUnsecure,

    #[error("Operation not supported by the negotiated protocol version")]
    UnsupportedByVersion,

    // HTTP / URI Errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("Invalid port in WebSocket URL")]
    URLInvalidPort,

    #[error("WebSocket URIs cannot have fragments")]
    URLHasFragment,

    #[error("{source}")]
    DomainError {
        #[from]
        source: pki_types::InvalidDnsNameError,
    },

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,
}

impl Error {
    /// The close code this error maps to when it aborts an open connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::InvalidUtf8Payload => CloseCode::INVALID_PAYLOAD,
            Error::MessageTooBig => CloseCode::MESSAGE_TOO_BIG,
            Error::CommunicationError | Error::OutOfMessages => CloseCode::INTERNAL_ERROR,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }

    /// Whether the framing layer can still recover by skipping the rest of
    /// the offending frame instead of dropping the transport.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidUtf8Payload | Error::MessageTooBig | Error::OutOfMessages
        )
    }
}

/// Close status codes defined by RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const EXTENSION_REQUIRED: CloseCode = CloseCode(1010);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const TLS_HANDSHAKE: CloseCode = CloseCode(1015);

    /// Codes reserved by the protocol that peers must not originate.
    pub fn reserved(self) -> bool {
        matches!(self.0, 1004 | 1012..=1014 | 1016..=2999)
    }

    /// Codes that may never appear inside a close frame on the wire.
    pub fn invalid_on_wire(self) -> bool {
        self.0 <= 999 || self.0 >= 5000 || matches!(self.0, 1005 | 1006 | 1015)
    }

    /// Codes an application is allowed to pass to `close()`.
    pub fn allowed_from_app(self) -> bool {
        self.0 == 1000 || (4000..=4999).contains(&self.0)
    }
}

/// Why a connection ultimately failed, surfaced through `on_fail`/`on_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailStatus {
    #[default]
    Good,
    System,
    WebSocket,
    Unknown,
    TimeoutTls,
    TimeoutWs,
}

/// Classification of client connect errors, routed to `on_fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    Refused,
    Reset,
    TimedOut,
    BrokenPipe,
    Canceled,
    Unknown,
}

impl ConnectError {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::ConnectionReset => ConnectError::Reset,
            io::ErrorKind::TimedOut => ConnectError::TimedOut,
            io::ErrorKind::BrokenPipe => ConnectError::BrokenPipe,
            io::ErrorKind::Interrupted => ConnectError::Canceled,
            _ => ConnectError::Unknown,
        }
    }
}
