use crate::config::Settings;
use crate::error::{CloseCode, Error, FailStatus};
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::handshake::{SessionDetails, Version};
use crate::hixie;
use crate::message::{Message, PreparedMessage};
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use uuid::Uuid;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// How the closing handshake played out, per connection.
#[derive(Debug, Clone, Default)]
pub struct CloseState {
    pub local_code: Option<CloseCode>,
    pub local_reason: String,
    pub remote_code: Option<CloseCode>,
    pub remote_reason: String,
    /// Both sides exchanged close frames.
    pub was_clean: bool,
    /// The local side sent the first close frame.
    pub closed_by_me: bool,
    /// The local side dropped the transport without an exchange.
    pub dropped_by_me: bool,
    pub fail_status: FailStatus,
}

/// Commands queued for the writer task.
#[derive(Debug)]
pub(crate) enum OutCommand {
    Prepared(PreparedMessage),
    Raw(Vec<u8>),
    /// Flush and shut the transport down.
    Shutdown,
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    role: Role,
    state: AtomicU8,
    close_state: Mutex<CloseState>,
    details: OnceLock<SessionDetails>,
    out_tx: UnboundedSender<OutCommand>,
    buffered: Arc<AtomicUsize>,
    /// Wakes the connection driver when `close()` arrives off-task.
    pub(crate) close_started: Notify,
    pub(crate) settings: Settings,
}

/// Handle to a live connection, shared between the endpoint registry, the
/// driver task and the application handler. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        role: Role,
        settings: Settings,
        out_tx: UnboundedSender<OutCommand>,
        buffered: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: new_connection_id(),
                role,
                state: AtomicU8::new(ConnState::Connecting as u8),
                close_state: Mutex::new(CloseState::default()),
                details: OnceLock::new(),
                out_tx,
                buffered,
                close_started: Notify::new(),
                settings,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Negotiated handshake details; `None` until the handshake completes.
    pub fn details(&self) -> Option<&SessionDetails> {
        self.inner.details.get()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.details().and_then(|d| d.subprotocol.as_deref())
    }

    pub fn origin(&self) -> Option<&str> {
        self.details().and_then(|d| d.origin.as_deref())
    }

    /// Snapshot of the close bookkeeping.
    pub fn close_state(&self) -> CloseState {
        self.inner.close_state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Outbound bytes queued but not yet written to the transport.
    pub fn buffered_amount(&self) -> usize {
        self.inner.buffered.load(Ordering::Acquire)
    }

    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send_message(Message::Text(text.to_string()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.send_message(Message::Binary(data))
    }

    pub fn send_message(&self, message: Message) -> Result<(), Error> {
        if self.state() != ConnState::Open {
            return Err(Error::InvalidState);
        }
        if self.version() == Some(Version::Hixie76) {
            return match message {
                Message::Text(text) => self.enqueue_raw(hixie::frame_text(text.as_bytes())),
                Message::Binary(_) => Err(Error::UnsupportedByVersion),
            };
        }
        for frame in message.into_frames(None) {
            self.enqueue_frame(frame)?;
        }
        Ok(())
    }

    pub fn ping(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.send_control(OpCode::Ping, payload)
    }

    pub(crate) fn pong(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.send_control(OpCode::Pong, payload)
    }

    fn send_control(&self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        if self.state() != ConnState::Open {
            return Err(Error::InvalidState);
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFramePayloadSize);
        }
        if self.version() == Some(Version::Hixie76) {
            // No control frames in the legacy protocol.
            return Err(Error::UnsupportedByVersion);
        }
        self.enqueue_frame(Frame::new(true, opcode, payload))
    }

    /// Initiate the closing handshake. Application codes other than 1000
    /// and 4000-4999 are replaced with 1002 and logged.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        let code = if code.allowed_from_app() || code == CloseCode::NO_STATUS {
            code
        } else {
            warn!(
                "close code {} not allowed from application, sending 1002",
                code.0
            );
            CloseCode::PROTOCOL_ERROR
        };

        if !self.transition(ConnState::Open, ConnState::Closing) {
            return Err(Error::InvalidState);
        }

        {
            let mut close_state = self.lock_close_state();
            close_state.local_code = Some(code);
            close_state.local_reason = reason.to_string();
            close_state.closed_by_me = true;
        }

        let result = if self.version() == Some(Version::Hixie76) {
            self.enqueue_raw(hixie::close_frame().to_vec())
        } else {
            self.enqueue_frame(Frame::close(code, reason))
        };
        // notify_one stores a permit, so the driver sees this even if it
        // was not parked in its select yet.
        self.inner.close_started.notify_one();
        result
    }

    // --- crate-internal state plumbing, used by the driver and endpoint ---

    pub(crate) fn version(&self) -> Option<Version> {
        self.details().map(|d| d.version)
    }

    pub(crate) fn set_details(&self, details: SessionDetails) {
        let _ = self.inner.details.set(details);
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Compare-and-swap state transition; true when it applied.
    pub(crate) fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn lock_close_state(&self) -> std::sync::MutexGuard<'_, CloseState> {
        self.inner
            .close_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an already-validated frame, masking it when this side is a
    /// client. Messages hit the wire in the order they were queued.
    pub(crate) fn enqueue_frame(&self, frame: Frame) -> Result<(), Error> {
        let mask_key = match self.inner.role {
            Role::Client => Some(generate_mask_key()),
            Role::Server => None,
        };
        let prepared = PreparedMessage::prepare(frame, mask_key);
        self.inner
            .buffered
            .fetch_add(prepared.wire_len(), Ordering::AcqRel);
        self.inner
            .out_tx
            .send(OutCommand::Prepared(prepared))
            .map_err(|_| Error::CommunicationError)
    }

    pub(crate) fn enqueue_raw(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.inner.buffered.fetch_add(bytes.len(), Ordering::AcqRel);
        self.inner
            .out_tx
            .send(OutCommand::Raw(bytes))
            .map_err(|_| Error::CommunicationError)
    }

    pub(crate) fn enqueue_shutdown(&self) {
        let _ = self.inner.out_tx.send(OutCommand::Shutdown);
    }
}

fn new_connection_id() -> Uuid {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    Uuid::new_v8(rng.random::<[u8; 16]>())
}

/// Fresh masking key per client frame, from the endpoint's shared source.
pub(crate) fn generate_mask_key() -> [u8; 4] {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    rng.random::<[u8; 4]>()
}
