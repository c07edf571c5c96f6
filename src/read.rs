use crate::config::access;
use crate::connection::{ConnState, Connection};
use crate::error::{CloseCode, Error, FailStatus};
use crate::frame::{parse_close_payload, Frame, OpCode};
use crate::handler::Handler;
use crate::handshake::Version;
use crate::hixie::{self, HixieOutput, HixieProcessor};
use crate::message::Message;
use crate::processor::{FrameProcessor, Output};
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

/// Version-specific inbound parser.
pub(crate) enum Processor {
    Hybi(FrameProcessor),
    Hixie(HixieProcessor),
}

impl Processor {
    pub(crate) fn for_version(version: Version, max_message_size: usize, strict: bool) -> Self {
        match version {
            Version::Hixie76 => Processor::Hixie(HixieProcessor::new(max_message_size)),
            _ => Processor::Hybi(FrameProcessor::new(max_message_size, strict)),
        }
    }
}

/// Per-connection driver: owns the read half, feeds the processor, runs the
/// closing handshake and invokes the handler. The single task per
/// connection is the serialization strand: hooks for a connection never
/// run concurrently.
pub(crate) struct ReadDriver<S> {
    read_half: ReadHalf<S>,
    buf: BytesMut,
    processor: Processor,
    conn: Connection,
    handler: Arc<dyn Handler>,
    writer: JoinHandle<Result<(), Error>>,
    writer_done: bool,
    /// Set after an unrecoverable framing error: bytes are drained but no
    /// longer parsed while the close handshake times out.
    discard_input: bool,
}

impl<S: AsyncRead + Send + 'static> ReadDriver<S> {
    pub(crate) fn new(
        read_half: ReadHalf<S>,
        buf: BytesMut,
        processor: Processor,
        conn: Connection,
        handler: Arc<dyn Handler>,
        writer: JoinHandle<Result<(), Error>>,
    ) -> Self {
        Self {
            read_half,
            buf,
            processor,
            conn,
            handler,
            writer,
            writer_done: false,
            discard_input: false,
        }
    }

    /// Run the open connection to completion. `on_open` has not been called
    /// yet; `on_close` will have been called exactly once on return.
    pub(crate) async fn run(mut self) {
        let settings = self.conn.inner.settings.clone();

        self.conn.set_state(ConnState::Open);
        if settings.access_enabled(access::CONNECT) {
            info!("connection {} open", self.conn.id());
        }
        self.handler.on_open(&self.conn);

        let result = self.run_loop().await;

        if let Err(err) = &result {
            if settings.error_enabled(log::Level::Warn) {
                warn!("connection {} transport error: {}", self.conn.id(), err);
            }
            let mut close_state = self.conn.lock_close_state();
            close_state.was_clean = false;
            if close_state.fail_status == FailStatus::Good {
                close_state.fail_status = FailStatus::System;
            }
        }

        self.conn.set_state(ConnState::Closed);
        self.conn.enqueue_shutdown();
        if !self.writer_done {
            // Let in-flight writes finish, then reap the writer task.
            let _ = timeout(Duration::from_secs(1), &mut self.writer).await;
        }

        if settings.access_enabled(access::DISCONNECT) {
            info!("connection {} closed", self.conn.id());
        }
        self.handler.on_close(&self.conn);
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        let close_timeout = self.conn.inner.settings.close_timeout;
        let mut close_deadline: Option<Instant> = None;

        // Handshake leftovers may already contain complete frames.
        if !self.buf.is_empty() {
            self.process_buffer()?;
        }

        loop {
            match self.conn.state() {
                ConnState::Closed => return Ok(()),
                ConnState::Closing if close_deadline.is_none() => {
                    close_deadline = Some(Instant::now() + close_timeout);
                }
                _ => {}
            }

            // Resolve the wake reason first; the borrows taken by the
            // losing futures end before any of it is acted on.
            enum Wake {
                Writer(Result<(), Error>),
                CloseTimer,
                CloseStarted,
                Read(std::io::Result<usize>),
            }

            let close_timer = async {
                match close_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            let wake = tokio::select! {
                writer_result = &mut self.writer, if !self.writer_done => {
                    Wake::Writer(match writer_result {
                        Ok(result) => result,
                        Err(_) => Err(Error::CommunicationError),
                    })
                }
                _ = close_timer => Wake::CloseTimer,
                _ = self.conn.inner.close_started.notified() => Wake::CloseStarted,
                read = self.read_half.read_buf(&mut self.buf) => Wake::Read(read),
            };

            match wake {
                Wake::Writer(result) => {
                    self.writer_done = true;
                    // A failed write is fatal for the connection.
                    return result;
                }
                Wake::CloseTimer => {
                    debug!(
                        "connection {} close handshake timed out, dropping transport",
                        self.conn.id()
                    );
                    let mut close_state = self.conn.lock_close_state();
                    close_state.was_clean = false;
                    close_state.dropped_by_me = true;
                    return Ok(());
                }
                Wake::CloseStarted => {
                    // close() was called off-task; loop to arm the timer.
                    continue;
                }
                Wake::Read(read) => {
                    let n = read?;
                    if n == 0 {
                        self.on_transport_eof();
                        return Ok(());
                    }
                    self.process_buffer()?;
                }
            }
        }
    }

    /// The peer dropped the TCP stream without finishing the close
    /// handshake.
    fn on_transport_eof(&mut self) {
        let mut close_state = self.conn.lock_close_state();
        if close_state.remote_code.is_none() {
            close_state.remote_code = Some(CloseCode::ABNORMAL);
        }
        close_state.was_clean = false;
    }

    fn process_buffer(&mut self) -> Result<(), Error> {
        loop {
            if self.discard_input {
                self.buf.clear();
                return Ok(());
            }
            if self.buf.is_empty() {
                return Ok(());
            }

            let (paused, error, made_progress) = match &mut self.processor {
                Processor::Hybi(processor) => {
                    let mut out = Vec::new();
                    let consumed = processor.consume(&self.buf, &mut out);
                    let progressed = consumed.bytes > 0 || !out.is_empty();
                    self.buf.advance(consumed.bytes);
                    for output in out {
                        self.dispatch_hybi(output);
                    }
                    (consumed.paused, consumed.error, progressed)
                }
                Processor::Hixie(processor) => {
                    let mut out = Vec::new();
                    match processor.consume(&self.buf, &mut out) {
                        Ok(taken) => {
                            let progressed = taken > 0 || !out.is_empty();
                            self.buf.advance(taken);
                            for output in out {
                                self.dispatch_hixie(output);
                            }
                            (false, None, progressed)
                        }
                        Err(err) => {
                            for output in out {
                                self.dispatch_hixie(output);
                            }
                            (false, Some(err), true)
                        }
                    }
                }
            };

            if let Some(err) = error {
                self.on_protocol_error(err);
                continue;
            }
            if paused {
                // Slots free up synchronously when dispatch returns, so a
                // pause that survives a full dispatch round cannot clear.
                if made_progress {
                    continue;
                }
                return Err(Error::OutOfMessages);
            }
            if !made_progress {
                // Partial frame; wait for more bytes.
                return Ok(());
            }
        }
    }

    fn dispatch_hybi(&mut self, output: Output) {
        let processor = match &mut self.processor {
            Processor::Hybi(processor) => processor,
            Processor::Hixie(_) => return,
        };
        match output {
            Output::Message(message) => {
                if self.conn.state() == ConnState::Open {
                    if self.conn.inner.settings.access_enabled(access::MESSAGE) {
                        debug!(
                            "connection {} message ({} bytes)",
                            self.conn.id(),
                            message.len()
                        );
                    }
                    self.handler.on_message(&self.conn, message);
                }
                // Frames arriving during CLOSING are discarded.
                processor.release_data_slot();
            }
            Output::Control(control) => {
                processor.release_control_slot();
                match control.opcode {
                    OpCode::Ping => {
                        if self.conn.state() == ConnState::Open
                            && self.handler.on_ping(&self.conn, &control.payload)
                        {
                            let _ = self.conn.pong(control.payload);
                        }
                    }
                    OpCode::Pong => {
                        if self.conn.state() == ConnState::Open {
                            self.handler.on_pong(&self.conn, &control.payload);
                        }
                    }
                    OpCode::Close => self.on_peer_close(&control.payload),
                    _ => {}
                }
            }
        }
    }

    fn dispatch_hixie(&mut self, output: HixieOutput) {
        match output {
            HixieOutput::Text(text) => {
                if self.conn.state() == ConnState::Open {
                    self.handler.on_message(&self.conn, Message::Text(text));
                }
            }
            HixieOutput::Close => match self.conn.state() {
                ConnState::Open => {
                    let _ = self.conn.enqueue_raw(hixie::close_frame().to_vec());
                    let mut close_state = self.conn.lock_close_state();
                    close_state.was_clean = true;
                    close_state.closed_by_me = false;
                    drop(close_state);
                    self.conn.set_state(ConnState::Closed);
                }
                ConnState::Closing => {
                    let mut close_state = self.conn.lock_close_state();
                    close_state.was_clean = true;
                    drop(close_state);
                    self.conn.set_state(ConnState::Closed);
                }
                _ => {}
            },
        }
    }

    /// Peer sent a close frame: echo (or correct) it and finish the
    /// handshake.
    fn on_peer_close(&mut self, payload: &[u8]) {
        let parsed = parse_close_payload(payload);
        let (remote, ack_code) = match parsed {
            // An empty payload close is answered in kind.
            Ok((code, reason)) if code == CloseCode::NO_STATUS => {
                (Some((code, reason)), CloseCode::NO_STATUS)
            }
            Ok((code, reason)) => (Some((code, reason)), code),
            // Reserved or malformed codes are answered with 1002.
            Err(_) => (None, CloseCode::PROTOCOL_ERROR),
        };

        match self.conn.state() {
            ConnState::Open => {
                {
                    let mut close_state = self.conn.lock_close_state();
                    if let Some((code, reason)) = &remote {
                        close_state.remote_code = Some(*code);
                        close_state.remote_reason = reason.clone();
                    }
                    close_state.local_code = Some(ack_code);
                    close_state.was_clean = true;
                    close_state.closed_by_me = false;
                }
                let _ = self.conn.enqueue_frame(Frame::close(ack_code, ""));
                self.conn.set_state(ConnState::Closed);
            }
            ConnState::Closing => {
                // The ack for the close we initiated.
                {
                    let mut close_state = self.conn.lock_close_state();
                    if let Some((code, reason)) = &remote {
                        close_state.remote_code = Some(*code);
                        close_state.remote_reason = reason.clone();
                    }
                    close_state.was_clean = true;
                }
                self.conn.set_state(ConnState::Closed);
            }
            _ => {}
        }
    }

    /// A violation surfaced from the processor. Start (or continue) the
    /// closing handshake with the mapped status code.
    fn on_protocol_error(&mut self, err: Error) {
        let settings = &self.conn.inner.settings;
        if settings.error_enabled(log::Level::Warn) {
            warn!("connection {} protocol error: {}", self.conn.id(), err);
        }

        let code = err.close_code();
        if self.conn.transition(ConnState::Open, ConnState::Closing) {
            {
                let mut close_state = self.conn.lock_close_state();
                close_state.local_code = Some(code);
                close_state.local_reason = err.to_string();
                close_state.closed_by_me = true;
                close_state.fail_status = FailStatus::WebSocket;
            }
            match &mut self.processor {
                Processor::Hybi(_) => {
                    let _ = self.conn.enqueue_frame(Frame::close(code, ""));
                }
                Processor::Hixie(_) => {
                    let _ = self.conn.enqueue_raw(hixie::close_frame().to_vec());
                }
            }
        }

        match &mut self.processor {
            Processor::Hybi(processor) if err.recoverable() => {
                // Framing is still aligned: skip the rest of the offending
                // frame so the peer's close ack can be parsed.
                processor.skip_current_payload();
            }
            _ => {
                self.discard_input = true;
            }
        }
    }
}
