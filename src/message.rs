use crate::error::Error;
use crate::frame::{Frame, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD};
use crate::mask;
use crate::utf8::Utf8Validator;
use std::sync::Arc;
use tokio::sync::Notify;

/// A complete data message as delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn as_text(&self) -> Result<&str, Error> {
        match self {
            Message::Text(text) => Ok(text),
            Message::Binary(data) => Ok(std::str::from_utf8(data)
                .map_err(|_| Error::InvalidUtf8Payload)?),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn len(&self) -> usize {
        self.as_binary().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_binary().is_empty()
    }

    /// Split into wire frames, fragmenting at `fragment_size` when given.
    pub fn into_frames(self, fragment_size: Option<usize>) -> Vec<Frame> {
        let opcode = self.opcode();
        let payload = match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        };

        let fragment_size = match fragment_size {
            Some(size) if size > 0 && size < payload.len() => size,
            _ => return vec![Frame::new(true, opcode, payload)],
        };

        let mut frames = Vec::new();
        for chunk in payload.chunks(fragment_size) {
            frames.push(Frame {
                final_fragment: false,
                opcode: if frames.is_empty() {
                    opcode
                } else {
                    OpCode::Continue
                },
                payload: chunk.to_vec(),
            });
        }
        if let Some(last) = frames.last_mut() {
            last.final_fragment = true;
        }
        frames
    }
}

/// Inbound data message being assembled frame by frame.
#[derive(Debug)]
pub struct DataMessage {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub validator: Utf8Validator,
}

impl DataMessage {
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    pub fn into_message(self) -> Result<Message, Error> {
        match self.opcode {
            OpCode::Text => {
                // The streaming validator has already vetted every byte.
                let text = String::from_utf8(self.payload)?;
                Ok(Message::Text(text))
            }
            OpCode::Binary => Ok(Message::Binary(self.payload)),
            other => Err(Error::ReservedOpcode(other.as_u8())),
        }
    }
}

/// Inbound control frame (ping/pong/close), capped at 125 bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// An outbound frame with its header pre-serialized and, for clients, the
/// payload already masked. Re-sending it requires no rework.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl PreparedMessage {
    pub fn prepare(frame: Frame, mask_key: Option<[u8; 4]>) -> Self {
        let mut header_fields =
            FrameHeader::data(frame.final_fragment, frame.opcode, frame.payload.len() as u64);
        let mut payload = frame.payload;
        if let Some(key) = mask_key {
            header_fields = header_fields.with_mask(key);
            mask::mask_in_place(&mut payload, key, 0);
        }
        let mut header = Vec::with_capacity(crate::frame::MAX_HEADER_LEN);
        header_fields.serialize(&mut header);
        Self { header, payload }
    }

    /// Total wire size, header included.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }
}

/// Per-connection buffer pools: one in-flight data message plus a small ring
/// of control slots. Exhaustion is a soft interrupt: the processor pauses
/// and resumes once a slot is released.
#[derive(Debug)]
pub struct MessagePool {
    data_available: usize,
    control_available: usize,
    spare: Vec<Vec<u8>>,
    released: Arc<Notify>,
}

pub const DEFAULT_DATA_SLOTS: usize = 1;
pub const DEFAULT_CONTROL_SLOTS: usize = 4;

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_SLOTS, DEFAULT_CONTROL_SLOTS)
    }
}

impl MessagePool {
    pub fn new(data_slots: usize, control_slots: usize) -> Self {
        Self {
            data_available: data_slots,
            control_available: control_slots,
            spare: Vec::new(),
            released: Arc::new(Notify::new()),
        }
    }

    /// Wakes whenever a slot is released; the read loop awaits this after an
    /// `OutOfMessages` pause.
    pub fn released_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }

    pub fn acquire_data(&mut self, opcode: OpCode) -> Result<DataMessage, Error> {
        if self.data_available == 0 {
            return Err(Error::OutOfMessages);
        }
        self.data_available -= 1;
        let mut payload = self.spare.pop().unwrap_or_default();
        payload.clear();
        Ok(DataMessage {
            opcode,
            payload,
            validator: Utf8Validator::new(),
        })
    }

    pub fn acquire_control(&mut self, opcode: OpCode) -> Result<ControlMessage, Error> {
        if self.control_available == 0 {
            return Err(Error::OutOfMessages);
        }
        self.control_available -= 1;
        Ok(ControlMessage {
            opcode,
            payload: Vec::with_capacity(MAX_CONTROL_PAYLOAD),
        })
    }

    pub fn release_data(&mut self, buffer: Option<Vec<u8>>) {
        self.data_available += 1;
        if let Some(buf) = buffer {
            self.spare.push(buf);
        }
        self.released.notify_waiters();
    }

    pub fn release_control(&mut self) {
        self.control_available += 1;
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accessors() {
        let text = Message::Text("hi".into());
        assert_eq!(text.as_binary(), b"hi");
        assert_eq!(text.as_text().unwrap(), "hi");
        assert_eq!(text.opcode(), OpCode::Text);

        let bin = Message::Binary(vec![1, 2, 3]);
        assert_eq!(bin.len(), 3);
        assert_eq!(bin.opcode(), OpCode::Binary);
    }

    #[test]
    fn fragmentation_into_frames() {
        let frames = Message::Binary(vec![1, 2, 3, 4, 5]).into_frames(Some(2));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert!(!frames[0].final_fragment);
        assert_eq!(frames[1].opcode, OpCode::Continue);
        assert_eq!(frames[2].opcode, OpCode::Continue);
        assert!(frames[2].final_fragment);
        assert_eq!(frames[2].payload, vec![5]);

        let frames = Message::Text("hello".into()).into_frames(None);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].final_fragment);
    }

    #[test]
    fn pool_exhaustion_and_release() {
        let mut pool = MessagePool::new(1, 2);
        let msg = pool.acquire_data(OpCode::Text).unwrap();
        assert!(matches!(
            pool.acquire_data(OpCode::Text),
            Err(Error::OutOfMessages)
        ));
        pool.release_data(Some(msg.payload));
        assert!(pool.acquire_data(OpCode::Binary).is_ok());

        pool.acquire_control(OpCode::Ping).unwrap();
        pool.acquire_control(OpCode::Ping).unwrap();
        assert!(matches!(
            pool.acquire_control(OpCode::Ping),
            Err(Error::OutOfMessages)
        ));
        pool.release_control();
        assert!(pool.acquire_control(OpCode::Pong).is_ok());
    }

    #[test]
    fn prepared_message_masks_once() {
        let frame = Frame::new(true, OpCode::Text, b"Hello".to_vec());
        let prepared = PreparedMessage::prepare(frame, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(prepared.header[0], 0x81);
        assert_eq!(prepared.header[1], 0x80 | 5);
        assert_eq!(&prepared.header[2..6], &[0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(prepared.payload, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);

        let unmasked = PreparedMessage::prepare(
            Frame::new(true, OpCode::Text, b"Hello".to_vec()),
            None,
        );
        assert_eq!(unmasked.header, vec![0x81, 0x05]);
        assert_eq!(unmasked.payload, b"Hello");
    }
}
