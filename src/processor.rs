use crate::error::Error;
use crate::frame::{HeaderCodec, HeaderState, OpCode};
use crate::mask;
use crate::message::{ControlMessage, DataMessage, Message, MessagePool};
use crate::utf8::UTF8_REJECT;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadHeader,
    ReadPayload,
    /// Discarding bytes after a locally-recoverable violation.
    Ignore,
}

/// What a `consume` call produced for the connection layer.
#[derive(Debug)]
pub enum Output {
    Message(Message),
    Control(ControlMessage),
}

/// Result of feeding bytes to the processor.
///
/// `bytes` is always accurate, even when an error is reported: messages
/// completed before the offending frame are already in the output vector,
/// and the buffer can be advanced before recovery is attempted.
#[derive(Debug)]
pub struct Consumed {
    pub bytes: usize,
    /// True when the message pool ran dry: the remaining input was left
    /// untouched and the caller must wait for a release before feeding it
    /// again.
    pub paused: bool,
    /// Protocol violation raised by the frame that `bytes` stops inside of.
    pub error: Option<Error>,
}

impl Consumed {
    fn ok(bytes: usize) -> Self {
        Self {
            bytes,
            paused: false,
            error: None,
        }
    }

    fn paused(bytes: usize) -> Self {
        Self {
            bytes,
            paused: true,
            error: None,
        }
    }

    fn failed(bytes: usize, error: Error) -> Self {
        Self {
            bytes,
            paused: false,
            error: Some(error),
        }
    }
}

/// Per-connection frame state machine.
///
/// Drives the header codec, the masking engine and the streaming UTF-8
/// validator over an arbitrary chunking of the inbound byte stream, emitting
/// complete messages. Synchronous by design; the async read loop owns the
/// buffer and the suspension points.
pub struct FrameProcessor {
    state: State,
    header: HeaderCodec,
    pool: MessagePool,
    /// Fragmented data message being assembled, if any.
    data: Option<DataMessage>,
    /// Control frame currently receiving payload bytes.
    control: Option<ControlMessage>,
    /// Header of the frame whose payload is being read.
    frame_fin: bool,
    frame_masked: bool,
    frame_mask_key: [u8; 4],
    remaining: u64,
    mask_offset: usize,
    ignore_remaining: u64,
    max_message_size: usize,
    strict_masking: bool,
}

impl FrameProcessor {
    pub fn new(max_message_size: usize, strict_masking: bool) -> Self {
        Self {
            state: State::ReadHeader,
            header: HeaderCodec::new(),
            pool: MessagePool::default(),
            data: None,
            control: None,
            frame_fin: true,
            frame_masked: false,
            frame_mask_key: [0; 4],
            remaining: 0,
            mask_offset: 0,
            ignore_remaining: 0,
            max_message_size,
            strict_masking,
        }
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Return a data-message slot to the pool once the handler is done.
    pub fn release_data_slot(&mut self) {
        self.pool.release_data(None);
    }

    pub fn release_control_slot(&mut self) {
        self.pool.release_control();
    }

    /// Payload bytes of the current frame not yet consumed.
    pub fn payload_remaining(&self) -> u64 {
        self.remaining
    }

    /// Abandon the current frame and discard its outstanding payload bytes,
    /// then resume at the next header. Used to recover from violations that
    /// leave the framing locally intact (oversize or invalid payloads).
    pub fn skip_current_payload(&mut self) {
        self.ignore_remaining = if self.header.state() == HeaderState::Ready {
            // Frame rejected at header validation; none of its payload has
            // been read yet.
            self.header.payload_len()
        } else {
            self.remaining
        };
        self.remaining = 0;
        // Return any staged buffers so the pool does not leak slots.
        if self.control.take().is_some() {
            self.pool.release_control();
        }
        if let Some(msg) = self.data.take() {
            self.pool.release_data(Some(msg.payload));
        }
        self.header.reset();
        self.state = if self.ignore_remaining > 0 {
            State::Ignore
        } else {
            State::ReadHeader
        };
    }

    /// Feed bytes; emits completed messages into `out`. `Consumed.bytes`
    /// reports how much of `input` was taken. A protocol violation is
    /// reported alongside it; the caller decides between
    /// `skip_current_payload` recovery and tearing the connection down.
    pub fn consume(&mut self, input: &[u8], out: &mut Vec<Output>) -> Consumed {
        let mut offset = 0;

        loop {
            match self.state {
                State::ReadHeader => {
                    // The codec may already hold a complete header if the
                    // previous call paused on an exhausted pool.
                    if self.header.state() != HeaderState::Ready {
                        let (taken, header_state) = self.header.consume(&input[offset..]);
                        offset += taken;
                        if header_state != HeaderState::Ready {
                            break;
                        }
                    }
                    match self.begin_frame() {
                        Ok(()) => {}
                        Err(Error::OutOfMessages) => {
                            // Soft interrupt: keep the parsed header, hand
                            // back unread bytes, resume after a release.
                            return Consumed::paused(offset);
                        }
                        Err(err) => return Consumed::failed(offset, err),
                    }
                }
                State::ReadPayload => {
                    if self.remaining == 0 {
                        if let Err(err) = self.finish_frame(out) {
                            return Consumed::failed(offset, err);
                        }
                        continue;
                    }
                    if offset == input.len() {
                        break;
                    }
                    let take = (self.remaining as usize).min(input.len() - offset);
                    // The chunk counts as consumed even when it trips the
                    // validator; its bytes belong to the doomed frame.
                    let result = self.consume_payload(&input[offset..offset + take]);
                    offset += take;
                    if let Err(err) = result {
                        return Consumed::failed(offset, err);
                    }
                }
                State::Ignore => {
                    if self.ignore_remaining == 0 {
                        self.state = State::ReadHeader;
                        continue;
                    }
                    if offset == input.len() {
                        break;
                    }
                    let skip = (self.ignore_remaining as usize).min(input.len() - offset);
                    offset += skip;
                    self.ignore_remaining -= skip as u64;
                }
            }
        }

        Consumed::ok(offset)
    }

    /// Header is complete: validate it and stage the right message buffer.
    fn begin_frame(&mut self) -> Result<(), Error> {
        let budget = self.remaining_message_budget();
        let header = self.header.validate(budget)?;
        let opcode = header.opcode()?;

        trace!(
            "frame header: fin={} opcode={:?} len={} masked={}",
            header.fin,
            opcode,
            header.payload_len,
            header.masked
        );

        if opcode.is_control() {
            self.control = Some(self.pool.acquire_control(opcode)?);
        } else if opcode == OpCode::Continue {
            if self.data.is_none() {
                return Err(Error::InvalidContinuationFrame);
            }
        } else {
            if self.data.is_some() {
                return Err(Error::DataMessageInProgress);
            }
            self.data = Some(self.pool.acquire_data(opcode)?);
        }

        self.frame_fin = header.fin;
        self.frame_masked = header.masked;
        self.frame_mask_key = header.mask_key;
        self.remaining = header.payload_len;
        self.mask_offset = 0;
        self.header.reset();
        self.state = State::ReadPayload;
        Ok(())
    }

    /// How many more data payload bytes this connection will accept for the
    /// frame being parsed. Control frames are exempt (capped at 125 by
    /// header validation).
    fn remaining_message_budget(&self) -> usize {
        let used = self.data.as_ref().map_or(0, |msg| msg.payload.len());
        self.max_message_size.saturating_sub(used)
    }

    fn consume_payload(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let mut bytes = chunk.to_vec();
        if self.frame_masked {
            mask::mask_in_place_with(
                &mut bytes,
                self.frame_mask_key,
                self.mask_offset,
                self.strict_masking,
            );
        }
        self.mask_offset = (self.mask_offset + bytes.len()) % 4;
        self.remaining -= bytes.len() as u64;

        if let Some(control) = self.control.as_mut() {
            control.payload.extend_from_slice(&bytes);
            return Ok(());
        }

        let msg = self
            .data
            .as_mut()
            .ok_or(Error::InvalidContinuationFrame)?;
        if msg.is_text() {
            // Reject a bad sequence the moment it appears, mid-frame.
            for &byte in &bytes {
                if msg.validator.consume(byte) == UTF8_REJECT {
                    return Err(Error::InvalidUtf8Payload);
                }
            }
        }
        msg.payload.extend_from_slice(&bytes);
        Ok(())
    }

    fn finish_frame(&mut self, out: &mut Vec<Output>) -> Result<(), Error> {
        if let Some(control) = self.control.take() {
            out.push(Output::Control(control));
        } else if self.frame_fin {
            let msg = self.data.take().ok_or(Error::InvalidContinuationFrame)?;
            if msg.is_text() && !msg.validator.complete() {
                // Final frame ended mid-codepoint.
                self.pool.release_data(Some(msg.payload));
                return Err(Error::InvalidUtf8Payload);
            }
            match msg.into_message() {
                Ok(message) => out.push(Output::Message(message)),
                Err(err) => {
                    self.pool.release_data(None);
                    return Err(err);
                }
            }
        }
        // fin=0 keeps the data message staged for the next fragment.

        self.state = State::ReadHeader;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameHeader};

    const MAX: usize = 16 << 20;

    fn encode(frame: &Frame, mask_key: Option<[u8; 4]>) -> Vec<u8> {
        let mut header =
            FrameHeader::data(frame.final_fragment, frame.opcode, frame.payload.len() as u64);
        let mut payload = frame.payload.clone();
        if let Some(key) = mask_key {
            header = header.with_mask(key);
            mask::mask_in_place(&mut payload, key, 0);
        }
        let mut bytes = Vec::new();
        header.serialize(&mut bytes);
        bytes.extend_from_slice(&payload);
        bytes
    }

    fn feed_all(processor: &mut FrameProcessor, bytes: &[u8]) -> Vec<Output> {
        let mut out = Vec::new();
        let consumed = processor.consume(bytes, &mut out);
        assert_eq!(consumed.bytes, bytes.len());
        assert!(!consumed.paused);
        assert!(consumed.error.is_none(), "{:?}", consumed.error);
        out
    }

    #[test]
    fn unmasked_text_frame() {
        let mut processor = FrameProcessor::new(MAX, false);
        let bytes = encode(&Frame::new(true, OpCode::Text, b"Hello".to_vec()), None);
        let out = feed_all(&mut processor, &bytes);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Output::Message(Message::Text(t)) if t == "Hello"));
    }

    #[test]
    fn masked_text_frame() {
        let mut processor = FrameProcessor::new(MAX, false);
        let bytes = encode(
            &Frame::new(true, OpCode::Text, b"Hello".to_vec()),
            Some([0x37, 0xfa, 0x21, 0x3d]),
        );
        let out = feed_all(&mut processor, &bytes);
        assert!(matches!(&out[0], Output::Message(Message::Text(t)) if t == "Hello"));
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut processor = FrameProcessor::new(MAX, false);
        let bytes = encode(
            &Frame::new(true, OpCode::Binary, vec![1, 2, 3, 4, 5]),
            Some([9, 8, 7, 6]),
        );
        let mut out = Vec::new();
        for &byte in &bytes {
            let consumed = processor.consume(&[byte], &mut out);
            assert!(consumed.error.is_none());
        }
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Output::Message(Message::Binary(b)) if b == &[1, 2, 3, 4, 5]));
    }

    #[test]
    fn fragmented_binary_reassembly() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut bytes = encode(&Frame::new(false, OpCode::Binary, vec![0x01, 0x02]), None);
        bytes.extend(encode(&Frame::new(false, OpCode::Continue, vec![0x03]), None));
        bytes.extend(encode(
            &Frame::new(true, OpCode::Continue, vec![0x04, 0x05]),
            None,
        ));
        let out = feed_all(&mut processor, &bytes);
        assert_eq!(out.len(), 1);
        assert!(
            matches!(&out[0], Output::Message(Message::Binary(b)) if b == &[1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn control_frame_interleaves_fragments() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut bytes = encode(&Frame::new(false, OpCode::Text, b"he".to_vec()), None);
        bytes.extend(encode(&Frame::new(true, OpCode::Ping, b"x".to_vec()), None));
        bytes.extend(encode(&Frame::new(true, OpCode::Continue, b"llo".to_vec()), None));
        let out = feed_all(&mut processor, &bytes);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Output::Control(c) if c.opcode == OpCode::Ping));
        assert!(matches!(&out[1], Output::Message(Message::Text(t)) if t == "hello"));
    }

    #[test]
    fn new_data_message_before_fin_is_violation() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut bytes = encode(&Frame::new(false, OpCode::Text, b"a".to_vec()), None);
        bytes.extend(encode(&Frame::new(true, OpCode::Text, b"b".to_vec()), None));
        let mut out = Vec::new();
        let consumed = processor.consume(&bytes, &mut out);
        assert!(matches!(consumed.error, Some(Error::DataMessageInProgress)));
    }

    #[test]
    fn continuation_without_message_is_violation() {
        let mut processor = FrameProcessor::new(MAX, false);
        let bytes = encode(&Frame::new(true, OpCode::Continue, b"a".to_vec()), None);
        let mut out = Vec::new();
        let consumed = processor.consume(&bytes, &mut out);
        assert!(matches!(consumed.error, Some(Error::InvalidContinuationFrame)));
    }

    #[test]
    fn invalid_utf8_rejected_mid_stream() {
        let mut processor = FrameProcessor::new(MAX, false);
        // fin=0: the violation must surface before the final frame arrives.
        let bytes = encode(&Frame::new(false, OpCode::Text, vec![0xC3, 0x28]), None);
        let mut out = Vec::new();
        let consumed = processor.consume(&bytes, &mut out);
        assert!(matches!(consumed.error, Some(Error::InvalidUtf8Payload)));
    }

    #[test]
    fn final_frame_mid_codepoint_is_rejected() {
        let mut processor = FrameProcessor::new(MAX, false);
        // 0xE2 0x82 starts a 3-byte sequence that never completes.
        let bytes = encode(&Frame::new(true, OpCode::Text, vec![0xE2, 0x82]), None);
        let mut out = Vec::new();
        let consumed = processor.consume(&bytes, &mut out);
        assert!(matches!(consumed.error, Some(Error::InvalidUtf8Payload)));
    }

    #[test]
    fn oversize_header_rejected_before_payload() {
        let mut processor = FrameProcessor::new(1024, false);
        let mut header_bytes = Vec::new();
        FrameHeader::data(true, OpCode::Text, 2048).serialize(&mut header_bytes);
        let mut out = Vec::new();
        // Only the header is supplied; the violation fires without payload.
        let consumed = processor.consume(&header_bytes, &mut out);
        assert!(matches!(consumed.error, Some(Error::MessageTooBig)));
    }

    #[test]
    fn fragments_accumulate_against_max_message_size() {
        let mut processor = FrameProcessor::new(100, false);
        let mut out = Vec::new();
        let first = encode(&Frame::new(false, OpCode::Binary, vec![0u8; 80]), None);
        let consumed = processor.consume(&first, &mut out);
        assert!(consumed.error.is_none());
        let second = encode(&Frame::new(true, OpCode::Continue, vec![0u8; 80]), None);
        let consumed = processor.consume(&second, &mut out);
        assert!(matches!(consumed.error, Some(Error::MessageTooBig)));
    }

    #[test]
    fn skip_current_payload_recovers_framing() {
        let mut processor = FrameProcessor::new(4, false);
        let mut out = Vec::new();

        let oversize = encode(&Frame::new(true, OpCode::Binary, vec![9u8; 8]), None);
        let consumed = processor.consume(&oversize, &mut out);
        assert!(matches!(consumed.error, Some(Error::MessageTooBig)));
        let advanced = consumed.bytes;

        // Skip the outstanding payload, then a well-formed frame parses.
        processor.skip_current_payload();
        let mut rest = oversize[advanced..].to_vec();
        rest.extend(encode(&Frame::new(true, OpCode::Binary, vec![1, 2]), None));
        let consumed = processor.consume(&rest, &mut out);
        assert!(consumed.error.is_none());
        assert_eq!(consumed.bytes, rest.len());
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Output::Message(Message::Binary(b)) if b == &[1, 2]));
    }

    #[test]
    fn utf8_violation_recovery_keeps_stream_aligned() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut out = Vec::new();

        // Five payload bytes, the second of which breaks the encoding.
        let bad = encode(
            &Frame::new(true, OpCode::Text, vec![0xC3, 0x28, b'a', b'b', b'c']),
            None,
        );
        let consumed = processor.consume(&bad, &mut out);
        assert!(matches!(consumed.error, Some(Error::InvalidUtf8Payload)));

        processor.skip_current_payload();
        let mut rest = bad[consumed.bytes..].to_vec();
        rest.extend(encode(&Frame::new(true, OpCode::Text, b"ok".to_vec()), None));
        let consumed = processor.consume(&rest, &mut out);
        assert!(consumed.error.is_none(), "{:?}", consumed.error);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Output::Message(Message::Text(t)) if t == "ok"));
    }

    #[test]
    fn pool_exhaustion_pauses_without_losing_bytes() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut out = Vec::new();

        let first = encode(&Frame::new(true, OpCode::Binary, vec![1]), None);
        let consumed = processor.consume(&first, &mut out);
        assert_eq!(out.len(), 1);
        assert!(!consumed.paused);

        // The slot is still held (handler hasn't released); the next data
        // frame pauses the processor instead of erroring.
        let second = encode(&Frame::new(true, OpCode::Binary, vec![2, 3]), None);
        let consumed = processor.consume(&second, &mut out);
        assert!(consumed.paused);
        assert_eq!(out.len(), 1);
        let resumed_at = consumed.bytes;

        processor.release_data_slot();
        let consumed = processor.consume(&second[resumed_at..], &mut out);
        assert!(!consumed.paused);
        assert!(consumed.error.is_none());
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Output::Message(Message::Binary(b)) if b == &[2, 3]));
    }

    #[test]
    fn close_frame_with_payload() {
        let mut processor = FrameProcessor::new(MAX, false);
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let bytes = encode(&Frame::new(true, OpCode::Close, payload.clone()), None);
        let out = feed_all(&mut processor, &bytes);
        assert!(matches!(
            &out[0],
            Output::Control(c) if c.opcode == OpCode::Close && c.payload == payload
        ));
    }

    #[test]
    fn dispatched_bytes_match_completed_payload_bytes() {
        // Across an arbitrary mix of frames, handler-visible bytes equal the
        // payload bytes of completed frames.
        let mut processor = FrameProcessor::new(MAX, false);
        let mut bytes = Vec::new();
        let mut expected = 0usize;
        for (fin, opcode, payload) in [
            (true, OpCode::Binary, vec![1u8; 10]),
            (false, OpCode::Text, b"ab".to_vec()),
            (true, OpCode::Continue, b"cd".to_vec()),
            (true, OpCode::Binary, vec![2u8; 7]),
        ] {
            expected += payload.len();
            bytes.extend(encode(&Frame::new(fin, opcode, payload), None));
        }

        let mut out = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let consumed = processor.consume(&bytes[offset..], &mut out);
            assert!(consumed.error.is_none());
            offset += consumed.bytes;
            if consumed.paused {
                processor.release_data_slot();
            }
        }
        let delivered: usize = out
            .iter()
            .map(|o| match o {
                Output::Message(m) => m.len(),
                Output::Control(c) => c.payload.len(),
            })
            .sum();
        assert_eq!(delivered, expected);
    }
}
