//! Hixie-76 (draft-hixie-thewebsocketprotocol-76) support: the key
//! challenge from the opening handshake and the `\x00 … \xFF` framing.
//!
//! Browsers of that era send `Sec-WebSocket-Key1`/`-Key2` headers encoding
//! two 32-bit numbers as digits interleaved with spaces, plus 8 raw bytes
//! after the header block. The server proves it understood by echoing the
//! MD5 of the decoded numbers (big-endian) concatenated with those bytes.

use crate::error::Error;
use crate::utf8::{Utf8Validator, UTF8_REJECT};
use md5::{Digest, Md5};

const TEXT_FRAME_START: u8 = 0x00;
const TEXT_FRAME_END: u8 = 0xFF;

/// Decode a `Sec-WebSocket-Key1`/`-Key2` value: concatenated digits divided
/// by the number of spaces.
pub fn decode_challenge_key(value: &str) -> Result<u32, Error> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let spaces = value.chars().filter(|&c| c == ' ').count() as u64;

    if digits.is_empty() || spaces == 0 {
        return Err(Error::InvalidHixieKey);
    }
    let number: u64 = digits.parse().map_err(|_| Error::InvalidHixieKey)?;
    if number % spaces != 0 {
        return Err(Error::InvalidHixieKey);
    }
    let quotient = number / spaces;
    u32::try_from(quotient).map_err(|_| Error::InvalidHixieKey)
}

/// MD5 over key1, key2 (big-endian) and the 8-byte Key3 body.
pub fn challenge_response(key1: u32, key2: u32, key3: &[u8; 8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(key1.to_be_bytes());
    hasher.update(key2.to_be_bytes());
    hasher.update(key3);
    hasher.finalize().into()
}

/// Wrap a UTF-8 payload in the `\x00 … \xFF` text framing.
pub fn frame_text(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(TEXT_FRAME_START);
    out.extend_from_slice(payload);
    out.push(TEXT_FRAME_END);
    out
}

/// The `\xFF\x00` closing handshake frame.
pub fn close_frame() -> [u8; 2] {
    [0xFF, 0x00]
}

#[derive(Debug)]
pub enum HixieOutput {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Text,
    /// Saw 0xFF outside a text frame; a 0x00 completes the close handshake.
    Closing,
}

/// Incremental parser for the Hixie-76 data stream.
pub struct HixieProcessor {
    state: State,
    payload: Vec<u8>,
    validator: Utf8Validator,
    max_message_size: usize,
}

impl HixieProcessor {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: State::Idle,
            payload: Vec::new(),
            validator: Utf8Validator::new(),
            max_message_size,
        }
    }

    pub fn consume(&mut self, input: &[u8], out: &mut Vec<HixieOutput>) -> Result<usize, Error> {
        for (i, &byte) in input.iter().enumerate() {
            match self.state {
                State::Idle => match byte {
                    TEXT_FRAME_START => {
                        self.payload.clear();
                        self.validator.reset();
                        self.state = State::Text;
                    }
                    TEXT_FRAME_END => self.state = State::Closing,
                    // Length-prefixed binary framing was never deployed.
                    _ => return Err(Error::ReservedOpcode(byte)),
                },
                State::Text => {
                    if byte == TEXT_FRAME_END {
                        if !self.validator.complete() {
                            return Err(Error::InvalidUtf8Payload);
                        }
                        let payload = std::mem::take(&mut self.payload);
                        out.push(HixieOutput::Text(String::from_utf8(payload)?));
                        self.state = State::Idle;
                    } else {
                        if self.validator.consume(byte) == UTF8_REJECT {
                            return Err(Error::InvalidUtf8Payload);
                        }
                        if self.payload.len() >= self.max_message_size {
                            return Err(Error::MessageTooBig);
                        }
                        self.payload.push(byte);
                    }
                }
                State::Closing => {
                    if byte != TEXT_FRAME_START {
                        return Err(Error::InvalidClosePayload);
                    }
                    out.push(HixieOutput::Close);
                    self.state = State::Idle;
                    return Ok(i + 1);
                }
            }
        }
        Ok(input.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keys from the draft-76 handshake example.
    const KEY1: &str = "4 @1  46546xW%0l 1 5";
    const KEY2: &str = "12998 5 Y3 1  .P00";

    #[test]
    fn decodes_draft_example_keys() {
        // 4146546015 digits over 5 spaces, 1299853100 over 5.
        assert_eq!(decode_challenge_key(KEY1).unwrap(), 829_309_203);
        assert_eq!(decode_challenge_key(KEY2).unwrap(), 259_970_620);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(decode_challenge_key("no digits here").is_err());
        assert!(decode_challenge_key("123456").is_err()); // no spaces
    }

    #[test]
    fn challenge_matches_draft_example() {
        let key1 = decode_challenge_key(KEY1).unwrap();
        let key2 = decode_challenge_key(KEY2).unwrap();
        let digest = challenge_response(key1, key2, b"^n:ds[4U");
        assert_eq!(&digest, b"8jKS'y:G*Co,Wxa-");
    }

    #[test]
    fn text_framing_round_trip() {
        let framed = frame_text("hello".as_bytes());
        assert_eq!(framed[0], 0x00);
        assert_eq!(*framed.last().unwrap(), 0xFF);

        let mut processor = HixieProcessor::new(1024);
        let mut out = Vec::new();
        processor.consume(&framed, &mut out).unwrap();
        assert!(matches!(&out[0], HixieOutput::Text(t) if t == "hello"));
    }

    #[test]
    fn split_frames_reassemble() {
        let framed = frame_text("héllo".as_bytes());
        let mut processor = HixieProcessor::new(1024);
        let mut out = Vec::new();
        for &byte in &framed {
            processor.consume(&[byte], &mut out).unwrap();
        }
        assert!(matches!(&out[0], HixieOutput::Text(t) if t == "héllo"));
    }

    #[test]
    fn close_sequence() {
        let mut processor = HixieProcessor::new(1024);
        let mut out = Vec::new();
        let consumed = processor.consume(&close_frame(), &mut out).unwrap();
        assert_eq!(consumed, 2);
        assert!(matches!(out[0], HixieOutput::Close));
    }

    #[test]
    fn invalid_utf8_fails_immediately() {
        let mut processor = HixieProcessor::new(1024);
        let mut out = Vec::new();
        assert!(matches!(
            processor.consume(&[0x00, 0xC3, 0x28], &mut out),
            Err(Error::InvalidUtf8Payload)
        ));
    }

    #[test]
    fn oversize_message_rejected() {
        let mut processor = HixieProcessor::new(4);
        let mut out = Vec::new();
        let framed = frame_text(b"toolong");
        assert!(matches!(
            processor.consume(&framed, &mut out),
            Err(Error::MessageTooBig)
        ));
    }
}
