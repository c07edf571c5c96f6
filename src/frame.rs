use crate::error::{CloseCode, Error};

pub const MAX_CONTROL_PAYLOAD: usize = 125;
pub const MAX_HEADER_LEN: usize = 14;

const BASIC_HEADER_LEN: usize = 2;
const PAYLOAD_16BIT_CODE: u8 = 126;
const PAYLOAD_64BIT_CODE: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::ReservedOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A complete frame: the unit handed between the processor and the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
        }
    }

    /// Build a close frame payload: 16-bit big-endian code plus UTF-8 reason.
    /// `NO_STATUS` is wired as an empty payload.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let payload = if code == CloseCode::NO_STATUS {
            Vec::new()
        } else {
            let mut buf = Vec::with_capacity(2 + reason.len());
            buf.extend_from_slice(&code.0.to_be_bytes());
            buf.extend_from_slice(reason.as_bytes());
            buf.truncate(MAX_CONTROL_PAYLOAD);
            buf
        };
        Frame::new(true, OpCode::Close, payload)
    }
}

/// Decode a close frame payload into its status code and reason.
pub fn parse_close_payload(payload: &[u8]) -> Result<(CloseCode, String), Error> {
    match payload.len() {
        0 => Ok((CloseCode::NO_STATUS, String::new())),
        1 => Err(Error::InvalidClosePayload),
        _ => {
            let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
            if code.invalid_on_wire() || code.reserved() {
                return Err(Error::InvalidClosePayload);
            }
            let reason = String::from_utf8(payload[2..].to_vec())
                .map_err(|_| Error::InvalidUtf8Payload)?;
            Ok((code, reason))
        }
    }
}

/// Parsed frame header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode_raw: u8,
    pub masked: bool,
    pub mask_key: [u8; 4],
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn data(fin: bool, opcode: OpCode, payload_len: u64) -> Self {
        FrameHeader {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode_raw: opcode.as_u8(),
            masked: false,
            mask_key: [0; 4],
            payload_len,
        }
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.masked = true;
        self.mask_key = key;
        self
    }

    pub fn opcode(&self) -> Result<OpCode, Error> {
        OpCode::from(self.opcode_raw)
    }

    /// Serialize into the minimal 2-14 byte wire form.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut first = (self.fin as u8) << 7 | (self.opcode_raw & 0x0F);
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }
        out.push(first);

        let mask_bit = (self.masked as u8) << 7;
        if self.payload_len <= MAX_CONTROL_PAYLOAD as u64 {
            out.push(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u16::MAX as u64 {
            out.push(mask_bit | PAYLOAD_16BIT_CODE);
            out.extend_from_slice(&(self.payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | PAYLOAD_64BIT_CODE);
            out.extend_from_slice(&self.payload_len.to_be_bytes());
        }

        if self.masked {
            out.extend_from_slice(&self.mask_key);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Waiting for the first two bytes.
    NeedBasic,
    /// Waiting for the extended size and/or masking key.
    NeedExtended,
    Ready,
}

/// Incremental frame header parser.
///
/// Callers feed whatever bytes they have; the codec reports how many it took
/// and whether the header is complete. Field accessors and `validate` are
/// only meaningful once the state is [`HeaderState::Ready`].
#[derive(Debug)]
pub struct HeaderCodec {
    buf: [u8; MAX_HEADER_LEN],
    have: usize,
    needed: usize,
    state: HeaderState,
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_HEADER_LEN],
            have: 0,
            needed: BASIC_HEADER_LEN,
            state: HeaderState::NeedBasic,
        }
    }

    pub fn reset(&mut self) {
        self.have = 0;
        self.needed = BASIC_HEADER_LEN;
        self.state = HeaderState::NeedBasic;
    }

    pub fn state(&self) -> HeaderState {
        self.state
    }

    pub fn bytes_needed(&self) -> usize {
        self.needed
    }

    fn basic_size(&self) -> u8 {
        self.buf[1] & 0x7F
    }

    fn masked(&self) -> bool {
        self.buf[1] & 0x80 != 0
    }

    /// Total header length implied by the basic two bytes.
    fn header_len(&self) -> usize {
        let mut len = BASIC_HEADER_LEN;
        match self.basic_size() {
            PAYLOAD_16BIT_CODE => len += 2,
            PAYLOAD_64BIT_CODE => len += 8,
            _ => {}
        }
        if self.masked() {
            len += 4;
        }
        len
    }

    /// Consume up to `bytes_needed` bytes from `input`; returns how many
    /// bytes were taken and the resulting state.
    pub fn consume(&mut self, input: &[u8]) -> (usize, HeaderState) {
        let mut taken = 0;

        if self.state == HeaderState::NeedBasic {
            let n = self.needed.min(input.len());
            self.buf[self.have..self.have + n].copy_from_slice(&input[..n]);
            self.have += n;
            self.needed -= n;
            taken += n;

            if self.needed == 0 {
                self.needed = self.header_len() - BASIC_HEADER_LEN;
                self.state = if self.needed == 0 {
                    HeaderState::Ready
                } else {
                    HeaderState::NeedExtended
                };
            }
        }

        if self.state == HeaderState::NeedExtended {
            let rest = &input[taken..];
            let n = self.needed.min(rest.len());
            self.buf[self.have..self.have + n].copy_from_slice(&rest[..n]);
            self.have += n;
            self.needed -= n;
            taken += n;

            if self.needed == 0 {
                self.state = HeaderState::Ready;
            }
        }

        (taken, self.state)
    }

    /// Raw payload length from the size fields. Only meaningful once the
    /// state is `Ready`.
    pub(crate) fn payload_len(&self) -> u64 {
        match self.basic_size() {
            PAYLOAD_16BIT_CODE => u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])),
            PAYLOAD_64BIT_CODE => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[2..10]);
                u64::from_be_bytes(bytes)
            }
            basic => u64::from(basic),
        }
    }

    /// Validate a complete header and extract its fields.
    pub fn validate(&self, max_payload: usize) -> Result<FrameHeader, Error> {
        debug_assert_eq!(self.state, HeaderState::Ready);

        let fin = self.buf[0] & 0x80 != 0;
        let rsv1 = self.buf[0] & 0x40 != 0;
        let rsv2 = self.buf[0] & 0x20 != 0;
        let rsv3 = self.buf[0] & 0x10 != 0;
        let opcode_raw = self.buf[0] & 0x0F;

        // No extension is ever negotiated, so any reserved bit is fatal.
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::ReservedBitsNotZero);
        }

        let opcode = OpCode::from(opcode_raw)?;
        let payload_len = self.payload_len();

        if opcode.is_control() {
            if !fin {
                return Err(Error::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::ControlFramePayloadSize);
            }
        }

        match self.basic_size() {
            PAYLOAD_16BIT_CODE => {
                if payload_len <= MAX_CONTROL_PAYLOAD as u64 {
                    return Err(Error::NonMinimalLength);
                }
            }
            PAYLOAD_64BIT_CODE => {
                if payload_len <= u16::MAX as u64 {
                    return Err(Error::NonMinimalLength);
                }
                if payload_len & (1 << 63) != 0 {
                    return Err(Error::JumboPayloadSize);
                }
            }
            _ => {}
        }

        // Control frames are already capped at 125 above; the configured
        // limit applies to data payloads.
        if !opcode.is_control() && payload_len > max_payload as u64 {
            return Err(Error::MessageTooBig);
        }

        let mut mask_key = [0u8; 4];
        if self.masked() {
            let start = self.header_len() - 4;
            mask_key.copy_from_slice(&self.buf[start..start + 4]);
        }

        Ok(FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode_raw,
            masked: self.masked(),
            mask_key,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<FrameHeader, Error> {
        let mut codec = HeaderCodec::new();
        let (taken, state) = codec.consume(bytes);
        assert_eq!(taken, bytes.len());
        assert_eq!(state, HeaderState::Ready);
        codec.validate(usize::MAX)
    }

    #[test]
    fn opcode_round_trip() {
        for byte in [0x0, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(OpCode::from(byte).unwrap().as_u8(), byte);
        }
        for byte in [0x3, 0x7, 0xB, 0xF] {
            assert!(OpCode::from(byte).is_err());
        }
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
    }

    #[test]
    fn basic_header() {
        let header = parse(&[0x81, 0x05]).unwrap();
        assert!(header.fin);
        assert_eq!(header.opcode().unwrap(), OpCode::Text);
        assert!(!header.masked);
        assert_eq!(header.payload_len, 5);
    }

    #[test]
    fn masked_header_with_key() {
        let header = parse(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d]).unwrap();
        assert!(header.masked);
        assert_eq!(header.mask_key, [0x37, 0xfa, 0x21, 0x3d]);
    }

    #[test]
    fn extended_sizes() {
        let header = parse(&[0x82, 126, 0x01, 0x00]).unwrap();
        assert_eq!(header.payload_len, 256);

        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&65536u64.to_be_bytes());
        assert_eq!(parse(&bytes).unwrap().payload_len, 65536);
    }

    #[test]
    fn incremental_consume() {
        let bytes = [0x81u8, 0x85, 0x37, 0xfa, 0x21, 0x3d];
        let mut codec = HeaderCodec::new();
        let (taken, state) = codec.consume(&bytes[..1]);
        assert_eq!((taken, state), (1, HeaderState::NeedBasic));
        let (taken, state) = codec.consume(&bytes[1..3]);
        assert_eq!((taken, state), (2, HeaderState::NeedExtended));
        let (taken, state) = codec.consume(&bytes[3..]);
        assert_eq!((taken, state), (3, HeaderState::Ready));
        assert!(codec.validate(usize::MAX).unwrap().masked);
    }

    #[test]
    fn consume_stops_at_header_boundary() {
        // Two bytes of payload trail the header; they must not be taken.
        let bytes = [0x81u8, 0x02, 0xAA, 0xBB];
        let mut codec = HeaderCodec::new();
        let (taken, state) = codec.consume(&bytes);
        assert_eq!((taken, state), (2, HeaderState::Ready));
    }

    #[test]
    fn rejects_reserved_bits_and_opcodes() {
        assert!(matches!(
            parse(&[0xC1, 0x00]),
            Err(Error::ReservedBitsNotZero)
        ));
        assert!(matches!(parse(&[0x83, 0x00]), Err(Error::ReservedOpcode(3))));
    }

    #[test]
    fn rejects_bad_control_frames() {
        // fin=0 ping
        assert!(matches!(
            parse(&[0x09, 0x00]),
            Err(Error::ControlFrameFragmented)
        ));
        // close with 16-bit length
        assert!(matches!(
            parse(&[0x88, 126, 0x01, 0x00]),
            Err(Error::ControlFramePayloadSize)
        ));
    }

    #[test]
    fn rejects_non_minimal_lengths() {
        assert!(matches!(
            parse(&[0x82, 126, 0x00, 0x7D]),
            Err(Error::NonMinimalLength)
        ));
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&65535u64.to_be_bytes());
        assert!(matches!(parse(&bytes), Err(Error::NonMinimalLength)));

        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(u64::MAX).to_be_bytes());
        assert!(matches!(parse(&bytes), Err(Error::JumboPayloadSize)));
    }

    #[test]
    fn enforces_max_payload() {
        let mut codec = HeaderCodec::new();
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&2048u16.to_be_bytes());
        codec.consume(&bytes);
        assert!(matches!(codec.validate(1024), Err(Error::MessageTooBig)));
    }

    #[test]
    fn serialize_lengths_are_minimal() {
        let mut out = Vec::new();
        FrameHeader::data(true, OpCode::Binary, 125).serialize(&mut out);
        assert_eq!(out.len(), 2);

        out.clear();
        FrameHeader::data(true, OpCode::Binary, 126).serialize(&mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], 126);

        out.clear();
        FrameHeader::data(true, OpCode::Binary, 65535).serialize(&mut out);
        assert_eq!(out.len(), 4);

        out.clear();
        FrameHeader::data(true, OpCode::Binary, 65536).serialize(&mut out);
        assert_eq!(out.len(), 10);
        assert_eq!(out[1], 127);
    }

    #[test]
    fn serialize_parse_round_trip() {
        let cases = [
            FrameHeader::data(true, OpCode::Text, 5),
            FrameHeader::data(false, OpCode::Binary, 300),
            FrameHeader::data(true, OpCode::Close, 2),
            FrameHeader::data(true, OpCode::Binary, 100_000).with_mask([1, 2, 3, 4]),
        ];
        for header in cases {
            let mut out = Vec::new();
            header.serialize(&mut out);
            let parsed = parse(&out).unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn close_payload_parsing() {
        assert_eq!(
            parse_close_payload(&[]).unwrap(),
            (CloseCode::NO_STATUS, String::new())
        );
        assert!(matches!(
            parse_close_payload(&[0x03]),
            Err(Error::InvalidClosePayload)
        ));

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        assert_eq!(
            parse_close_payload(&payload).unwrap(),
            (CloseCode::NORMAL, "bye".to_string())
        );

        // 1005 must never appear on the wire.
        assert!(parse_close_payload(&1005u16.to_be_bytes()).is_err());
        // Reserved range.
        assert!(parse_close_payload(&1004u16.to_be_bytes()).is_err());

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xC3, 0x28]);
        assert!(matches!(
            parse_close_payload(&payload),
            Err(Error::InvalidUtf8Payload)
        ));
    }
}
