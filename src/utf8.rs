// UTF-8 DFA from Bjoern Hoehrmann, http://bjoern.hoehrmann.de/utf-8/decoder/dfa/

pub const UTF8_ACCEPT: u32 = 0;
pub const UTF8_REJECT: u32 = 1;

#[rustfmt::skip]
const UTF8_DFA: [u8; 400] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 00..1f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 20..3f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 40..5f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 60..7f
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9, // 80..9f
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, // a0..bf
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2, // c0..df
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3,                                 // e0..ef
    11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,                                 // f0..ff
    0,1,2,3,5,8,7,1,1,1,4,6,1,1,1,1,                                  // s0..s0
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,0,1,1,1,1,1,0,1,0,1,1,1,1,1,1, // s1..s2
    1,2,1,1,1,1,1,2,1,2,1,1,1,1,1,1,1,1,1,1,1,1,1,2,1,1,1,1,1,1,1,1, // s3..s4
    1,2,1,1,1,1,1,1,1,2,1,1,1,1,1,1,1,1,1,1,1,1,1,3,1,3,1,1,1,1,1,1, // s5..s6
    1,3,1,1,1,1,1,3,1,3,1,1,1,1,1,1,1,3,1,1,1,1,1,1,1,1,1,1,1,1,1,1, // s7..s8
];

/// Streaming UTF-8 validator.
///
/// Bytes are fed as they arrive off the wire; once the DFA hits
/// [`UTF8_REJECT`] it stays there, so a bad sequence is caught without
/// waiting for the rest of the message.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    state: u32,
    codepoint: u32,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self {
            state: UTF8_ACCEPT,
            codepoint: 0,
        }
    }

    /// Advance the DFA by one byte and return the new state.
    pub fn consume(&mut self, byte: u8) -> u32 {
        let kind = u32::from(UTF8_DFA[byte as usize]);

        self.codepoint = if self.state != UTF8_ACCEPT {
            (u32::from(byte) & 0x3f) | (self.codepoint << 6)
        } else {
            (0xff >> kind) & u32::from(byte)
        };

        self.state = u32::from(UTF8_DFA[(256 + self.state * 16 + kind) as usize]);
        self.state
    }

    /// Feed a whole slice; false as soon as an invalid sequence appears.
    pub fn decode(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            if self.consume(byte) == UTF8_REJECT {
                return false;
            }
        }
        true
    }

    /// True only when no multi-byte sequence is left dangling.
    pub fn complete(&self) -> bool {
        self.state == UTF8_ACCEPT
    }

    pub fn rejected(&self) -> bool {
        self.state == UTF8_REJECT
    }

    pub fn reset(&mut self) {
        self.state = UTF8_ACCEPT;
        self.codepoint = 0;
    }
}

/// Validate a complete byte string in one go.
pub fn validate(bytes: &[u8]) -> bool {
    let mut v = Utf8Validator::new();
    v.decode(bytes) && v.complete()
}
