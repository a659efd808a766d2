//! WebSocket frame codec (RFC 6455 §5).
//!
//! A frame on the wire is a 2–14 byte header followed by the payload:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Extended payload length continued, if payload len == 127  |
//! +---------------------------------------------------------------+
//! |                     Masking-key, if MASK set                  |
//! +---------------------------------------------------------------+
//! ```
//!
//! [`Decoder`] consumes a byte stream in arbitrary chunks and yields complete
//! [`Frame`]s with the payload already unmasked; partial frames are retained
//! across calls. [`FrameHeader::encode`] produces header bytes for sending;
//! the caller appends the payload.

use std::fmt;

/// WebSocket frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode from the low nibble of the first header byte.
    ///
    /// Returns `None` for the reserved opcodes 0x3–0x7 and 0xB–0xF.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns true for control frames (close, ping, pong).
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Frame validation error.
///
/// Any of these is fatal for the connection: the peer has violated RFC 6455
/// and the server responds with close code 1002.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// RSV1–3 set without a negotiated extension.
    ReservedBitsSet,
    /// Opcode in one of the reserved ranges.
    ReservedOpCode(u8),
    /// Control frame with `fin == 0` (RFC 6455 §5.5).
    FragmentedControlFrame,
    /// Control frame payload over 125 bytes (RFC 6455 §5.5).
    ControlFrameTooLarge(u64),
    /// 64-bit extended length with the high bit set.
    InvalidLength,
    /// Close frame payload of exactly one byte (must be 0 or >= 2).
    InvalidClosePayloadLength,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedBitsSet => {
                write!(f, "reserved bits must be 0 (no extensions negotiated)")
            }
            Self::ReservedOpCode(op) => write!(f, "reserved opcode 0x{op:X}"),
            Self::FragmentedControlFrame => write!(f, "control frames must not be fragmented"),
            Self::ControlFrameTooLarge(len) => {
                write!(f, "control frame payload of {len} bytes exceeds 125")
            }
            Self::InvalidLength => write!(f, "invalid 64-bit payload length"),
            Self::InvalidClosePayloadLength => {
                write!(f, "close frame payload must be empty or at least 2 bytes")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// A parsed WebSocket frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// Present iff the frame is masked (client-to-server only).
    pub masking_key: Option<[u8; 4]>,
}

impl FrameHeader {
    /// An unfragmented, unmasked frame header, as the server sends.
    pub fn new(opcode: OpCode, payload_len: u64) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload_len,
            masking_key: None,
        }
    }

    /// Whether the MASK bit is set.
    pub fn masked(&self) -> bool {
        self.masking_key.is_some()
    }

    /// Encoded header size in bytes for a given payload length.
    ///
    /// 2, 4 or 10 bytes unmasked; four more with a masking key.
    pub fn encoded_len_for(payload_len: u64, masked: bool) -> usize {
        let ext = if payload_len <= 125 {
            0
        } else if payload_len <= u64::from(u16::MAX) {
            2
        } else {
            8
        };
        2 + ext + if masked { 4 } else { 0 }
    }

    /// Encoded size of this header in bytes.
    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.payload_len, self.masked())
    }

    /// Encode the header. The payload is appended by the caller.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());

        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        out.push(b0);

        let mask_bit = if self.masked() { 0x80 } else { 0x00 };
        if self.payload_len <= 125 {
            out.push(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u64::from(u16::MAX) {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(self.payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&self.payload_len.to_be_bytes());
        }

        if let Some(key) = self.masking_key {
            out.extend_from_slice(&key);
        }

        out
    }
}

/// A complete frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// The outcome of one [`Decoder::decode`] call.
#[derive(Debug)]
pub struct DecodeResult {
    /// Complete frames, in wire order.
    pub frames: Vec<Frame>,
    /// Validation failure, if parsing stopped on a malformed frame.
    ///
    /// Frames decoded before the failure are still present in `frames`.
    pub error: Option<FrameError>,
    /// Bytes retained for the next call (a partial frame).
    pub residual: usize,
}

/// Stateful streaming frame decoder.
///
/// Feed it whatever `recv` produced; a frame split across any number of
/// reads reassembles correctly. After a validation error the decoder is
/// poisoned and yields no further frames.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    poisoned: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `input` and return every frame that is now complete.
    pub fn decode(&mut self, input: &[u8]) -> DecodeResult {
        self.buf.extend_from_slice(input);

        let mut frames = Vec::new();
        let mut error = None;

        while !self.poisoned {
            match self.parse_one() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    self.poisoned = true;
                    error = Some(e);
                }
            }
        }

        DecodeResult {
            frames,
            error,
            residual: self.buf.len(),
        }
    }

    /// Try to parse a single frame off the front of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed.
    fn parse_one(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = (b0 & 0x80) != 0;
        let rsv1 = (b0 & 0x40) != 0;
        let rsv2 = (b0 & 0x20) != 0;
        let rsv3 = (b0 & 0x10) != 0;
        if rsv1 || rsv2 || rsv3 {
            return Err(FrameError::ReservedBitsSet);
        }

        let opcode = OpCode::from_u8(b0).ok_or(FrameError::ReservedOpCode(b0 & 0x0F))?;
        let masked = (b1 & 0x80) != 0;
        let len7 = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if len7 > 125 {
                // 126/127 would already push a control frame past the limit.
                return Err(FrameError::ControlFrameTooLarge(u64::from(len7)));
            }
        }

        let ext_len = match len7 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let payload_len = match len7 {
            126 => u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])),
            127 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(bytes);
                if (len >> 63) != 0 {
                    return Err(FrameError::InvalidLength);
                }
                len
            }
            n => u64::from(n),
        };

        // A length encoded in more bytes than strictly needed is accepted.

        if opcode == OpCode::Close && payload_len == 1 {
            return Err(FrameError::InvalidClosePayloadLength);
        }

        let payload_len_usize =
            usize::try_from(payload_len).map_err(|_| FrameError::InvalidLength)?;
        let total = match header_len.checked_add(payload_len_usize) {
            Some(total) => total,
            None => return Err(FrameError::InvalidLength),
        };
        if self.buf.len() < total {
            return Ok(None);
        }

        let masking_key = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[header_len - 4..header_len]);
            Some(key)
        } else {
            None
        };

        let mut payload = self.buf[header_len..total].to_vec();
        if let Some(key) = masking_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i & 3];
            }
        }
        self.buf.drain(..total);

        Ok(Some(Frame {
            header: FrameHeader {
                fin,
                rsv1,
                rsv2,
                rsv3,
                opcode,
                payload_len,
                masking_key,
            },
            payload,
        }))
    }
}
