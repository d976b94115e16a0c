// Upstream Frame: length-prefixed packet header + body

use super::FrameError;

/// One protocol message exchanged with the upstream feed.
///
/// Format (big-endian, 16 byte header):
/// [4 bytes] total_length  - header + body
/// [2 bytes] header_length - always 16 for the current protocol
/// [2 bytes] payload_kind
/// [4 bytes] op_code
/// [4 bytes] sequence_id   - always 1 outbound
/// [N bytes] body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub total_length: u32,
    pub header_length: u16,
    pub payload_kind: PayloadKind,
    pub op_code: OpCode,
    pub sequence_id: u32,
    pub body: Vec<u8>,
}

/// Body encoding declared by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// UTF-8 JSON text (0)
    PlainJson,
    /// Uncompressed binary / plain body used by heartbeat and join replies (1)
    Int32,
    /// zlib-deflated concatenation of frames (2)
    ZlibCompressed,
    /// brotli-compressed concatenation of frames (3)
    BrotliCompressed,
    /// Anything the protocol does not define; kept so the frame round-trips
    Other(u16),
}

impl PayloadKind {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => PayloadKind::PlainJson,
            1 => PayloadKind::Int32,
            2 => PayloadKind::ZlibCompressed,
            3 => PayloadKind::BrotliCompressed,
            other => PayloadKind::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            PayloadKind::PlainJson => 0,
            PayloadKind::Int32 => 1,
            PayloadKind::ZlibCompressed => 2,
            PayloadKind::BrotliCompressed => 3,
            PayloadKind::Other(v) => *v,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            PayloadKind::ZlibCompressed | PayloadKind::BrotliCompressed
        )
    }
}

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Client keep-alive (2)
    Heartbeat,
    /// Server reply carrying the activity metric (3)
    HeartbeatResponse,
    /// Server push of one upstream command (5)
    Message,
    /// Client room join / auth (7)
    Join,
    /// Server reply to a join (8)
    JoinResponse,
    /// Undefined op code, reported rather than rejected at decode time
    Other(u32),
}

impl OpCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            2 => OpCode::Heartbeat,
            3 => OpCode::HeartbeatResponse,
            5 => OpCode::Message,
            7 => OpCode::Join,
            8 => OpCode::JoinResponse,
            other => OpCode::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            OpCode::Heartbeat => 2,
            OpCode::HeartbeatResponse => 3,
            OpCode::Message => 5,
            OpCode::Join => 7,
            OpCode::JoinResponse => 8,
            OpCode::Other(v) => *v,
        }
    }
}

impl Frame {
    /// Fixed header size for the current protocol version
    pub const HEADER_LENGTH: u16 = 16;

    /// Sequence id written on every outbound frame
    pub const DEFAULT_SEQUENCE: u32 = 1;

    /// Build a frame with the standard header around `body`.
    pub fn new(op_code: OpCode, payload_kind: PayloadKind, body: Vec<u8>) -> Self {
        Self {
            total_length: Self::HEADER_LENGTH as u32 + body.len() as u32,
            header_length: Self::HEADER_LENGTH,
            payload_kind,
            op_code,
            sequence_id: Self::DEFAULT_SEQUENCE,
            body,
        }
    }

    /// Zero-length keep-alive
    pub fn heartbeat() -> Self {
        Self::new(OpCode::Heartbeat, PayloadKind::Int32, Vec::new())
    }

    /// Serialize frame to bytes. Total: never fails.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_length as usize + self.body.len());

        buf.extend_from_slice(&self.total_length.to_be_bytes());
        buf.extend_from_slice(&self.header_length.to_be_bytes());
        buf.extend_from_slice(&self.payload_kind.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.op_code.as_u32().to_be_bytes());
        buf.extend_from_slice(&self.sequence_id.to_be_bytes());

        // Header fields beyond the fixed 16 bytes are zero-filled
        let pad = (self.header_length as usize).saturating_sub(Self::HEADER_LENGTH as usize);
        buf.resize(buf.len() + pad, 0);

        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode one frame starting at `offset`.
    ///
    /// Returns the frame and the number of bytes it occupied.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize), FrameError> {
        let available = data.len().saturating_sub(offset);
        let header_len = Self::HEADER_LENGTH as usize;

        if available < header_len {
            return Err(FrameError::MalformedFrame {
                declared: header_len,
                available,
            });
        }

        let buf = &data[offset..];
        let total_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let header_length = u16::from_be_bytes([buf[4], buf[5]]);
        let payload_kind = PayloadKind::from_u16(u16::from_be_bytes([buf[6], buf[7]]));
        let op_code = OpCode::from_u32(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]));
        let sequence_id = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let total = total_length as usize;
        if total > available {
            return Err(FrameError::MalformedFrame {
                declared: total,
                available,
            });
        }

        // A header that claims to be longer than the whole frame (or shorter
        // than the fixed fields) cannot be split into header + body.
        if (header_length as usize) < header_len || header_length as usize > total {
            return Err(FrameError::MalformedFrame {
                declared: header_length as usize,
                available: total,
            });
        }

        let body = buf[header_length as usize..total].to_vec();

        Ok((
            Frame {
                total_length,
                header_length,
                payload_kind,
                op_code,
                sequence_id,
                body,
            },
            total,
        ))
    }

    /// Decode back-to-back frames until the buffer is exhausted.
    pub fn decode_continuous(data: &[u8]) -> Result<Vec<Self>, FrameError> {
        match Self::decode_prefix(data) {
            (frames, None) => Ok(frames),
            (_, Some(err)) => Err(err),
        }
    }

    /// Decode as many whole frames as the buffer holds.
    ///
    /// Frames before a bad offset are kept; the error describes the
    /// undecodable tail.
    pub fn decode_prefix(data: &[u8]) -> (Vec<Self>, Option<FrameError>) {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match Self::decode(data, offset) {
                Ok((frame, consumed)) => {
                    frames.push(frame);
                    offset += consumed;
                }
                Err(FrameError::MalformedFrame { .. }) => {
                    let err = FrameError::MalformedStream {
                        offset,
                        remaining: data.len() - offset,
                    };
                    return (frames, Some(err));
                }
                Err(other) => return (frames, Some(other)),
            }
        }

        (frames, None)
    }

    /// Body interpreted as UTF-8 text, if it is valid.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}
