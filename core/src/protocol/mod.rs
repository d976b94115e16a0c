//! Upstream wire protocol: binary packet framing for the live comment feed
//!
//! This module provides:
//! - Frame: 16 byte big-endian header + body, with continuous unpacking
//! - compress: zlib / brotli bodies that expand into further frames
//! - JoinRequest: the first outbound message of every session

pub mod compress;
pub mod frame;

pub use compress::{decompress, pack};
pub use frame::{Frame, OpCode, PayloadKind};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: declared {declared} bytes, {available} available")]
    MalformedFrame { declared: usize, available: usize },

    #[error("Malformed stream: {remaining} trailing bytes at offset {offset}")]
    MalformedStream { offset: usize, remaining: usize },

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Compression failed: {0}")]
    Compression(String),
}

/// Protocol version advertised in the join body (3 = brotli bodies)
pub const PROTOCOL_VERSION: u32 = 3;

/// Body of the `Join` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub roomid: u64,
    pub protover: u32,
    pub platform: String,
}

impl JoinRequest {
    pub fn to_frame(&self) -> Frame {
        // Serializing a struct of plain fields cannot fail
        let body = serde_json::to_vec(self).unwrap_or_default();
        Frame::new(OpCode::Join, PayloadKind::Int32, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_body() {
        let join = JoinRequest {
            roomid: 123,
            protover: PROTOCOL_VERSION,
            platform: "web".to_string(),
        };
        let frame = join.to_frame();

        assert_eq!(frame.op_code, OpCode::Join);
        let parsed: serde_json::Value = serde_json::from_slice(&frame.body).unwrap();
        assert_eq!(parsed["roomid"], 123);
        assert_eq!(parsed["protover"], 3);
        assert_eq!(parsed["platform"], "web");
    }
}
