// zlib / brotli wrappers for compressed frame bodies

use super::{Frame, FrameError, OpCode, PayloadKind};
use std::io::{Read, Write};

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;

/// Expand a frame into the frames it carries.
///
/// Compressed bodies hold a concatenation of complete frames; anything else is
/// returned as a single-element batch, unchanged.
pub fn decompress(frame: Frame) -> Result<Vec<Frame>, FrameError> {
    let raw = match frame.payload_kind {
        PayloadKind::ZlibCompressed => inflate_zlib(&frame.body)?,
        PayloadKind::BrotliCompressed => inflate_brotli(&frame.body)?,
        _ => return Ok(vec![frame]),
    };

    Frame::decode_continuous(&raw)
}

/// Wrap already-encoded frames in one compressed `Message` frame.
///
/// The remote side produces these; the local side only needs it to build
/// fixtures and replay captured traffic.
pub fn pack(frames: &[Frame], kind: PayloadKind) -> Result<Frame, FrameError> {
    let raw: Vec<u8> = frames.iter().flat_map(Frame::encode).collect();

    let body = match kind {
        PayloadKind::ZlibCompressed => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&raw)
                .map_err(|e| FrameError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| FrameError::Compression(e.to_string()))?
        }
        PayloadKind::BrotliCompressed => {
            let mut out = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
                writer
                    .write_all(&raw)
                    .map_err(|e| FrameError::Compression(e.to_string()))?;
            }
            out
        }
        other => {
            return Err(FrameError::Compression(format!(
                "{:?} is not a compressed payload kind",
                other
            )))
        }
    };

    Ok(Frame::new(OpCode::Message, kind, body))
}

fn inflate_zlib(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Decompression(format!("zlib: {}", e)))?;
    Ok(out)
}

fn inflate_brotli(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, BROTLI_BUFFER)
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Decompression(format!("brotli: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Frame {
        Frame::new(OpCode::Message, PayloadKind::PlainJson, text.as_bytes().to_vec())
    }

    #[test]
    fn test_plain_frame_passes_through() {
        let frame = message(r#"{"cmd":"DANMU_MSG"}"#);
        let out = decompress(frame.clone()).unwrap();
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_int32_frame_passes_through() {
        let frame = Frame::new(
            OpCode::HeartbeatResponse,
            PayloadKind::Int32,
            4200i32.to_be_bytes().to_vec(),
        );
        assert_eq!(decompress(frame.clone()).unwrap(), vec![frame]);
    }

    #[test]
    fn test_zlib_unpacks_inner_frames() {
        let inner = vec![message(r#"{"cmd":"A"}"#), message(r#"{"cmd":"B"}"#)];
        let packed = pack(&inner, PayloadKind::ZlibCompressed).unwrap();
        assert_eq!(packed.payload_kind, PayloadKind::ZlibCompressed);

        assert_eq!(decompress(packed).unwrap(), inner);
    }

    #[test]
    fn test_brotli_unpacks_inner_frames() {
        let inner: Vec<Frame> = (0..5)
            .map(|i| message(&format!(r#"{{"cmd":"DANMU_MSG","i":{}}}"#, i)))
            .collect();
        let packed = pack(&inner, PayloadKind::BrotliCompressed).unwrap();

        assert_eq!(decompress(packed).unwrap(), inner);
    }

    #[test]
    fn test_empty_compressed_body_yields_no_frames() {
        let packed = pack(&[], PayloadKind::ZlibCompressed).unwrap();
        assert!(decompress(packed).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_zlib_body() {
        let frame = Frame::new(
            OpCode::Message,
            PayloadKind::ZlibCompressed,
            b"definitely not zlib".to_vec(),
        );
        assert!(matches!(
            decompress(frame),
            Err(FrameError::Decompression(_))
        ));
    }

    #[test]
    fn test_pack_rejects_plain_kind() {
        assert!(pack(&[], PayloadKind::PlainJson).is_err());
    }
}
