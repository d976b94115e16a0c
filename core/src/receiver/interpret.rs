// Frame interpretation
//
// Turns upstream frames into Commands. Nothing here fails: a frame that cannot
// be understood becomes an `errorMessage` command and the rest of the batch
// carries on.

use crate::command::{AppCommand, Command};
use crate::protocol::{decompress, Frame, OpCode, PayloadKind};
use tracing::{debug, warn};

/// Interpret one raw socket message (one or more concatenated frames).
///
/// Whole frames ahead of a truncated tail are still interpreted; the tail
/// adds one `errorMessage` at the end.
pub fn interpret_message(data: &[u8]) -> Vec<Command> {
    let (frames, tail) = Frame::decode_prefix(data);
    let mut commands = interpret_batch(frames);
    if let Some(e) = tail {
        warn!("Undecodable upstream message ({} bytes): {}", data.len(), e);
        commands.push(Command::error(format!("undecodable message: {}", e), None));
    }
    commands
}

/// Interpret frames in order, expanding compressed ones.
pub fn interpret_batch(frames: Vec<Frame>) -> Vec<Command> {
    let mut commands = Vec::with_capacity(frames.len());

    for frame in frames {
        let report = frame.clone();
        match decompress(frame) {
            Ok(inner) => commands.extend(inner.iter().map(interpret_frame)),
            Err(e) => {
                warn!("Dropping compressed frame: {}", e);
                commands.push(Command::error(e.to_string(), Some(&report)));
            }
        }
    }

    commands
}

/// Interpret a single, already decompressed frame.
pub fn interpret_frame(frame: &Frame) -> Command {
    match frame.op_code {
        OpCode::HeartbeatResponse => match frame.body.get(..4) {
            Some(bytes) => {
                let activity = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Command::App(AppCommand::ActivityUpdate { activity })
            }
            None => Command::error(
                format!("heartbeat response body too short: {} bytes", frame.body.len()),
                Some(frame),
            ),
        },

        OpCode::JoinResponse => {
            if !matches!(frame.payload_kind, PayloadKind::PlainJson | PayloadKind::Int32) {
                return unsupported_kind(frame);
            }
            match serde_json::from_slice::<serde_json::Value>(&frame.body) {
                Ok(value) => match value.get("code").and_then(|c| c.as_i64()) {
                    Some(code) => {
                        if code != 0 {
                            warn!("Join rejected by upstream with code {}", code);
                        }
                        Command::App(AppCommand::JoinResponse { code })
                    }
                    None => Command::error("join response without code", Some(frame)),
                },
                Err(e) => Command::error(format!("join response is not JSON: {}", e), Some(frame)),
            }
        }

        OpCode::Message => {
            if frame.payload_kind != PayloadKind::PlainJson {
                return unsupported_kind(frame);
            }
            match serde_json::from_slice::<serde_json::Value>(&frame.body) {
                Ok(value) => Command::Upstream(value),
                Err(e) => {
                    debug!("Message body is not JSON: {}", e);
                    Command::error(format!("message body is not JSON: {}", e), Some(frame))
                }
            }
        }

        OpCode::Heartbeat | OpCode::Join => Command::error(
            format!("unexpected client op code {}", frame.op_code.as_u32()),
            Some(frame),
        ),

        OpCode::Other(code) => Command::error(format!("unknown op code {}", code), Some(frame)),
    }
}

fn unsupported_kind(frame: &Frame) -> Command {
    Command::error(
        format!(
            "unsupported payload kind {} for op code {}",
            frame.payload_kind.as_u16(),
            frame.op_code.as_u32()
        ),
        Some(frame),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pack;
    use serde_json::json;

    fn heartbeat_reply(activity: i32) -> Frame {
        Frame::new(
            OpCode::HeartbeatResponse,
            PayloadKind::Int32,
            activity.to_be_bytes().to_vec(),
        )
    }

    fn message(value: serde_json::Value) -> Frame {
        Frame::new(
            OpCode::Message,
            PayloadKind::PlainJson,
            serde_json::to_vec(&value).unwrap(),
        )
    }

    fn is_error(cmd: &Command) -> bool {
        matches!(cmd, Command::App(AppCommand::ErrorMessage(_)))
    }

    #[test]
    fn test_heartbeat_response_activity() {
        assert_eq!(
            interpret_frame(&heartbeat_reply(4200)),
            Command::App(AppCommand::ActivityUpdate { activity: 4200 })
        );
        assert_eq!(
            interpret_frame(&heartbeat_reply(-1)),
            Command::App(AppCommand::ActivityUpdate { activity: -1 })
        );
    }

    #[test]
    fn test_short_heartbeat_response() {
        let frame = Frame::new(OpCode::HeartbeatResponse, PayloadKind::Int32, vec![0, 1]);
        assert!(is_error(&interpret_frame(&frame)));
    }

    #[test]
    fn test_join_response_codes() {
        let ok = Frame::new(OpCode::JoinResponse, PayloadKind::Int32, br#"{"code":0}"#.to_vec());
        let rejected = Frame::new(
            OpCode::JoinResponse,
            PayloadKind::PlainJson,
            br#"{"code":-101}"#.to_vec(),
        );
        assert_eq!(
            interpret_frame(&ok),
            Command::App(AppCommand::JoinResponse { code: 0 })
        );
        assert_eq!(
            interpret_frame(&rejected),
            Command::App(AppCommand::JoinResponse { code: -101 })
        );
    }

    #[test]
    fn test_message_forwarded_verbatim() {
        let body = json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25], "hi", [42, "viewer"]]});
        assert_eq!(interpret_frame(&message(body.clone())), Command::Upstream(body));
    }

    #[test]
    fn test_message_with_wrong_kind() {
        let frame = Frame::new(OpCode::Message, PayloadKind::Int32, b"{}".to_vec());
        assert!(is_error(&interpret_frame(&frame)));
    }

    #[test]
    fn test_malformed_frame_isolation() {
        let batch = vec![
            heartbeat_reply(10),
            Frame::new(OpCode::Other(99), PayloadKind::PlainJson, b"{}".to_vec()),
            message(json!({"cmd": "SEND_GIFT"})),
        ];

        let commands = interpret_batch(batch);
        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            Command::App(AppCommand::ActivityUpdate { activity: 10 })
        );
        assert!(is_error(&commands[1]));
        assert_eq!(commands[2].kind(), Some("SEND_GIFT"));
    }

    #[test]
    fn test_compressed_batch_expands_in_order() {
        let inner = vec![
            message(json!({"cmd": "DANMU_MSG", "n": 1})),
            message(json!({"cmd": "DANMU_MSG", "n": 2})),
        ];
        let packed = pack(&inner, PayloadKind::BrotliCompressed).unwrap();

        let mut raw = heartbeat_reply(7).encode();
        raw.extend_from_slice(&packed.encode());

        let commands = interpret_message(&raw);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1], Command::Upstream(json!({"cmd": "DANMU_MSG", "n": 1})));
        assert_eq!(commands[2], Command::Upstream(json!({"cmd": "DANMU_MSG", "n": 2})));
    }

    #[test]
    fn test_corrupt_compressed_frame_reported() {
        let frame = Frame::new(OpCode::Message, PayloadKind::ZlibCompressed, vec![1, 2, 3]);
        let commands = interpret_batch(vec![frame, heartbeat_reply(1)]);
        assert_eq!(commands.len(), 2);
        assert!(is_error(&commands[0]));
        assert!(!is_error(&commands[1]));
    }

    #[test]
    fn test_frames_before_truncated_tail_survive() {
        let mut raw = heartbeat_reply(5).encode();
        raw.extend_from_slice(&message(json!({"cmd": "DANMU_MSG"})).encode());
        let tail = message(json!({"cmd": "SEND_GIFT"})).encode();
        raw.extend_from_slice(&tail[..tail.len() - 3]);

        let commands = interpret_message(&raw);
        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            Command::App(AppCommand::ActivityUpdate { activity: 5 })
        );
        assert_eq!(commands[1].kind(), Some("DANMU_MSG"));
        assert!(is_error(&commands[2]));
    }

    #[test]
    fn test_truncated_message_degrades_to_error() {
        let raw = message(json!({"cmd": "DANMU_MSG"})).encode();
        let commands = interpret_message(&raw[..raw.len() - 1]);
        assert_eq!(commands.len(), 1);
        assert!(is_error(&commands[0]));
    }
}
