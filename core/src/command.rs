//! Command model: the JSON units fanned out to subscribers and logged to history
//!
//! Subscribers see `{ "cmd": "appCommand" | "biliBiliCommand", "data": <inner> }`
//! where the inner value is itself `{ "cmd": <kind>, "data": ... }` for
//! application commands, or the upstream JSON verbatim.

use crate::config::Config;
use crate::protocol::Frame;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Upstream connection state, owned by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A decoded or locally synthesized unit of information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Command {
    #[serde(rename = "appCommand")]
    App(AppCommand),
    /// Upstream event JSON, forwarded untouched
    #[serde(rename = "biliBiliCommand")]
    Upstream(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "camelCase")]
pub enum AppCommand {
    ConfigUpdate(Config),
    GiftConfigUpdate(serde_json::Value),
    StatusUpdate(StatusUpdate),
    ActivityUpdate { activity: i32 },
    JoinResponse { code: i64 },
    ErrorMessage(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A frame (or raw buffer) the receiver could not interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameReport>,
}

/// JSON rendering of a `Frame`, body hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    pub total_length: u32,
    pub header_length: u16,
    pub payload_kind: u16,
    pub op_code: u32,
    pub sequence_id: u32,
    pub body: String,
}

impl From<&Frame> for FrameReport {
    fn from(frame: &Frame) -> Self {
        Self {
            total_length: frame.total_length,
            header_length: frame.header_length,
            payload_kind: frame.payload_kind.as_u16(),
            op_code: frame.op_code.as_u32(),
            sequence_id: frame.sequence_id,
            body: hex::encode(&frame.body),
        }
    }
}

impl Command {
    pub fn status(status: ConnectionState) -> Self {
        Command::App(AppCommand::StatusUpdate(StatusUpdate {
            status,
            detail: None,
        }))
    }

    pub fn status_with_detail(status: ConnectionState, detail: impl Into<String>) -> Self {
        Command::App(AppCommand::StatusUpdate(StatusUpdate {
            status,
            detail: Some(detail.into()),
        }))
    }

    pub fn error(reason: impl Into<String>, frame: Option<&Frame>) -> Self {
        Command::App(AppCommand::ErrorMessage(ErrorReport {
            reason: reason.into(),
            frame: frame.map(FrameReport::from),
        }))
    }

    /// Inner discriminant: the app command kind, or the upstream `cmd` field.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Command::App(app) => Some(app.kind()),
            Command::Upstream(value) => value.get("cmd").and_then(|c| c.as_str()),
        }
    }

    pub fn is_config_update(&self) -> bool {
        matches!(self, Command::App(AppCommand::ConfigUpdate(_)))
    }

    /// Connection state carried by a status update, if this is one.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            Command::App(AppCommand::StatusUpdate(update)) => Some(update.status),
            _ => None,
        }
    }
}

impl AppCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            AppCommand::ConfigUpdate(_) => "configUpdate",
            AppCommand::GiftConfigUpdate(_) => "giftConfigUpdate",
            AppCommand::StatusUpdate(_) => "statusUpdate",
            AppCommand::ActivityUpdate { .. } => "activityUpdate",
            AppCommand::JoinResponse { .. } => "joinResponse",
            AppCommand::ErrorMessage(_) => "errorMessage",
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeTag {
    #[serde(rename = "messageLog")]
    MessageLog,
}

/// Timestamped, uniquely identified wrapper around one emitted Command.
///
/// Built exactly once, by whichever component first produces the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: EnvelopeTag,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub uuid: String,
    pub message: Command,
}

impl Envelope {
    pub fn new(message: Command) -> Self {
        Self {
            cmd: EnvelopeTag::MessageLog,
            timestamp: Utc::now().timestamp_millis(),
            uuid: uuid::Uuid::new_v4().to_string(),
            message,
        }
    }
}
