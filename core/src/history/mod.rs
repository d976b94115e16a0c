//! Command history: append-only `.cdtch` logs of emitted envelopes
//!
//! - HistoryLog: file naming, rotation, newline-delimited JSON append / read
//! - HistoryWriter: background thread owning the log so broadcast never waits
//!   on disk I/O

pub mod log;
pub mod writer;

pub use log::{HistoryLog, HISTORY_EXTENSION};
pub use writer::HistoryWriter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No free history file name after {attempts} attempts")]
    FileNameCollision { attempts: u32 },

    #[error("Refusing to delete the active history file: {0}")]
    ActiveFile(String),
}

/// Upstream command kinds the viewers know how to render.
///
/// Only these are replayed to a newly connected subscriber.
pub const REPLAYABLE_KINDS: &[&str] = &[
    "DANMU_MSG",
    "SEND_GIFT",
    "COMBO_SEND",
    "SUPER_CHAT_MESSAGE",
    "SUPER_CHAT_MESSAGE_DELETE",
    "GUARD_BUY",
    "INTERACT_WORD",
    "ENTRY_EFFECT",
    "WATCHED_CHANGE",
    "LIKE_INFO_V3_UPDATE",
    "ONLINE_RANK_COUNT",
    "ROOM_CHANGE",
    "WARNING",
    "CUT_OFF",
];

/// Whether an envelope belongs in a filtered replay.
///
/// Upstream kinds may carry `:`-separated suffixes (`DANMU_MSG:4:0:2:2:2:0`);
/// the prefix decides. Application commands are never replayed.
pub fn is_replayable(envelope: &crate::command::Envelope) -> bool {
    match &envelope.message {
        crate::command::Command::Upstream(_) => envelope
            .message
            .kind()
            .map(|kind| kind.split(':').next().unwrap_or(kind))
            .map(|base| REPLAYABLE_KINDS.contains(&base))
            .unwrap_or(false),
        crate::command::Command::App(_) => false,
    }
}
