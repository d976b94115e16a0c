// danmuhub core: live comment ingestion and local broadcast
//
// Upstream binary frames come in over one WebSocket, are interpreted into
// Commands, recorded to rotating `.cdtch` history files and fanned out to
// every local subscriber.

pub mod command;
pub mod config;
pub mod gift;
pub mod history;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod server;

pub use command::{AppCommand, Command, ConnectionState, Envelope};
pub use config::{Config, ConfigError, ConfigStore};
pub use gift::GiftCache;
pub use history::{HistoryError, HistoryLog, HistoryWriter};
pub use pipeline::{Pipeline, PipelineError, PipelineOptions};
pub use protocol::{Frame, FrameError, OpCode, PayloadKind};
pub use receiver::{CompanionHook, ReceiverHandle};
pub use server::{BroadcastHub, ServerError};
