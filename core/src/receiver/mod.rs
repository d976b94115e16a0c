//! Upstream Receiver: one logical connection to the remote comment feed
//!
//! - machine: Closed/Connecting/Open/Reconnecting/Error transitions, reconnect
//!   bound, non-retryable close codes, session fencing
//! - interpret: frames -> Commands, with per-frame error isolation
//! - driver: tokio task executing machine actions with tokio-tungstenite

pub mod driver;
pub mod interpret;
pub mod machine;

pub use driver::{CompanionHook, ReceiverHandle};
pub use interpret::{interpret_batch, interpret_frame, interpret_message};
pub use machine::{Action, Input, ReceiverMachine, ReconnectPolicy, SessionId};
