//! Broadcast Server: local subscriber fan-out
//!
//! - hub: serialize-once fan-out plus bootstrap snapshots
//! - routes: warp WebSocket endpoint and status API

pub mod hub;
pub mod routes;

pub use hub::{BroadcastHub, Subscription, DEFAULT_BACKLOG};
pub use routes::{start, ServerHandle};

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
