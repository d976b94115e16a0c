use crate::command::{AppCommand, Command, ConnectionState, Envelope};
use crate::config::ConfigStore;
use crate::gift::GiftCache;
use crate::history::is_replayable;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

/// Default per-subscriber backlog before a slow subscriber is dropped
pub const DEFAULT_BACKLOG: usize = 1024;

/// Fan-out point for every emitted command.
///
/// Commands are serialized once and shared by all subscribers. The hub also
/// keeps the read-only snapshots a new subscriber is bootstrapped from,
/// including the session's replayable envelopes.
pub struct BroadcastHub {
    tx: broadcast::Sender<Arc<str>>,
    config: Arc<ConfigStore>,
    gifts: GiftCache,
    state: watch::Sender<ConnectionState>,
    /// Serialized replayable envelopes of this session; `None` disables
    /// replay. Publishing and subscribing both hold this lock.
    replay: Mutex<Option<Vec<String>>>,
}

/// What a freshly accepted subscriber is sent: the bootstrap messages first,
/// then everything arriving on `live`.
pub struct Subscription {
    pub bootstrap: Vec<String>,
    pub live: broadcast::Receiver<Arc<str>>,
}

impl BroadcastHub {
    pub fn new(config: Arc<ConfigStore>, gifts: GiftCache, replay: bool, backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            tx,
            config,
            gifts,
            state,
            replay: Mutex::new(replay.then(Vec::new)),
        }
    }

    /// Send `command` to every connected subscriber.
    ///
    /// Status commands also update the connection state shown to later
    /// subscribers. Returns the number of subscribers reached.
    pub fn publish(&self, command: &Command) -> usize {
        let _replay = self.replay.lock();
        self.send(command)
    }

    /// Publish the payload of an envelope, recording it for replay when its
    /// kind is replayable.
    pub fn publish_envelope(&self, envelope: &Envelope) -> usize {
        let mut replay = self.replay.lock();
        if let Some(entries) = replay.as_mut() {
            if is_replayable(envelope) {
                match serde_json::to_string(envelope) {
                    Ok(text) => entries.push(text),
                    Err(e) => error!("Failed to serialize envelope {}: {}", envelope.uuid, e),
                }
            }
        }
        self.send(&envelope.message)
    }

    fn send(&self, command: &Command) -> usize {
        if let Some(state) = command.connection_state() {
            self.state.send_replace(state);
        }

        let text: Arc<str> = match serde_json::to_string(command) {
            Ok(text) => text.into(),
            Err(e) => {
                error!("Failed to serialize {:?}: {}", command.kind(), e);
                return 0;
            }
        };

        // Err only means nobody is listening
        self.tx.send(text).unwrap_or(0)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Number of envelopes a new subscriber would be replayed.
    pub fn replay_len(&self) -> usize {
        self.replay.lock().as_ref().map_or(0, Vec::len)
    }

    /// Register a subscriber.
    ///
    /// The live receiver and the snapshots are taken under the publish lock,
    /// so every command is either in the bootstrap or on `live`, never both
    /// and never neither.
    pub fn subscribe(&self) -> Subscription {
        let replay = self.replay.lock();
        let live = self.tx.subscribe();

        let mut bootstrap = self.snapshots();
        if let Some(entries) = replay.as_ref() {
            debug!("Replaying {} history envelopes", entries.len());
            bootstrap.extend(entries.iter().cloned());
        }

        Subscription { bootstrap, live }
    }

    /// Config, gift table, then connection state.
    fn snapshots(&self) -> Vec<String> {
        let snapshots = [
            Command::App(AppCommand::ConfigUpdate(self.config.snapshot())),
            Command::App(AppCommand::GiftConfigUpdate(self.gifts.snapshot())),
            Command::status(self.connection_state()),
        ];

        let mut messages = Vec::with_capacity(snapshots.len());
        for command in &snapshots {
            match serde_json::to_string(command) {
                Ok(text) => messages.push(text),
                Err(e) => error!("Failed to serialize bootstrap {:?}: {}", command.kind(), e),
            }
        }
        messages
    }
}
