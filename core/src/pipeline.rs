// Pipeline: wires receiver, history and broadcast together
//
// remote bytes -> receiver -> Envelope -> dispatcher -> { history, hub }
//
// Constructed once at process start; every component gets its collaborators
// handed in explicitly.

use crate::command::{AppCommand, Command, Envelope};
use crate::config::{ConfigError, ConfigStore};
use crate::gift::GiftCache;
use crate::history::{HistoryError, HistoryLog, HistoryWriter};
use crate::receiver::{CompanionHook, ReceiverHandle};
use crate::server::{self, BroadcastHub, ServerError, ServerHandle, DEFAULT_BACKLOG};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

pub struct PipelineOptions {
    /// Open the upstream connection right away
    pub connect_on_start: bool,
    /// Start the subscriber server on the configured host/port
    pub serve: bool,
    /// Companion-view hook for `autoOpenWhenConnect`
    pub companion: Option<CompanionHook>,
    /// Per-subscriber backlog before a slow subscriber is dropped
    pub backlog: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            connect_on_start: true,
            serve: true,
            companion: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

pub struct Pipeline {
    receiver: ReceiverHandle,
    hub: Arc<BroadcastHub>,
    server: Option<ServerHandle>,
    history_path: Option<PathBuf>,
    sink: mpsc::UnboundedSender<Envelope>,
    dispatcher: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Pipeline {
    /// Build and start every component. Must be called inside a tokio runtime.
    pub fn start(
        config: Arc<ConfigStore>,
        gifts: GiftCache,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let history_config = config.history();
        let history = if history_config.enabled {
            let dir = config.snapshot().history_dir()?;
            let log = HistoryLog::open(dir, history_config.max_file_bytes())?;
            Some(HistoryWriter::spawn(log))
        } else {
            info!("History recording disabled");
            None
        };
        let history_path = history.as_ref().map(HistoryWriter::active_path);

        // Replay follows recording: no history, nothing to replay
        let hub = Arc::new(BroadcastHub::new(
            config.clone(),
            gifts.clone(),
            history.is_some(),
            options.backlog,
        ));

        let server = if options.serve {
            Some(server::start(hub.clone(), config.server_addr()?)?)
        } else {
            None
        };

        let (sink, envelopes) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(envelopes, hub.clone(), history));
        let watcher = tokio::spawn(watch_snapshots(config.clone(), gifts, sink.clone()));

        let receiver = ReceiverHandle::spawn(config, sink.clone(), options.companion);
        if options.connect_on_start {
            receiver.open();
        }

        Ok(Self {
            receiver,
            hub,
            server,
            history_path,
            sink,
            dispatcher,
            watcher,
        })
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Active history file at session start
    pub fn history_path(&self) -> Option<&PathBuf> {
        self.history_path.as_ref()
    }

    pub fn open(&self) {
        self.receiver.open();
    }

    pub fn close(&self) {
        self.receiver.close();
    }

    /// Emit a locally synthesized command through history and broadcast.
    pub fn emit(&self, command: Command) {
        let _ = self.sink.send(Envelope::new(command));
    }

    /// Close the receiver, drain and flush history, then stop the server and
    /// close every subscriber.
    pub async fn shutdown(self) {
        let Pipeline {
            receiver,
            server,
            sink,
            dispatcher,
            watcher,
            ..
        } = self;

        watcher.abort();
        let _ = watcher.await;

        receiver.shutdown().await;

        // Subscribers still get the final status before their sockets close
        drop(sink);
        let _ = dispatcher.await;

        if let Some(server) = server {
            server.stop();
        }
        info!("Pipeline stopped");
    }
}

async fn dispatch(
    mut envelopes: mpsc::UnboundedReceiver<Envelope>,
    hub: Arc<BroadcastHub>,
    history: Option<HistoryWriter>,
) {
    while let Some(envelope) = envelopes.recv().await {
        if let Some(history) = &history {
            history.append(envelope.clone());
        }
        let reached = hub.publish_envelope(&envelope);
        debug!(
            "Dispatched {} to {} subscribers",
            envelope.message.kind().unwrap_or("?"),
            reached
        );
    }

    if let Some(history) = history {
        history.shutdown().await;
    }
}

/// Push config and gift-table changes to subscribers.
async fn watch_snapshots(
    config: Arc<ConfigStore>,
    gifts: GiftCache,
    sink: mpsc::UnboundedSender<Envelope>,
) {
    let mut config_rx = config.subscribe();
    let mut gift_rx = gifts.subscribe();
    config_rx.mark_unchanged();
    gift_rx.mark_unchanged();

    loop {
        let command = tokio::select! {
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = config_rx.borrow_and_update().clone();
                Command::App(AppCommand::ConfigUpdate(snapshot))
            }
            changed = gift_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = gift_rx.borrow_and_update().clone();
                Command::App(AppCommand::GiftConfigUpdate(snapshot))
            }
        };

        if sink.send(Envelope::new(command)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ConnectionState;
    use crate::config::Config;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn offline_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.history.directory = Some(dir.to_path_buf());
        config
    }

    fn offline_options() -> PipelineOptions {
        PipelineOptions {
            connect_on_start: false,
            serve: false,
            ..PipelineOptions::default()
        }
    }

    async fn next_inner_cmd(live: &mut tokio::sync::broadcast::Receiver<Arc<str>>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), live.recv())
            .await
            .expect("timed out")
            .expect("closed");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_config_change_is_broadcast_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(offline_config(dir.path())));
        let pipeline = Pipeline::start(store.clone(), GiftCache::new(), offline_options()).unwrap();
        let mut live = pipeline.hub().subscribe().live;

        store.set_roomid(42).unwrap();

        let value = next_inner_cmd(&mut live).await;
        assert_eq!(value["data"]["cmd"], "configUpdate");
        assert_eq!(value["data"]["data"]["danmuReceiver"]["roomid"], 42);

        let path = pipeline.history_path().unwrap().clone();
        pipeline.shutdown().await;

        let logged = HistoryLog::read(&path).unwrap();
        assert!(logged.iter().all(|e| !e.message.is_config_update()));
    }

    #[tokio::test]
    async fn test_gift_change_is_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(offline_config(dir.path())));
        let gifts = GiftCache::new();
        let pipeline = Pipeline::start(store, gifts.clone(), offline_options()).unwrap();
        let mut live = pipeline.hub().subscribe().live;

        gifts.replace(json!({"1": {"name": "辣条"}}));

        let value = next_inner_cmd(&mut live).await;
        assert_eq!(value["data"]["cmd"], "giftConfigUpdate");
        assert_eq!(value["data"]["data"]["1"]["name"], "辣条");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_reaches_history_and_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(offline_config(dir.path())));
        let pipeline = Pipeline::start(store, GiftCache::new(), offline_options()).unwrap();
        let mut live = pipeline.hub().subscribe().live;

        pipeline.emit(Command::Upstream(json!({"cmd": "DANMU_MSG", "info": []})));

        let value = next_inner_cmd(&mut live).await;
        assert_eq!(value["cmd"], "biliBiliCommand");

        let path = pipeline.history_path().unwrap().clone();
        pipeline.shutdown().await;

        let logged = HistoryLog::read(&path).unwrap();
        assert!(logged
            .iter()
            .any(|e| e.message.kind() == Some("DANMU_MSG")));
    }

    #[tokio::test]
    async fn test_history_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config(dir.path());
        config.history.enabled = false;
        let pipeline = Pipeline::start(
            Arc::new(ConfigStore::new(config)),
            GiftCache::new(),
            offline_options(),
        )
        .unwrap();

        assert!(pipeline.history_path().is_none());
        assert_eq!(pipeline.hub().connection_state(), ConnectionState::Closed);
        pipeline.shutdown().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
