// Receiver driver: executes ReceiverMachine actions against a real socket
//
// One task owns the machine, the socket link and both timers. Socket and timer
// tasks report back over a single event channel, tagged with the session they
// were started for; the machine discards anything from a superseded session.

use super::interpret::interpret_message;
use super::machine::{Action, Input, ReceiverMachine, ReconnectPolicy, SessionId};
use crate::command::{Command, Envelope};
use crate::config::ConfigStore;
use crate::protocol::{Frame, JoinRequest};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Hook fired with the room id when the connection opens and
/// `danmuViewConfig.autoOpenWhenConnect` is set.
pub type CompanionHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug)]
enum Control {
    Open,
    Close,
    Shutdown,
}

#[derive(Debug)]
enum Event {
    Opened(SessionId),
    Data(SessionId, Vec<u8>),
    Closed {
        session: SessionId,
        code: Option<u16>,
        error: Option<String>,
    },
    HeartbeatDue(SessionId),
    ReconnectDue(SessionId),
}

#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Control surface of a running receiver.
pub struct ReceiverHandle {
    ctl: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Start the receiver task. It stays `Closed` until `open()`.
    ///
    /// Every command it produces is wrapped in an `Envelope` and sent to `sink`.
    pub fn spawn(
        config: Arc<ConfigStore>,
        sink: mpsc::UnboundedSender<Envelope>,
        companion: Option<CompanionHook>,
    ) -> Self {
        let (ctl, ctl_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let receiver = config.receiver();
        let driver = Driver {
            machine: ReceiverMachine::new(
                ReconnectPolicy::from(&receiver),
                config.auto_open_when_connect(),
            ),
            config,
            sink,
            companion,
            events_tx,
            socket: None,
            heartbeat: None,
            reconnect: None,
        };

        let task = tokio::spawn(driver.run(ctl_rx, events_rx));
        Self { ctl, task }
    }

    /// (Re)connect using the current configuration.
    pub fn open(&self) {
        let _ = self.ctl.send(Control::Open);
    }

    pub fn close(&self) {
        let _ = self.ctl.send(Control::Close);
    }

    /// Close the connection and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.ctl.send(Control::Shutdown);
        if let Err(e) = self.task.await {
            error!("Receiver task failed: {}", e);
        }
    }
}

struct SocketLink {
    session: SessionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct Driver {
    machine: ReceiverMachine,
    config: Arc<ConfigStore>,
    sink: mpsc::UnboundedSender<Envelope>,
    companion: Option<CompanionHook>,
    events_tx: mpsc::UnboundedSender<Event>,
    socket: Option<SocketLink>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut ctl_rx: mpsc::UnboundedReceiver<Control>,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => match ctl {
                    Some(Control::Open) => {
                        let receiver = self.config.receiver();
                        self.machine.set_policy(ReconnectPolicy::from(&receiver));
                        self.machine.set_auto_open(self.config.auto_open_when_connect());
                        info!("Opening upstream {} for room {}", receiver.url(), receiver.roomid);
                        self.apply(Input::Open);
                    }
                    Some(Control::Close) => self.apply(Input::Close),
                    Some(Control::Shutdown) | None => {
                        self.apply(Input::Close);
                        break;
                    }
                },
                Some(event) = events_rx.recv() => self.on_event(event),
            }
        }

        // Timers are already cancelled by the close above
        debug!("Receiver task stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Data(session, bytes) => {
                if session != self.machine.session() {
                    debug!("Dropping {} bytes from stale session {}", bytes.len(), session);
                    return;
                }
                for command in interpret_message(&bytes) {
                    self.emit(command);
                }
            }
            Event::Opened(session) => self.apply(Input::SocketOpened(session)),
            Event::Closed {
                session,
                code,
                error,
            } => self.apply(Input::SocketClosed {
                session,
                code,
                error,
            }),
            Event::HeartbeatDue(session) => self.apply(Input::HeartbeatDue(session)),
            Event::ReconnectDue(session) => self.apply(Input::ReconnectDue(session)),
        }
    }

    fn apply(&mut self, input: Input) {
        for action in self.machine.handle(input) {
            self.execute(action);
        }
    }

    fn emit(&self, command: Command) {
        if self.sink.send(Envelope::new(command)).is_err() {
            debug!("Envelope sink closed");
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Connect(session) => {
                let receiver = self.config.receiver();
                let join = JoinRequest {
                    roomid: receiver.roomid,
                    protover: receiver.protocol_version,
                    platform: receiver.platform.clone(),
                }
                .to_frame()
                .encode();

                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                tokio::spawn(run_socket(
                    session,
                    receiver.url(),
                    join,
                    outbound_rx,
                    self.events_tx.clone(),
                ));
                self.socket = Some(SocketLink { session, outbound });
            }
            Action::StartHeartbeat(session) => {
                abort(&mut self.heartbeat);
                let period = self.config.heartbeat_interval();
                let events = self.events_tx.clone();
                self.heartbeat = Some(tokio::spawn(async move {
                    let mut ticker =
                        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    loop {
                        ticker.tick().await;
                        if events.send(Event::HeartbeatDue(session)).is_err() {
                            break;
                        }
                    }
                }));
            }
            Action::StopHeartbeat => abort(&mut self.heartbeat),
            Action::CloseSocket => {
                if let Some(link) = self.socket.take() {
                    debug!("Closing socket of session {}", link.session);
                    let _ = link.outbound.send(Outbound::Close);
                }
            }
            Action::ScheduleReconnect { session, delay } => {
                abort(&mut self.reconnect);
                self.reconnect = Some(spawn_reconnect(session, delay, self.events_tx.clone()));
            }
            Action::CancelReconnect => abort(&mut self.reconnect),
            Action::SendHeartbeat => {
                if let Some(link) = &self.socket {
                    let _ = link.outbound.send(Outbound::Frame(Frame::heartbeat().encode()));
                }
            }
            Action::Emit(command) => self.emit(command),
            Action::AutoOpenCompanion => {
                if let Some(hook) = &self.companion {
                    hook(self.config.roomid());
                }
            }
        }
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(task) = handle.take() {
        task.abort();
    }
}

fn spawn_reconnect(
    session: SessionId,
    delay: Duration,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(Event::ReconnectDue(session));
    })
}

/// Own one upstream WebSocket for the lifetime of `session`.
///
/// Reports exactly one of: nothing (closed on request), or `Closed` after
/// `Opened`/connect failure.
async fn run_socket(
    session: SessionId,
    url: String,
    join: Vec<u8>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
) {
    let closed = |code: Option<u16>, error: Option<String>| Event::Closed {
        session,
        code,
        error,
    };

    let stream = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((stream, _)) => stream,
            Err(e) => {
                let _ = events.send(closed(None, Some(format!("connect {}: {}", url, e))));
                return;
            }
        },
        _ = outbound.recv() => {
            debug!("Session {} closed before connecting", session);
            return;
        }
    };

    let (mut write, mut read) = stream.split();

    if let Err(e) = write.send(Message::Binary(join)).await {
        let _ = events.send(closed(None, Some(format!("join: {}", e))));
        return;
    }
    let _ = events.send(Event::Opened(session));

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        let _ = events.send(closed(None, Some(e.to_string())));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(Event::Data(session, data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = events.send(closed(code, None));
                    return;
                }
                Some(Ok(other)) => {
                    debug!("Ignoring non-binary upstream message: {:?}", other);
                }
                Some(Err(e)) => {
                    warn!("Upstream read error: {}", e);
                    let _ = events.send(closed(None, Some(e.to_string())));
                    return;
                }
                None => {
                    let _ = events.send(closed(None, Some("stream ended".to_string())));
                    return;
                }
            },
        }
    }
}
