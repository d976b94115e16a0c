// Upstream connection state machine: pure inputs -> actions, no I/O

use crate::command::{Command, ConnectionState};
use crate::config::ReceiverConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identity of one connection attempt. Every `open` (explicit or reconnect)
/// and every `close` moves to a new session; socket and timer callbacks
/// carry the session they were created under and are ignored once stale.
pub type SessionId = u64;

/// Reconnection rules, read from `danmuReceiver` at each explicit open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` = unbounded
    pub max_attempts: Option<u32>,
    pub delay: Duration,
    pub no_reconnect_codes: Vec<u16>,
}

impl From<&ReceiverConfig> for ReconnectPolicy {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            enabled: config.auto_reconnect,
            max_attempts: u32::try_from(config.max_reconnect_count).ok(),
            delay: Duration::from_millis(config.reconnect_delay_ms),
            no_reconnect_codes: config.no_reconnect_codes.clone(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReceiverConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Explicit open request
    Open,
    /// Explicit close request
    Close,
    SocketOpened(SessionId),
    SocketClosed {
        session: SessionId,
        code: Option<u16>,
        error: Option<String>,
    },
    HeartbeatDue(SessionId),
    ReconnectDue(SessionId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Dial the upstream and send the join frame first
    Connect(SessionId),
    StartHeartbeat(SessionId),
    StopHeartbeat,
    CloseSocket,
    ScheduleReconnect { session: SessionId, delay: Duration },
    CancelReconnect,
    SendHeartbeat,
    Emit(Command),
    /// Companion view hook, fired once per successful open
    AutoOpenCompanion,
}

#[derive(Debug)]
pub struct ReceiverMachine {
    state: ConnectionState,
    session: SessionId,
    reconnect_count: u32,
    policy: ReconnectPolicy,
    auto_open: bool,
    socket_live: bool,
    reconnect_pending: Option<SessionId>,
}

impl ReceiverMachine {
    pub fn new(policy: ReconnectPolicy, auto_open: bool) -> Self {
        Self {
            state: ConnectionState::Closed,
            session: 0,
            reconnect_count: 0,
            policy,
            auto_open,
            socket_live: false,
            reconnect_pending: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Takes effect from the next failure onwards
    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    pub fn set_auto_open(&mut self, auto_open: bool) {
        self.auto_open = auto_open;
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Open => {
                self.reconnect_count = 0;
                self.begin_session()
            }
            Input::Close => self.close(),
            Input::SocketOpened(session) => self.on_open(session),
            Input::SocketClosed {
                session,
                code,
                error,
            } => self.on_closed(session, code, error),
            Input::HeartbeatDue(session) => {
                if session == self.session && self.state == ConnectionState::Open {
                    vec![Action::SendHeartbeat]
                } else {
                    Vec::new()
                }
            }
            Input::ReconnectDue(session) => {
                if self.reconnect_pending == Some(session) && session == self.session {
                    info!("Reconnect attempt {}", self.reconnect_count);
                    self.begin_session()
                } else {
                    debug!("Stale reconnect timer for session {}", session);
                    Vec::new()
                }
            }
        }
    }

    fn teardown(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::StopHeartbeat, Action::CancelReconnect];
        self.reconnect_pending = None;
        if self.socket_live {
            actions.push(Action::CloseSocket);
            self.socket_live = false;
        }
        actions
    }

    fn begin_session(&mut self) -> Vec<Action> {
        let mut actions = self.teardown();
        self.session += 1;
        self.state = ConnectionState::Connecting;
        self.socket_live = true;

        actions.push(Action::Connect(self.session));
        actions.push(Action::StartHeartbeat(self.session));
        actions.push(Action::Emit(Command::status(ConnectionState::Connecting)));
        actions
    }

    fn close(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Closed && !self.socket_live {
            return Vec::new();
        }

        let mut actions = self.teardown();
        self.session += 1;
        self.state = ConnectionState::Closed;
        actions.push(Action::Emit(Command::status(ConnectionState::Closed)));
        actions
    }

    fn on_open(&mut self, session: SessionId) -> Vec<Action> {
        if session != self.session || self.state != ConnectionState::Connecting {
            debug!("Ignoring open event from stale session {}", session);
            return Vec::new();
        }

        self.state = ConnectionState::Open;
        self.reconnect_count = 0;

        let mut actions = vec![Action::Emit(Command::status(ConnectionState::Open))];
        if self.auto_open {
            actions.push(Action::AutoOpenCompanion);
        }
        actions
    }

    fn on_closed(
        &mut self,
        session: SessionId,
        code: Option<u16>,
        error: Option<String>,
    ) -> Vec<Action> {
        if session != self.session || !self.socket_live {
            debug!("Ignoring close event from stale session {}", session);
            return Vec::new();
        }

        self.socket_live = false;
        let mut actions = vec![Action::StopHeartbeat];

        if let Some(code) = code.filter(|c| self.policy.no_reconnect_codes.contains(c)) {
            info!("Upstream closed with non-retryable code {}", code);
            self.state = ConnectionState::Closed;
            actions.push(Action::Emit(Command::status_with_detail(
                ConnectionState::Closed,
                format!("close code {}", code),
            )));
            return actions;
        }

        match &error {
            Some(reason) => {
                warn!("Upstream socket error: {}", reason);
                self.state = ConnectionState::Error;
                actions.push(Action::Emit(Command::status_with_detail(
                    ConnectionState::Error,
                    reason.clone(),
                )));
            }
            None => {
                info!("Upstream closed (code {:?})", code);
                actions.push(Action::Emit(match code {
                    Some(code) => Command::status_with_detail(
                        ConnectionState::Closed,
                        format!("close code {}", code),
                    ),
                    None => Command::status(ConnectionState::Closed),
                }));
            }
        }

        if !self.policy.enabled {
            self.state = ConnectionState::Closed;
            return actions;
        }

        self.state = ConnectionState::Reconnecting;

        let within_bound = self
            .policy
            .max_attempts
            .map_or(true, |max| self.reconnect_count < max);

        if within_bound {
            self.reconnect_count += 1;
            actions.push(Action::Emit(Command::status_with_detail(
                ConnectionState::Reconnecting,
                format!("attempt {}", self.reconnect_count),
            )));
            self.reconnect_pending = Some(self.session);
            actions.push(Action::ScheduleReconnect {
                session: self.session,
                delay: self.policy.delay,
            });
        } else {
            warn!(
                "Reconnect limit reached after {} attempts",
                self.reconnect_count
            );
            actions.push(Action::Emit(Command::status_with_detail(
                ConnectionState::Reconnecting,
                format!("gave up after {} attempts", self.reconnect_count),
            )));
        }

        actions
    }
}
