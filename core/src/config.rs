// Configuration management for danmuhub
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/danmuhub/config.json
// - Linux: ~/.config/danmuhub/config.json
// - Windows: %APPDATA%\danmuhub\config.json

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine {0} directory")]
    NoDirectory(&'static str),
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Upstream feed connection settings
    pub danmu_receiver: ReceiverConfig,

    /// Viewer behaviour hooks
    pub danmu_view_config: ViewConfig,

    /// Listen host for the local subscriber server
    pub http_server_host: String,

    /// Listen port for the local subscriber server
    pub http_server_port: u16,

    /// History log settings
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverConfig {
    /// Room to join
    pub roomid: u64,

    /// Upstream host
    pub host: String,

    /// Upstream port
    pub port: u16,

    /// WebSocket path on the upstream host
    pub path: String,

    /// Use wss:// instead of ws://
    pub secure: bool,

    /// `protover` sent in the join body
    pub protocol_version: u32,

    /// `platform` sent in the join body
    pub platform: String,

    /// Heartbeat period in seconds
    #[serde(rename = "heartBeatInterval")]
    pub heartbeat_interval: u64,

    /// Reconnect after a socket error / remote close
    pub auto_reconnect: bool,

    /// Reconnect attempt bound, -1 for unbounded
    pub max_reconnect_count: i64,

    /// Delay before each reconnect attempt in milliseconds
    pub reconnect_delay_ms: u64,

    /// Close codes that end the session without a retry
    pub no_reconnect_codes: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewConfig {
    /// Fire the companion-view hook once the upstream connection opens
    pub auto_open_when_connect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    /// Record envelopes to disk
    pub enabled: bool,

    /// History directory, defaults to `<data_dir>/danmuhub/history`
    pub directory: Option<PathBuf>,

    /// Rotate once the active file exceeds this size
    pub max_file_size_mb: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            danmu_receiver: ReceiverConfig::default(),
            danmu_view_config: ViewConfig::default(),
            http_server_host: "127.0.0.1".to_string(),
            http_server_port: 8081,
            history: HistoryConfig::default(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            roomid: 0,
            host: "broadcastlv.chat.bilibili.com".to_string(),
            port: 443,
            path: "/sub".to_string(),
            secure: true,
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            platform: "web".to_string(),
            heartbeat_interval: 30,
            auto_reconnect: true,
            max_reconnect_count: -1,
            reconnect_delay_ms: 1000,
            no_reconnect_codes: Vec::new(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            max_file_size_mb: None,
        }
    }
}

impl ReceiverConfig {
    /// Full upstream WebSocket URL
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

impl HistoryConfig {
    /// Rotation threshold in bytes
    pub fn max_file_bytes(&self) -> Option<u64> {
        self.max_file_size_mb
            .filter(|mb| *mb > 0.0)
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoDirectory("config"))?
            .join("danmuhub");

        std::fs::create_dir_all(&config_dir)?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        let data_dir = dirs::data_local_dir()
            .ok_or(ConfigError::NoDirectory("data"))?
            .join("danmuhub");

        std::fs::create_dir_all(&data_dir)?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from `path`, or create default if not exists
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Resolved history directory
    pub fn history_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.history.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::data_dir()?.join("history")),
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.danmu_receiver.heartbeat_interval == 0 {
            return Err(ConfigError::Invalid(
                "heartBeatInterval must be > 0".to_string(),
            ));
        }
        if self.danmu_receiver.max_reconnect_count < -1 {
            return Err(ConfigError::Invalid(
                "maxReconnectCount must be -1 or >= 0".to_string(),
            ));
        }
        if self.http_server_host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "httpServerHost is not an IP address: {}",
                self.http_server_host
            )));
        }
        Ok(())
    }
}

// ============================================================================
// CONFIG STORE: shared, observable view over one Config
// ============================================================================

/// Long-lived owner of the active configuration.
///
/// Readers take typed snapshots; writers go through `update`, which validates,
/// autosaves (when file-backed) and notifies every `subscribe()` receiver.
pub struct ConfigStore {
    current: RwLock<Config>,
    path: Option<PathBuf>,
    changes: watch::Sender<Config>,
}

impl ConfigStore {
    /// In-memory store, never written to disk
    pub fn new(config: Config) -> Self {
        let (changes, _) = watch::channel(config.clone());
        Self {
            current: RwLock::new(config),
            path: None,
            changes,
        }
    }

    /// Store backed by `path`, created with defaults if missing
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let config = Config::load_from(&path)?;
        let (changes, _) = watch::channel(config.clone());
        Ok(Self {
            current: RwLock::new(config),
            path: Some(path),
            changes,
        })
    }

    /// Store backed by the platform config file
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(Config::config_file()?)
    }

    pub fn snapshot(&self) -> Config {
        self.current.read().clone()
    }

    /// Change notifications; the receiver starts at the current value
    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.changes.subscribe()
    }

    /// Apply `change`, autosave, and notify subscribers.
    ///
    /// An invalid result leaves the stored config untouched.
    pub fn update<F>(&self, change: F) -> Result<Config, ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        let updated = {
            let mut guard = self.current.write();
            let mut candidate = guard.clone();
            change(&mut candidate);
            candidate.validate()?;
            *guard = candidate.clone();
            candidate
        };

        if let Some(path) = &self.path {
            if let Err(e) = updated.save_to(path) {
                warn!("Config autosave to {} failed: {}", path.display(), e);
            }
        }

        debug!("Config updated");
        self.changes.send_replace(updated.clone());
        Ok(updated)
    }

    // --- Typed accessors for the paths the pipeline reads ---

    pub fn receiver(&self) -> ReceiverConfig {
        self.current.read().danmu_receiver.clone()
    }

    pub fn roomid(&self) -> u64 {
        self.current.read().danmu_receiver.roomid
    }

    /// Heartbeat period, never shorter than one second.
    ///
    /// `new` does not validate, so a zero interval can reach here.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.current.read().danmu_receiver.heartbeat_interval.max(1))
    }

    pub fn auto_open_when_connect(&self) -> bool {
        self.current.read().danmu_view_config.auto_open_when_connect
    }

    pub fn history(&self) -> HistoryConfig {
        self.current.read().history.clone()
    }

    /// Listen address of the local subscriber server
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        let guard = self.current.read();
        let ip = guard
            .http_server_host
            .parse::<std::net::IpAddr>()
            .map_err(|e| ConfigError::Invalid(format!("httpServerHost: {}", e)))?;
        Ok(SocketAddr::new(ip, guard.http_server_port))
    }

    pub fn set_roomid(&self, roomid: u64) -> Result<Config, ConfigError> {
        self.update(|c| c.danmu_receiver.roomid = roomid)
    }

    pub fn set_server_port(&self, port: u16) -> Result<Config, ConfigError> {
        self.update(|c| c.http_server_port = port)
    }

    pub fn set_reconnect_policy(
        &self,
        auto_reconnect: bool,
        max_reconnect_count: i64,
    ) -> Result<Config, ConfigError> {
        self.update(|c| {
            c.danmu_receiver.auto_reconnect = auto_reconnect;
            c.danmu_receiver.max_reconnect_count = max_reconnect_count;
        })
    }
}
