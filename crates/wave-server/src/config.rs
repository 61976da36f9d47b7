use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wave_protocol::AuthKey;
use wave_pubsub::BrokerConfig;
use wave_rpc::EndpointConfig;

use crate::error::{ServerError, ServerResult};

/// Environment variable that overrides [`ServerConfig::auth_key`].
pub const AUTH_KEY_ENV: &str = "WAVE_AUTH_KEY";

pub const SOCKET_FILE_NAME: &str = "wave.sock";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    /// Domain socket to listen on. Unset means `<data_dir>/wave.sock`; an
    /// empty path disables the listener.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Websocket and HTTP health listener.
    pub ws_bind_addr: SocketAddr,
    pub enable_stdio: bool,
    /// Hex-encoded 32-byte token key. A random key is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    pub default_call_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub event_history_capacity: usize,
    /// Distinct event names with retained history.
    pub event_history_names: usize,
    pub outgoing_queue_capacity: usize,
    pub stream_buffer: usize,
    /// Unread items an outgoing stream may hold before it is cancelled.
    pub stream_backlog: usize,
    pub max_connections: usize,
    pub background_workers: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".wave"),
            socket_path: None,
            ws_bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            enable_stdio: false,
            auth_key: None,
            default_call_timeout_ms: 5000,
            handler_timeout_ms: 2000,
            event_history_capacity: 128,
            event_history_names: 256,
            outgoing_queue_capacity: 256,
            stream_buffer: 4,
            stream_backlog: 1024,
            max_connections: 256,
            background_workers: 8,
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> ServerResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(AUTH_KEY_ENV) {
            if !key.trim().is_empty() {
                self.auth_key = Some(key.trim().to_string());
            }
        }
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        match &self.socket_path {
            Some(p) if p.as_os_str().is_empty() => None,
            Some(p) => Some(p.clone()),
            None => Some(self.data_dir.join(SOCKET_FILE_NAME)),
        }
    }

    /// The configured key, or a fresh random one.
    pub fn resolve_auth_key(&self) -> ServerResult<AuthKey> {
        match &self.auth_key {
            Some(hex) => AuthKey::from_hex(hex)
                .map_err(|e| ServerError::Config(format!("auth_key: {e}"))),
            None => Ok(AuthKey::generate()),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            history_capacity: self.event_history_capacity,
            history_names: self.event_history_names,
        }
    }

    pub fn endpoint_config(&self, name: impl Into<String>) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            outgoing_capacity: self.outgoing_queue_capacity,
            stream_buffer: self.stream_buffer,
            stream_backlog: self.stream_backlog,
            default_timeout: Duration::from_millis(self.default_call_timeout_ms),
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            trusted: false,
        }
    }

    pub fn validate(&self) -> ServerResult<()> {
        let positive = [
            ("handler_timeout_ms", self.handler_timeout_ms as usize),
            ("default_call_timeout_ms", self.default_call_timeout_ms as usize),
            ("outgoing_queue_capacity", self.outgoing_queue_capacity),
            ("stream_buffer", self.stream_buffer),
            ("stream_backlog", self.stream_backlog),
            ("max_connections", self.max_connections),
            ("background_workers", self.background_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ServerError::Config(format!("{name} must be greater than zero")));
            }
        }
        self.resolve_auth_key().map(|_| ())
    }
}
