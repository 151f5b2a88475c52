//! Bridge configuration.
//!
//! Config file parsing lives with the embedding application; this module
//! only defines the resolved settings the core consumes and the coherence
//! rules between them.

use std::time::Duration;

use url::Url;

use crate::error::BridgeError;

/// Default timeout for a delegated task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_millis(300_000);
/// Default timeout for a context request.
pub const DEFAULT_CONTEXT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Which sides of the bridge this instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Accepts connections; `listen` is required.
    Host,
    /// Dials out; `connect` is required.
    Client,
    /// Either or both.
    Peer,
}

impl std::fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Client => write!(f, "client"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

/// Settings for the accepting side.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

/// Settings for the dialing side.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Full URL; takes precedence over `host` + `port`.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            reconnect: true,
            reconnect_interval: Duration::from_millis(1_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectConfig {
    /// Resolve the dial target. `url` wins; otherwise `ws://host:port`.
    /// The result must parse as a `ws://` or `wss://` URL.
    pub fn endpoint(&self) -> Result<String, BridgeError> {
        let raw = if let Some(url) = &self.url {
            url.clone()
        } else {
            match (&self.host, self.port) {
                (Some(host), Some(port)) => format!("ws://{host}:{port}"),
                _ => {
                    return Err(BridgeError::InvalidConfiguration {
                        message: "connect requires either url or host + port".to_string(),
                    });
                }
            }
        };
        let parsed = Url::parse(&raw).map_err(|e| BridgeError::InvalidConfiguration {
            message: format!("connect url {raw:?} is not a valid URL: {e}"),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(BridgeError::InvalidConfiguration {
                message: format!(
                    "connect url {raw:?} must use the ws:// or wss:// scheme"
                ),
            });
        }
        Ok(raw)
    }
}

/// Periodic context broadcast settings.
#[derive(Debug, Clone)]
pub struct ContextSharingConfig {
    pub auto_sync: bool,
    pub sync_interval: Duration,
}

impl Default for ContextSharingConfig {
    fn default() -> Self {
        Self {
            auto_sync: false,
            sync_interval: Duration::from_secs(5),
        }
    }
}

/// Resolved settings for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// Included as `source` in every outgoing envelope.
    pub instance_name: String,
    pub listen: Option<ListenConfig>,
    pub connect: Option<ConnectConfig>,
    pub task_timeout: Duration,
    pub context_sharing: ContextSharingConfig,
}

impl BridgeConfig {
    pub fn new(mode: BridgeMode, instance_name: impl Into<String>) -> Self {
        Self {
            mode,
            instance_name: instance_name.into(),
            listen: None,
            connect: None,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            context_sharing: ContextSharingConfig::default(),
        }
    }

    pub fn with_listen(mut self, listen: ListenConfig) -> Self {
        self.listen = Some(listen);
        self
    }

    pub fn with_connect(mut self, connect: ConnectConfig) -> Self {
        self.connect = Some(connect);
        self
    }

    /// Check mode/section coherence. Called by `Bridge::new`.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.instance_name.trim().is_empty() {
            return Err(BridgeError::InvalidConfiguration {
                message: "instanceName must not be empty".to_string(),
            });
        }
        match self.mode {
            BridgeMode::Host => {
                if self.listen.is_none() {
                    return Err(BridgeError::InvalidConfiguration {
                        message: "host mode requires a listen section".to_string(),
                    });
                }
            }
            BridgeMode::Client => {
                if self.connect.is_none() {
                    return Err(BridgeError::InvalidConfiguration {
                        message: "client mode requires a connect section".to_string(),
                    });
                }
            }
            BridgeMode::Peer => {
                if self.listen.is_none() && self.connect.is_none() {
                    return Err(BridgeError::InvalidConfiguration {
                        message: "peer mode requires listen, connect, or both".to_string(),
                    });
                }
            }
        }
        if let Some(connect) = &self.connect {
            connect.endpoint()?;
        }
        Ok(())
    }
}
