//! Gateway configuration
//!
//! Loads listener, handshake and liveness settings from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::gateway::LivenessMode;
use crate::server::TransportConfig;
use crate::socket::SocketConfig;

/// Default configuration file name
pub const CONFIG_FILE: &str = "wsgate.toml";

/// Default upgrade path claimed by the gateway binary
pub const DEFAULT_PATH: &str = "/services";

/// Default transport ping interval (10 seconds)
pub const DEFAULT_PING_INTERVAL_MS: u64 = 10_000;

/// Default protocol ping idle window (60 seconds)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {0}: must be greater than zero")]
    Zero(&'static str),
}

/// Liveness monitor settings as they appear on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LivenessSettings {
    /// Native ping frames on a fixed interval
    TransportPing {
        #[serde(default = "default_ping_interval_ms")]
        interval_ms: u64,
    },
    /// Peer-sent `{"kind":"ping"}` sentinels plus an idle timeout
    ProtocolPing {
        #[serde(default = "default_idle_timeout_ms")]
        idle_timeout_ms: u64,
    },
    /// No probing; connections are only tracked
    Disabled,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self::TransportPing {
            interval_ms: DEFAULT_PING_INTERVAL_MS,
        }
    }
}

impl LivenessSettings {
    /// Convert to the runtime liveness mode
    pub fn mode(&self) -> LivenessMode {
        match *self {
            Self::TransportPing { interval_ms } => LivenessMode::TransportPing {
                interval: Duration::from_millis(interval_ms),
            },
            Self::ProtocolPing { idle_timeout_ms } => LivenessMode::ProtocolPing {
                idle_timeout: Duration::from_millis(idle_timeout_ms),
            },
            Self::Disabled => LivenessMode::Disabled,
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_head_timeout_ms() -> u64 {
    10_000
}

fn default_max_head_bytes() -> usize {
    16 * 1024
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upgrade path claimed by the gateway
    #[serde(default = "default_path")]
    pub path: String,
    /// Time allowed for a client to send its request head
    #[serde(default = "default_head_timeout_ms")]
    pub head_timeout_ms: u64,
    /// Largest request head accepted before replying 431
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
    /// Time allowed for the peer to answer a close frame
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Liveness monitor settings
    #[serde(default)]
    pub liveness: LivenessSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            head_timeout_ms: default_head_timeout_ms(),
            max_head_bytes: default_max_head_bytes(),
            close_timeout_ms: default_close_timeout_ms(),
            liveness: LivenessSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the listener or the liveness monitor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.head_timeout_ms == 0 {
            return Err(ConfigError::Zero("head_timeout_ms"));
        }
        if self.max_head_bytes == 0 {
            return Err(ConfigError::Zero("max_head_bytes"));
        }
        match self.liveness {
            LivenessSettings::TransportPing { interval_ms: 0 } => {
                Err(ConfigError::Zero("liveness.interval_ms"))
            }
            LivenessSettings::ProtocolPing { idle_timeout_ms: 0 } => {
                Err(ConfigError::Zero("liveness.idle_timeout_ms"))
            }
            _ => Ok(()),
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Settings for the transport server
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            head_timeout: Duration::from_millis(self.head_timeout_ms),
            max_head_bytes: self.max_head_bytes,
        }
    }

    /// Settings applied to every accepted socket
    pub fn socket(&self) -> SocketConfig {
        SocketConfig {
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.path, DEFAULT_PATH);
    }

    #[test]
    fn test_load_protocol_ping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
port = 8080
path = "/rpc"

[liveness]
mode = "protocol-ping"
idle_timeout_ms = 5000
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.path, "/rpc");
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(
            config.liveness.mode(),
            LivenessMode::ProtocolPing {
                idle_timeout: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_liveness_defaults_per_mode() {
        let settings: LivenessSettings = toml::from_str(r#"mode = "transport-ping""#).unwrap();
        assert_eq!(
            settings.mode(),
            LivenessMode::TransportPing {
                interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS)
            }
        );

        let settings: LivenessSettings = toml::from_str(r#"mode = "protocol-ping""#).unwrap();
        assert_eq!(
            settings.mode(),
            LivenessMode::ProtocolPing {
                idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS)
            }
        );

        let settings: LivenessSettings = toml::from_str(r#"mode = "disabled""#).unwrap();
        assert_eq!(settings.mode(), LivenessMode::Disabled);
    }

    #[test]
    fn test_load_invalid_mode_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[liveness]\nmode = \"carrier-pigeon\"\n").unwrap();

        let result = GatewayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_zero_interval_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[liveness]\nmode = \"transport-ping\"\ninterval_ms = 0\n").unwrap();

        let result = GatewayConfig::load(&path);
        assert!(matches!(
            result,
            Err(ConfigError::Zero("liveness.interval_ms"))
        ));
    }

    #[test]
    fn test_validate_zero_values() {
        let config = GatewayConfig {
            liveness: LivenessSettings::ProtocolPing { idle_timeout_ms: 0 },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("liveness.idle_timeout_ms"))
        ));

        let config = GatewayConfig {
            max_head_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("max_head_bytes"))));

        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let config = GatewayConfig {
            head_timeout_ms: 250,
            max_head_bytes: 1024,
            close_timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.transport().head_timeout, Duration::from_millis(250));
        assert_eq!(config.transport().max_head_bytes, 1024);
        assert_eq!(config.socket().close_timeout, Duration::from_millis(500));
    }
}
