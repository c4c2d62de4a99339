//! Link configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection and dispatch settings for one controller link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Controller host name or address.
    pub host: String,

    /// Port carrying commands, replies and events.
    pub cmd_evt_port: u16,

    /// Optional separate port carrying telemetry.
    pub telemetry_port: Option<u16>,

    /// Default time allowed for a command to reach a terminal reply.
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Time allowed for the TCP connect.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Telemetry frames buffered per subscriber before the oldest are dropped.
    pub telemetry_capacity: usize,

    /// Telemetry topics to deliver. Empty accepts every topic.
    pub known_telemetry_topics: Vec<String>,

    /// Event names to deliver. Empty accepts every event.
    pub known_events: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            cmd_evt_port: 5000,
            telemetry_port: None,
            command_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            telemetry_capacity: 256,
            known_telemetry_topics: Vec::new(),
            known_events: Vec::new(),
        }
    }
}

impl LinkConfig {
    /// Create a config for `host:cmd_evt_port` with default settings.
    pub fn new(host: impl Into<String>, cmd_evt_port: u16) -> Self {
        Self {
            host: host.into(),
            cmd_evt_port,
            ..Self::default()
        }
    }

    /// Build a config from defaults overridden by environment variables.
    ///
    /// Reads `ATTCPIP_HOST`, `ATTCPIP_CMD_EVT_PORT`, `ATTCPIP_TELEMETRY_PORT`
    /// and `ATTCPIP_COMMAND_TIMEOUT_SECS`. Unparseable values are ignored.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("ATTCPIP_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("ATTCPIP_CMD_EVT_PORT").and_then(|s| s.parse().ok()) {
            config.cmd_evt_port = port;
        }
        if let Some(port) = lookup("ATTCPIP_TELEMETRY_PORT").and_then(|s| s.parse().ok()) {
            config.telemetry_port = Some(port);
        }
        if let Some(secs) = lookup("ATTCPIP_COMMAND_TIMEOUT_SECS").and_then(|s| s.parse::<f64>().ok()) {
            if let Ok(timeout) = Duration::try_from_secs_f64(secs) {
                config.command_timeout = timeout;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file. Missing fields take defaults.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never produce a working link.
    pub fn validate(&self) -> CoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(CoreError::Config("host must not be empty".to_string()));
        }
        if self.cmd_evt_port == 0 {
            return Err(CoreError::Config("cmd_evt_port must not be 0".to_string()));
        }
        if self.telemetry_port == Some(0) {
            return Err(CoreError::Config("telemetry_port must not be 0".to_string()));
        }
        if self.command_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(CoreError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.telemetry_capacity == 0 {
            return Err(CoreError::Config("telemetry_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Durations as fractional seconds.
mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
