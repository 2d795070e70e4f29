//! # Configuration
//!
//! Settings for the `meshsync` binary and for the [`ConnectionManager`](crate::connection::ConnectionManager)
//! it drives. The file is TOML; every section and every key has a default, so an empty file
//! (or a partial one) is valid.
//!
//! ```toml
//! [connection]
//! target = "/dev/ttyUSB0"     # or "tcp://meshtastic.local" / "10.0.0.5:4403"
//! baud_rate = 115200
//! dtr = true
//! rts = false
//!
//! [timeouts]
//! open_timeout_ms = 3000
//! configure_timeout_ms = 3000
//! commit_ack_timeout_ms = 10000
//! send_ack_timeout_ms = 30000
//! heartbeat_secs = 30
//!
//! [reconnect]
//! open_attempts = 3
//! backoff_ms = [500, 1000, 2000]
//!
//! [codec]
//! max_frame_len = 512
//! outbound_queue = 64
//!
//! [logging]
//! level = "info"
//! file = "meshsync.log"
//! ```
//!
//! ```rust,no_run
//! use meshsync::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("meshsync.toml").await?;
//!     let config = Config::load("meshsync.toml").await?;
//!     println!("Target: {}", config.connection.target);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::meshtastic::framer::DEFAULT_MAX_FRAME_LEN;
use crate::transport::TransportTarget;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port name or network address of the radio
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Assert DTR after opening a serial port
    #[serde(default = "default_true")]
    pub dtr: bool,
    #[serde(default)]
    pub rts: bool,
}

fn default_target() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            baud_rate: default_baud_rate(),
            dtr: true,
            rts: false,
        }
    }
}

impl ConnectionConfig {
    pub fn transport_target(&self) -> TransportTarget {
        self.target_for(&self.target)
    }

    /// Target for `name` using this section's serial line settings.
    pub fn target_for(&self, name: &str) -> TransportTarget {
        TransportTarget::parse(name, self.baud_rate, self.dtr, self.rts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Time allowed between want-config and config-complete
    #[serde(default = "default_configure_timeout_ms")]
    pub configure_timeout_ms: u64,
    /// Deadline for the acknowledgement of each commit write
    #[serde(default = "default_commit_ack_timeout_ms")]
    pub commit_ack_timeout_ms: u64,
    /// Deadline for text, waypoint and owner acknowledgements
    #[serde(default = "default_send_ack_timeout_ms")]
    pub send_ack_timeout_ms: u64,
    /// 0 disables the heartbeat
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_open_timeout_ms() -> u64 {
    3000
}

fn default_configure_timeout_ms() -> u64 {
    3000
}

fn default_commit_ack_timeout_ms() -> u64 {
    10_000
}

fn default_send_ack_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            configure_timeout_ms: default_configure_timeout_ms(),
            commit_ack_timeout_ms: default_commit_ack_timeout_ms(),
            send_ack_timeout_ms: default_send_ack_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts at opening the transport within one connect
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    /// Delay before each retry; the last entry repeats
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
}

fn default_open_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000]
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            open_attempts: default_open_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(retry)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_outbound_queue() -> usize {
    64
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.codec.max_frame_len == 0 || self.codec.max_frame_len > u16::MAX as usize {
            return Err(anyhow!(
                "codec.max_frame_len must be between 1 and {}",
                u16::MAX
            ));
        }
        if self.codec.outbound_queue == 0 {
            return Err(anyhow!("codec.outbound_queue must be at least 1"));
        }
        if self.reconnect.open_attempts == 0 {
            return Err(anyhow!("reconnect.open_attempts must be at least 1"));
        }
        if self.timeouts.commit_ack_timeout_ms == 0 || self.timeouts.configure_timeout_ms == 0 {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        Ok(())
    }
}
