//! Configuration loading and persistence.
//!
//! Settings live in `config.json` in the platform config directory. Every
//! section has defaults from [`crate::constants`], and a handful of
//! `BOTSTER_REMOTE_*` environment variables override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::bridge::COMMAND_EVENT;
use crate::constants::{
    CONSUMER_BUFFER_SIZE, DEFAULT_SESSION_DURATION, PUBLISH_MAX_RETRIES, PUBLISH_RETRY_DELAY,
    PUBLISH_TIMEOUT, SESSION_SWEEP_INTERVAL, SHM_OPEN_MAX_ATTEMPTS, SHM_OPEN_RETRY_INTERVAL,
    SHM_POLL_INTERVAL, STREAM_HANDSHAKE_TIMEOUT,
};
use crate::stream::shm::default_region_dir;
use crate::transport::{ConsumerOptions, PublisherOptions};

/// Upper bound on the shared-memory poll interval.
pub const MAX_POLL_INTERVAL_MS: u64 = 5;

/// Inbound command consumer settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Delivery channel capacity.
    pub buffer_size: usize,
    /// Only deliver this event name. Empty accepts all.
    pub event_name: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            buffer_size: CONSUMER_BUFFER_SIZE,
            event_name: COMMAND_EVENT.to_string(),
        }
    }
}

/// Outbound side-effect publisher settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherConfig {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total attempts per publish.
    pub max_retries: u32,
    /// Fixed delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            timeout_ms: PUBLISH_TIMEOUT.as_millis() as u64,
            max_retries: PUBLISH_MAX_RETRIES,
            retry_delay_ms: PUBLISH_RETRY_DELAY.as_millis() as u64,
        }
    }
}

/// Session manager settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a new session in seconds.
    pub default_duration_secs: u64,
    /// How often expired sessions are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: DEFAULT_SESSION_DURATION.as_secs(),
            sweep_interval_secs: SESSION_SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl SessionConfig {
    /// Default session lifetime.
    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_duration_secs)
    }

    /// Expiry sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Daemon event stream settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Daemon Unix socket.
    pub socket_path: PathBuf,
    /// Directory holding shared-memory regions.
    pub region_dir: PathBuf,
    /// Socket handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Shared-memory poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay between attempts to open a region, in milliseconds.
    pub open_retry_ms: u64,
    /// Attempts before giving up on a region.
    pub open_max_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let socket_path = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("botster")
            .join("daemon.sock");
        Self {
            socket_path,
            region_dir: default_region_dir(),
            handshake_timeout_ms: STREAM_HANDSHAKE_TIMEOUT.as_millis() as u64,
            poll_interval_ms: SHM_POLL_INTERVAL.as_millis() as u64,
            open_retry_ms: SHM_OPEN_RETRY_INTERVAL.as_millis() as u64,
            open_max_attempts: SHM_OPEN_MAX_ATTEMPTS,
        }
    }
}

impl StreamConfig {
    /// Socket handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Shared-memory poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay between region open attempts.
    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }
}

/// Configuration for botster-remote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// This device's identifier. Scopes the bus channels.
    pub device_id: String,
    /// Inbound consumer.
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Outbound publisher.
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Sessions.
    #[serde(default)]
    pub session: SessionConfig,
    /// Event streams.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        let device_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        Self {
            device_id,
            consumer: ConsumerConfig::default(),
            publisher: PublisherConfig::default(),
            session: SessionConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/botster-remote-test`
    /// 2. `BOTSTER_REMOTE_CONFIG_DIR` env var
    /// 3. Default: platform config dir joined with `botster-remote`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/botster-remote-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("BOTSTER_REMOTE_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("botster-remote")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("[Config] Ignoring unreadable config file: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Ok(Some(Self::from_json(&content)?))
    }

    /// Parse a config file body. Missing sections take their defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid config.json")
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `BOTSTER_REMOTE_*` overrides from `lookup`. Unparseable values
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device_id) = lookup("BOTSTER_REMOTE_DEVICE_ID") {
            self.device_id = device_id;
        }

        if let Some(timeout) = lookup("BOTSTER_REMOTE_PUBLISH_TIMEOUT") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.publisher.timeout_ms = ms;
            }
        }

        if let Some(retries) = lookup("BOTSTER_REMOTE_PUBLISH_RETRIES") {
            if let Ok(n) = retries.parse::<u32>() {
                self.publisher.max_retries = n;
            }
        }

        if let Some(socket) = lookup("BOTSTER_REMOTE_STREAM_SOCKET") {
            self.stream.socket_path = PathBuf::from(socket);
        }

        if let Some(dir) = lookup("BOTSTER_REMOTE_REGION_DIR") {
            self.stream.region_dir = PathBuf::from(dir);
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            anyhow::bail!("device_id is not set (set BOTSTER_REMOTE_DEVICE_ID)");
        }
        if self.device_id.contains(':') {
            anyhow::bail!("device_id must not contain ':'");
        }
        if self.consumer.buffer_size == 0 {
            anyhow::bail!("consumer.buffer_size must be at least 1");
        }
        if self.publisher.max_retries == 0 {
            anyhow::bail!("publisher.max_retries must be at least 1");
        }
        if self.publisher.timeout_ms == 0 {
            anyhow::bail!("publisher.timeout_ms must be positive");
        }
        if self.stream.poll_interval_ms == 0 || self.stream.poll_interval_ms > MAX_POLL_INTERVAL_MS
        {
            anyhow::bail!(
                "stream.poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}"
            );
        }
        if self.stream.open_max_attempts == 0 {
            anyhow::bail!("stream.open_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Channel this device receives commands on.
    pub fn command_channel(&self) -> String {
        format!("remote-commands:{}", self.device_id)
    }

    /// Channel this device publishes side effects on.
    pub fn events_channel(&self) -> String {
        format!("device-events:{}", self.device_id)
    }

    /// Consumer options for [`command_channel`](Self::command_channel).
    pub fn consumer_options(&self) -> ConsumerOptions {
        let mut options =
            ConsumerOptions::new(self.command_channel()).with_event_name(&self.consumer.event_name);
        options.buffer_size = self.consumer.buffer_size;
        options
    }

    /// Publisher options for [`events_channel`](Self::events_channel).
    pub fn publisher_options(&self) -> PublisherOptions {
        let mut options = PublisherOptions::new(self.events_channel());
        options.publish_timeout = Duration::from_millis(self.publisher.timeout_ms);
        options.max_retries = self.publisher.max_retries;
        options.retry_delay = Duration::from_millis(self.publisher.retry_delay_ms);
        options
    }
}
