//! Configuration for the remote log service.
//!
//! Values are merged in order:
//! 1. Built-in defaults
//! 2. `remote-log.toml` (or an explicit file)
//! 3. Environment variables (`REMOTE_LOG_*` prefix, `__` between sections)
//!
//! ```toml
//! [server]
//! port = 12345
//! bind_host = "127.0.0.1"
//! header = "Tracker gateway"
//!
//! [buffer]
//! capacity = 24000
//! retain_floor = 16000
//! ```
//!
//! ```bash
//! REMOTE_LOG_SERVER__PORT=9000
//! REMOTE_LOG_LOGGING__LEVEL=debug
//! ```

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::log_buffer::{DEFAULT_CAPACITY, DEFAULT_RETAIN_FLOOR};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "remote-log.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "REMOTE_LOG_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLogConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local interface to bind; all interfaces when absent.
    #[serde(default)]
    pub bind_host: Option<String>,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Banner sent when a viewer connects.
    #[serde(default)]
    pub header: Option<String>,

    /// Interactive prompt written before each request.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Maximum time between packets (0 = none).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum time from first byte to packet completion (0 = none).
    #[serde(default = "default_packet_timeout_secs")]
    pub packet_timeout_secs: u64,

    /// Maximum total session duration (0 = none).
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Longest accepted command line.
    #[serde(default = "default_max_packet_length")]
    pub max_packet_length: usize,
}

/// Log cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Hard byte ceiling.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Bytes kept after an eviction.
    #[serde(default = "default_retain_floor")]
    pub retain_floor: usize,
}

/// Process logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror log output to stderr as well as the cache.
    #[serde(default = "default_true")]
    pub stderr: bool,
}

const fn default_port() -> u16 {
    12345
}
fn default_prompt() -> String {
    ">> ".to_string()
}
const fn default_idle_timeout_secs() -> u64 {
    600
}
const fn default_packet_timeout_secs() -> u64 {
    600
}
const fn default_session_timeout_secs() -> u64 {
    1200
}
const fn default_max_packet_length() -> usize {
    1000
}
const fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
const fn default_retain_floor() -> usize {
    DEFAULT_RETAIN_FLOOR
}
fn default_log_level() -> String {
    "info".to_string()
}
const fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            port: default_port(),
            header: None,
            prompt: default_prompt(),
            idle_timeout_secs: default_idle_timeout_secs(),
            packet_timeout_secs: default_packet_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            max_packet_length: default_max_packet_length(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            retain_floor: DEFAULT_RETAIN_FLOOR,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: true,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl ServerConfig {
    /// Idle timeout, if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        secs(self.idle_timeout_secs)
    }

    /// Packet timeout, if enabled.
    #[must_use]
    pub fn packet_timeout(&self) -> Option<Duration> {
        secs(self.packet_timeout_secs)
    }

    /// Session timeout, if enabled.
    #[must_use]
    pub fn session_timeout(&self) -> Option<Duration> {
        secs(self.session_timeout_secs)
    }
}

impl RemoteLogConfig {
    /// Load from `remote-log.toml` in the working directory plus environment.
    ///
    /// # Errors
    /// Returns error if a source cannot be parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_file(CONFIG_FILE)
    }

    /// Load from a specific file plus environment. A missing file is skipped.
    ///
    /// # Errors
    /// Returns error if a source cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = RemoteLogConfig::default();
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.server.prompt, ">> ");
        assert_eq!(config.server.idle_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.server.session_timeout(), Some(Duration::from_secs(1200)));
        assert_eq!(config.buffer.capacity, 24_000);
        assert_eq!(config.buffer.retain_floor, 16_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = RemoteLogConfig::load()?;
            assert_eq!(config, RemoteLogConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [server]
                port = 4000
                header = "gateway"
                packet_timeout_secs = 0

                [buffer]
                capacity = 1000
                "#,
            )?;
            jail.set_env("REMOTE_LOG_SERVER__PORT", "4100");
            jail.set_env("REMOTE_LOG_LOGGING__LEVEL", "debug");

            let config = RemoteLogConfig::load()?;
            assert_eq!(config.server.port, 4100);
            assert_eq!(config.server.header.as_deref(), Some("gateway"));
            assert_eq!(config.server.packet_timeout(), None);
            assert_eq!(config.buffer.capacity, 1000);
            assert_eq!(config.buffer.retain_floor, DEFAULT_RETAIN_FLOOR);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }
}
