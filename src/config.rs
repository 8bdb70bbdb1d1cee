//! Configuration for the command channel.
//!
//! Loaded as JSON from a file or from the `SOCKPUPPET_CONFIG` environment
//! variable. `SOCKPUPPET_PORT` and `SOCKPUPPET_KEY` override the loaded values.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::client::ClientOptions;
use crate::server::ServerOptions;
use crate::transport::{FrameCodec, SharedKey, DEFAULT_MAX_FRAME_SIZE};

/// Top-level configuration shared by client and server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the client connects to and the server binds.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// TCP port. `0` binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base64-encoded 32-byte pre-shared key. There is no built-in default.
    #[serde(default)]
    pub key: Option<String>,

    /// Identifier stamped on every response.
    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_connect_retry")]
    pub connect_retry_millis: u64,

    /// Whole-server idle timeout. `0` disables it.
    #[serde(default = "default_server_idle_timeout")]
    pub server_idle_timeout_seconds: u64,

    /// Per-connection idle timeout. `0` disables it.
    #[serde(default = "default_connection_idle_timeout")]
    pub connection_idle_timeout_seconds: u64,

    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_seconds: u64,

    /// How long a peer gets to drain one reply before its connection is dropped.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            key: None,
            origin: default_origin(),
            connect_timeout_seconds: default_connect_timeout(),
            connect_retry_millis: default_connect_retry(),
            server_idle_timeout_seconds: default_server_idle_timeout(),
            connection_idle_timeout_seconds: default_connection_idle_timeout(),
            handler_timeout_seconds: default_handler_timeout(),
            write_timeout_seconds: default_write_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Config {
    /// Load configuration from the `SOCKPUPPET_CONFIG` environment variable.
    ///
    /// Falls back to defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SOCKPUPPET_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse SOCKPUPPET_CONFIG")?,
            Err(_) => {
                debug!("SOCKPUPPET_CONFIG not set, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("SOCKPUPPET_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid SOCKPUPPET_PORT: {port}"))?;
        }
        if let Ok(key) = std::env::var("SOCKPUPPET_KEY") {
            self.key = Some(key);
        }
        Ok(())
    }

    /// Decode the configured key. Fails when none was provisioned.
    pub fn shared_key(&self) -> Result<SharedKey> {
        let encoded = self
            .key
            .as_deref()
            .context("No key configured (set `key` or SOCKPUPPET_KEY)")?;
        SharedKey::from_base64(encoded)
    }

    pub fn codec(&self) -> Result<FrameCodec> {
        Ok(FrameCodec::with_key(&self.shared_key()?).with_max_frame_size(self.max_frame_size))
    }

    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub const fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            retry_interval: Duration::from_millis(self.connect_retry_millis),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            addr: self.addr(),
            origin: self.origin.clone(),
            server_idle_timeout: nonzero_secs(self.server_idle_timeout_seconds),
            connection_idle_timeout: nonzero_secs(self.connection_idle_timeout_seconds),
            handler_timeout: Duration::from_secs(self.handler_timeout_seconds),
            write_timeout: Duration::from_secs(self.write_timeout_seconds),
        }
    }
}

const fn nonzero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    31337
}

fn default_origin() -> String {
    "sockpuppet".into()
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_connect_retry() -> u64 {
    100
}

const fn default_server_idle_timeout() -> u64 {
    180
}

const fn default_connection_idle_timeout() -> u64 {
    60
}

const fn default_handler_timeout() -> u64 {
    10
}

const fn default_write_timeout() -> u64 {
    10
}

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_applied() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.port, 31337);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.origin, "sockpuppet");
        assert!(config.key.is_none());

        let server = config.server_options();
        assert_eq!(server.server_idle_timeout, Some(Duration::from_secs(180)));
        assert_eq!(server.connection_idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(server.handler_timeout, Duration::from_secs(10));
        assert_eq!(server.write_timeout, Duration::from_secs(10));

        let client = config.client_options();
        assert_eq!(client.connect_timeout, Duration::from_secs(30));
        assert_eq!(client.retry_interval, Duration::from_millis(100));
    }

    #[test]
    fn zero_disables_idle_timeouts() {
        let config = Config::from_json(
            r#"{"server_idle_timeout_seconds": 0, "connection_idle_timeout_seconds": 0}"#,
        )
        .unwrap();
        let server = config.server_options();
        assert!(server.server_idle_timeout.is_none());
        assert!(server.connection_idle_timeout.is_none());
    }

    #[test]
    fn missing_key_is_an_error() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.shared_key().is_err());
        assert!(config.codec().is_err());
    }

    #[test]
    fn parses_key_and_addr() {
        let key = SharedKey::generate();
        let json = format!(
            r#"{{"host": "0.0.0.0", "port": 4444, "key": "{}", "max_frame_size": 1024}}"#,
            key.to_base64()
        );
        let config = Config::from_json(&json).unwrap();
        assert_eq!(config.shared_key().unwrap(), key);
        assert_eq!(config.addr(), "0.0.0.0:4444".parse().unwrap());
        assert_eq!(config.codec().unwrap().max_frame_size(), 1024);
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 0, "origin": "lab"}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.origin, "lab");
    }

    #[test]
    fn from_file_missing_path() {
        assert!(Config::from_file(Path::new("/nonexistent/sockpuppet.json")).is_err());
    }
}
