//! Config loading and environment overrides.
//!
//! Everything the daemon needs lives in one TOML file; every setting is
//! optional and mirrored by a `CBUSD_*` environment variable so containers
//! can run without a file at all. CLI flags override both.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pci::{Connector, EngineOptions, TcpConnector};
use crate::protocol::application;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("exactly one of a serial device or a TCP address must be configured")]
    NoEndpoint,
    #[error("serial device support requires building with the `serial` feature")]
    SerialSupportDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pci: PciConfig,
    pub timesync: TimesyncConfig,
    pub resync: ResyncConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

/// Where the PCI lives. Exactly one endpoint kind must be set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PciConfig {
    /// `addr:port` of a CNI or networked PCI.
    pub tcp: Option<String>,
    /// Device node of a serial or USB PCI.
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimesyncConfig {
    /// Seconds between scheduled time broadcasts; 0 disables.
    pub interval_secs: u64,
    /// Answer clock request SALs with the local time.
    pub answer_requests: bool,
}

impl Default for TimesyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            answer_requests: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Seconds between bulk status sweeps; 0 disables.
    pub interval_secs: u64,
    /// Outstanding status requests allowed per sweep.
    pub max_inflight: usize,
    /// Lighting applications always included in a sweep.
    pub applications: Vec<u8>,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_inflight: 4,
            applications: vec![application::LIGHTING],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub confirm_timeout_secs: u64,
    pub retry_interval_ms: u64,
    pub max_attempts: u8,
    pub reset_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed reconnects before the daemon gives up; 0 retries
    /// forever.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: 30,
            retry_interval_ms: 1_000,
            max_attempts: 3,
            reset_timeout_secs: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout_format: LogFormat,
    /// Append logs to this file in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, falling back to defaults with a warning on failure.
    ///
    /// Telemetry is not up yet when config loads, so the warning goes to
    /// stderr directly.
    pub fn load_or_default(path: &Path) -> Config {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("config load failed, using defaults: {err}");
                Config::default()
            }
        }
    }

    /// Fold `CBUSD_*` environment variables over the file contents.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(tcp) = std::env::var("CBUSD_TCP") {
            self.pci.tcp = Some(tcp);
        }
        if let Ok(serial) = std::env::var("CBUSD_SERIAL") {
            self.pci.serial = Some(serial);
        }
        if let Some(secs) = env_u64("CBUSD_TIMESYNC") {
            self.timesync.interval_secs = secs;
        }
        if std::env::var_os("CBUSD_NO_CLOCK").is_some() {
            self.timesync.answer_requests = false;
        }
        if let Some(secs) = env_u64("CBUSD_STATUS_RESYNC") {
            self.resync.interval_secs = secs;
        }
        if let Ok(file) = std::env::var("CBUSD_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
    }

    /// Build the engine timer set from the configured values.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            confirm_timeout: Duration::from_secs(self.connection.confirm_timeout_secs),
            retry_interval: Duration::from_millis(self.connection.retry_interval_ms),
            max_attempts: self.connection.max_attempts,
            clock_interval: Duration::from_secs(self.timesync.interval_secs),
            answer_clock_requests: self.timesync.answer_requests,
            resync_interval: Duration::from_secs(self.resync.interval_secs),
            resync_max_inflight: self.resync.max_inflight,
            resync_applications: self.resync.applications.clone(),
            reset_timeout: Duration::from_secs(self.connection.reset_timeout_secs),
            backoff_base: Duration::from_millis(self.connection.backoff_base_ms),
            backoff_max: Duration::from_millis(self.connection.backoff_max_ms),
            max_reconnect_attempts: self.connection.max_reconnect_attempts,
            ..EngineOptions::default()
        }
    }

    /// Build the transport connector for the configured endpoint.
    pub fn connector(&self) -> Result<Box<dyn Connector>, ConfigError> {
        match (&self.pci.tcp, &self.pci.serial) {
            (Some(addr), None) => Ok(Box::new(TcpConnector::new(addr.clone()))),
            (None, Some(_device)) => {
                #[cfg(feature = "serial")]
                {
                    Ok(Box::new(crate::pci::SerialConnector::new(_device.clone())))
                }
                #[cfg(not(feature = "serial"))]
                {
                    Err(ConfigError::SerialSupportDisabled)
                }
            }
            _ => Err(ConfigError::NoEndpoint),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_an_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.timesync.interval_secs, 300);
        assert_eq!(config.resync.interval_secs, 300);
        assert_eq!(config.resync.applications, vec![application::LIGHTING]);
        assert_eq!(config.connection.max_attempts, 3);
        assert!(matches!(config.connector(), Err(ConfigError::NoEndpoint)));
    }

    #[test]
    fn endpoint_and_timers_parse() {
        let config: Config = toml::from_str(
            r#"
            [pci]
            tcp = "192.0.2.1:10001"

            [timesync]
            interval_secs = 60
            answer_requests = false

            [connection]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.pci.tcp.as_deref(), Some("192.0.2.1:10001"));
        let opts = config.engine_options();
        assert_eq!(opts.clock_interval, Duration::from_secs(60));
        assert!(!opts.answer_clock_requests);
        assert_eq!(opts.max_attempts, 5);
        assert!(config.connector().is_ok());
    }

    #[test]
    fn load_or_default_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml"));
        assert_eq!(config.timesync.interval_secs, 300);
        assert_eq!(config.connection.max_attempts, 3);
        assert!(config.pci.tcp.is_none());
    }

    #[test]
    fn both_endpoints_is_an_error() {
        let config: Config = toml::from_str(
            r#"
            [pci]
            tcp = "192.0.2.1:10001"
            serial = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert!(matches!(config.connector(), Err(ConfigError::NoEndpoint)));
    }
}
