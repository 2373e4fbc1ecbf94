//! Tracing initialisation for the daemon and library consumers.
//!
//! Logs go to stderr in the configured format; a file layer can be stacked
//! on top. The `LOG` environment variable takes an `EnvFilter` directive and
//! overrides the verbosity mapping.

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub stdout_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: &LoggingConfig) -> Self {
        Self {
            verbosity,
            stdout_format: logging.stdout_format,
            log_file: logging.file.clone(),
        }
    }
}

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(build_stderr_layer(config.stdout_format));

    let mut file_setup_error = None;
    if let Some(path) = &config.log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                ));
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error = Some(format!("log file init failed for {}: {err}", path.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stderr_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_increasing_levels() {
        assert_eq!(
            level_from_verbosity(0),
            tracing::metadata::LevelFilter::ERROR
        );
        assert_eq!(level_from_verbosity(1), tracing::metadata::LevelFilter::INFO);
        assert_eq!(
            level_from_verbosity(2),
            tracing::metadata::LevelFilter::DEBUG
        );
        assert_eq!(
            level_from_verbosity(9),
            tracing::metadata::LevelFilter::DEBUG
        );
    }
}
