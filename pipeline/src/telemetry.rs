//! Logging setup for the pipeline binary.
//!
//! Logs go to stderr so that stdout carries only the captured stage output.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry initialization failed: {reason}")]
    InitializationFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Include file and line of each event
    pub with_source_location: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            with_source_location: false,
        }
    }
}

impl TelemetryConfig {
    pub fn verbose() -> Self {
        Self {
            log_level: "debug".to_string(),
            with_source_location: true,
        }
    }
}

pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(config.with_source_location)
        .with_line_number(config.with_source_location)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        TelemetryError::InitializationFailed {
            reason: format!("Failed to set tracing subscriber: {}", e),
        }
    })
}
