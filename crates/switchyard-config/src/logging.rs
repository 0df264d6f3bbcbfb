//! Tracing initialisation for hosts embedding the orchestrator.
//!
//! Installs a console layer (human-readable) and, when enabled, a
//! daily-rolling JSON file layer written through a non-blocking appender.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::{ConfigError, LoggingConfig, Result, user_config_dir};

const LOG_FILE_PREFIX: &str = "switchyard.log";

/// Filter for the JSON file: everything from our crates, `info` elsewhere.
const FILE_FILTER: &str =
    "switchyard_types=trace,switchyard_assembler=trace,switchyard_engine=trace,switchyard_config=trace,info";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. It is `None` when no file layer was installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console_filter = console_filter(config)?;

    let (file_layer, guard) = if config.json_file {
        let dir = log_directory(config);
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(FILE_FILTER));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(guard)
}

/// `RUST_LOG` if set, else the configured level.
fn console_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| ConfigError::Invalid {
        field: "logging.level".to_string(),
        reason: e.to_string(),
    })
}

fn log_directory(config: &LoggingConfig) -> PathBuf {
    config.directory.clone().unwrap_or_else(|| {
        user_config_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    })
}
