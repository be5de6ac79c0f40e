//! Tracing setup for the CLI.
//!
//! Console output goes to stderr so `--json` results on stdout stay clean.
//! A daily rolling file is added when `[logging] directory` is set.

use crate::config::{LogFormat, LoggingConfig};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "rhsm-register.log";

/// Filter directive for the given verbosity and configured level.
pub fn filter_directive(verbose: bool, level: &str) -> String {
    if verbose {
        "rhsm_register=debug,zbus=info".to_string()
    } else {
        format!("rhsm_register={},zbus=warn", level.to_lowercase())
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the computed filter. The returned guard flushes the
/// file writer and must be held until exit.
pub fn init(verbose: bool, config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(verbose, &config.level)));

    let console = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let directory = config.directory.trim();
    let (file, guard) = if directory.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
    {
        debug!("Keeping the installed tracing subscriber: {}", e);
    }

    guard
}
