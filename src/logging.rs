//! Structured logging.
//!
//! Logging is a side-effect channel only — nothing in the control loop reads
//! back from it. The crate emits `tracing` events directly at call sites,
//! categorized by target (`controller::admission`, `controller::decision`,
//! `controller::telemetry`, `controller::supervisor`) rather than routing
//! through a bespoke logger. `init_tracing` is an opt-in convenience for
//! binaries that embed this crate; library code never calls it implicitly.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ControllerError, Result};

/// Configuration for the optional tracing subscriber installed by
/// `init_tracing`.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directory for the rolling log file. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// Also log to stdout.
    pub console: bool,
    /// Filter directive, e.g. `"adaptive_concurrency_controller=info"`.
    pub filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            console: true,
            filter: "adaptive_concurrency_controller=info".to_string(),
        }
    }
}

/// Install a global `tracing` subscriber. Returns a guard that must be held
/// for the lifetime of the process when file logging is enabled (dropping it
/// flushes the non-blocking writer). `tracing` only allows one global
/// default subscriber, so calling this twice is a configuration error.
pub fn init_tracing(opts: LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&opts.filter)
        .map_err(|e| ControllerError::Configuration(format!("invalid log filter: {e}")))?;

    let (file_layer, guard) = match &opts.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let console_layer = opts.console.then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ControllerError::Configuration(format!("tracing already initialized: {e}")))?;

    Ok(guard)
}
