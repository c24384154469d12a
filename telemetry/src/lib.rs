//! Tracing setup for the orchestrator and its tests.

use std::sync::Once;

use config::Environment;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::{LogTracer, log::SetLoggerError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Directory receiving rolling log files in production.
const LOGS_DIR: &str = "logs";

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Set this variable to see tracing output while running tests.
const ENABLE_TEST_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine the environment: {0}")]
    Environment(#[from] std::io::Error),

    #[error("failed to install the log bridge: {0}")]
    LogTracer(#[from] SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Flushes buffered log lines when dropped.
///
/// Keep it alive for the whole lifetime of the process.
#[must_use]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber.
///
/// In `dev` logs are pretty printed to stdout. In `prod` they are written as
/// JSON to a daily rolling file named after `app_name`.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    if Environment::load()?.is_prod() {
        let file_appender = tracing_appender::rolling::daily(LOGS_DIR, app_name);
        let (writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer),
        );
        tracing::subscriber::set_global_default(subscriber)?;

        return Ok(LogFlusher {
            _guard: Some(guard),
        });
    }

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().pretty());
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(LogFlusher { _guard: None })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a test writer subscriber once per test binary.
///
/// Does nothing unless `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TEST_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into());
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
