use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use relays_core::config::{LogFormat, LogSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::{Layer, fmt};

/// Logs panics through `tracing` so they end up in the configured format on one line.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop if neither RUST_BACKTRACE nor RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        panic_info
            .payload()
            .downcast_ref::<String>()
            .map(|s| s.as_str())
    };

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// RUST_LOG wins over the configured verbosity. Either one failing to parse is an error.
fn env_filter(rust_log: Option<String>, verbosity: &str) -> Result<EnvFilter, ParseError> {
    match rust_log {
        Some(directives) => EnvFilter::try_new(directives),
        None => EnvFilter::try_new(verbosity),
    }
}

pub fn register(log: &LogSettings) -> Result<(), ParseError> {
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), &log.verbosity)?;
    let layer = match log.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
    Ok(())
}
