use std::env;

use proxycache_service::config::{Config, LogFormat};
use proxycache_service::logging::init_json_logging;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

/// The filter used when `RUST_LOG` is not set.
///
/// Dependencies stay at `INFO` unless the configured level is stricter.
fn default_filter(level: LevelFilter) -> String {
    let name = match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        _ => "trace",
    };
    if level <= LevelFilter::INFO {
        return name.to_owned();
    }
    format!("info,proxycache={name},proxycache_service={name}")
}

/// Resolves [`LogFormat::Auto`] depending on whether a human watches `stderr`.
fn resolve_format(format: LogFormat, attended: bool) -> LogFormat {
    match format {
        LogFormat::Auto if attended => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Installs the global subscriber for the command line.
///
/// `RUST_LOG` takes precedence over the configured level. Events are also forwarded to Sentry,
/// which only sends anything when a DSN is configured.
///
/// # Safety
/// Forcing backtraces on modifies the environment with [`std::env::set_var`], so this must be
/// called before any other thread is started.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees that no other thread is running yet.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339());
    let layer = match resolve_format(config.logging.format, console::user_attended_stderr()) {
        LogFormat::Json => return init_json_logging(&filter, std::io::stderr),
        LogFormat::Pretty => layer.pretty().boxed(),
        _ => layer.compact().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(EnvFilter::new(&filter)))
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Reports a fatal error through the logger, or on `stderr` if logging was never set up.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::dispatcher::has_been_set() {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
