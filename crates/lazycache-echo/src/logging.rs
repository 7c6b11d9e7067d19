use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             lazycache=DEBUG,\
             lazycache_echo=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             lazycache=TRACE,\
             lazycache_echo=TRACE"
        }
    }
}

/// Resolves [`LogFormat::Auto`] to pretty output on a terminal and simplified output otherwise.
fn resolve_format(format: LogFormat, user_attended: bool) -> LogFormat {
    match (format, user_attended) {
        (LogFormat::Auto, true) => LogFormat::Pretty,
        (LogFormat::Auto, false) => LogFormat::Simplified,
        (format, _) => format,
    }
}

/// Initializes logging.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration.
pub fn init_logging(config: &Config) {
    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let layer = match resolve_format(config.logging.format, console::user_attended()) {
        LogFormat::Json => return init_json_logging(&rust_log, std::io::stdout),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Auto | LogFormat::Pretty => layer.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(EnvFilter::new(&rust_log)))
        .init();
}

/// Initializes line-delimited JSON logging to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(make_writer)
        .finish()
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_per_level() {
        assert_eq!(get_rust_log(LevelFilter::OFF), "");
        assert_eq!(get_rust_log(LevelFilter::INFO), "INFO");
        assert_eq!(
            get_rust_log(LevelFilter::DEBUG),
            "INFO,lazycache=DEBUG,lazycache_echo=DEBUG"
        );
    }

    #[test]
    fn test_resolve_format() {
        assert_eq!(resolve_format(LogFormat::Auto, true), LogFormat::Pretty);
        assert_eq!(resolve_format(LogFormat::Auto, false), LogFormat::Simplified);
        assert_eq!(resolve_format(LogFormat::Json, true), LogFormat::Json);
        assert_eq!(resolve_format(LogFormat::Pretty, false), LogFormat::Pretty);
    }
}
