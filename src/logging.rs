//! Tracing subscriber setup.
//!
//! Console output goes to stderr, plain or JSON. When `logging.directory` is
//! set, a daily-rolling JSON file is written there as well.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

pub const LOG_FILE_PREFIX: &str = "agencyhub.log";

/// Pick the filter directive: `RUST_LOG` wins, then `-v`, then the config.
pub fn filter_directive(section: &LoggingSection, verbose: bool, env: Option<String>) -> String {
    match env {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ if verbose => "debug".to_string(),
        _ => section.filter.clone(),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init_logging(section: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(section, verbose, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter: {}", directive))?;

    let console = if section.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match &section.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_takes_precedence() {
        let section = LoggingSection::default();
        assert_eq!(
            filter_directive(&section, true, Some("agencyhub=trace".into())),
            "agencyhub=trace"
        );
    }

    #[test]
    fn test_verbose_then_config() {
        let section = LoggingSection {
            filter: "warn".into(),
            ..Default::default()
        };
        assert_eq!(filter_directive(&section, true, None), "debug");
        assert_eq!(filter_directive(&section, false, None), "warn");
        assert_eq!(filter_directive(&section, false, Some("  ".into())), "warn");
    }
}
