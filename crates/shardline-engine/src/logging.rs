//! Structured logging setup
//!
//! - pretty console output for development
//! - JSON lines for production
//! - daily rotated log files

use crate::config::LoggingConfig;
use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "shardline.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production
    Json,
    /// Compact format for testing
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }
}

fn stdout_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(true).with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    }
}

fn file_appender(directory: &str) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(directory).with_context(|| format!("creating log directory {}", directory))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE_PREFIX))
}

/// Install the global subscriber.
///
/// `config.level` takes `RUST_LOG` syntax (e.g. `info`, `shardline_planner=debug`).
/// An unparsable level falls back to `info`. Fails if a subscriber is already set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);

    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match output {
        LogOutput::Stdout => tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer(format))
            .try_init()?,
        LogOutput::File => {
            let appender = file_appender(&config.directory)?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(appender).with_ansi(false))
                .try_init()?
        }
        LogOutput::Both => {
            let appender = file_appender(&config.directory)?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer(format))
                .with(fmt::layer().with_writer(appender).with_ansi(false).boxed())
                .try_init()?
        }
    }

    tracing::info!(format = ?format, output = ?output, level = %config.level, "Logging initialized");
    if output != LogOutput::Stdout {
        tracing::debug!(directory = %config.directory, "Writing log files");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("bogus"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_output_parse() {
        assert_eq!(LogOutput::parse("file"), LogOutput::File);
        assert_eq!(LogOutput::parse("both"), LogOutput::Both);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::parse(""), LogOutput::Stdout);
    }
}
