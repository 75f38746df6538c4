//! Structured logging setup
//!
//! Installs a global `tracing` subscriber for the admin binary and embedding
//! applications. The storage engines themselves only return errors.

use crate::core::config::LoggingConfig;
use anyhow::{anyhow, bail, Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Keeps the non-blocking writer flushing; hold it until shutdown
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Install the global subscriber described by `config`
    ///
    /// `RUST_LOG`, when set, takes precedence over `config.level`.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_level(&config.level)?;
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let (writer, guard) = open_writer(config)?;
        let layer = format_layer(config, writer)?;

        tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .context("a global tracing subscriber is already installed")?;

        tracing::debug!(
            level = %config.level,
            format = %config.format,
            output = %config.output,
            "Logging initialized"
        );
        Ok(Logger { _guard: guard })
    }
}

fn open_writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    match config.output.as_str() {
        "stdout" => Ok(tracing_appender::non_blocking(std::io::stdout())),
        "file" => {
            let path = config
                .log_file
                .as_deref()
                .ok_or_else(|| anyhow!("log_file is required for file output"))?;
            let name = path
                .file_name()
                .with_context(|| format!("{:?} has no file name", path))?;
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => std::path::Path::new("."),
            };
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            Ok(tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, name),
            ))
        }
        other => bail!("unknown log output: {}", other),
    }
}

fn format_layer(config: &LoggingConfig, writer: NonBlocking) -> Result<BoxedLayer> {
    let layer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
        "text" => fmt::layer()
            .with_ansi(config.output == "stdout")
            .with_writer(writer)
            .boxed(),
        other => bail!("unknown log format: {}", other),
    };
    Ok(layer)
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => bail!("unknown log level: {}", level),
    }
}
