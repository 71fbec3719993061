//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber used by the resilience
//! layer and the services composed on top of it.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing::Subscriber;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{ResilienceError, Result};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Subscriber settings, read from the `logging.*` keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Also the log file stem
    pub service_name: String,
    pub file_output: bool,
    /// Required for file output
    pub log_dir: Option<String>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Initializes the structured logging system.
///
/// Calling this more than once is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let subscriber = Registry::default().with(filter);

    // JSON and text layers have distinct types, so each branch installs its own stack.
    let installed = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true);
        let subscriber = subscriber.with(json_layer);
        let file_layer = file_layer(&config);
        tracing::subscriber::set_global_default(subscriber.with(file_layer))
    } else {
        let text_layer = fmt::layer().with_target(true).with_thread_names(true);
        let subscriber = subscriber.with(text_layer);
        let file_layer = file_layer(&config);
        tracing::subscriber::set_global_default(subscriber.with(file_layer))
    };

    installed.map_err(|e| {
        ResilienceError::Logging(format!("Failed to set global subscriber: {}", e))
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Builds the optional daily-rolling file layer
fn file_layer<S>(config: &LoggingConfig) -> Option<fmt::Layer<S, DefaultFields, Format, NonBlocking>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !config.file_output {
        return None;
    }

    config.log_dir.as_ref().map(|log_dir| {
        let appender = RollingFileAppender::new(
            Rotation::DAILY,
            log_dir,
            format!("{}.log", config.service_name),
        );
        let (writer, guard) = NonBlocking::new(appender);
        // The guard flushes on drop; it must live as long as the process.
        Box::leak(Box::new(guard));
        fmt::layer().with_writer(writer).with_ansi(false)
    })
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut logging = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            logging.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            logging.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            logging.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            logging.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            logging.json_format = json_format;
        }

        Ok(logging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_from_config() {
        let cfg = config::Config::builder()
            .set_override("logging.level", "debug")
            .unwrap()
            .set_override("logging.json_format", false)
            .unwrap()
            .build()
            .unwrap();

        let logging = LoggingConfig::try_from(cfg).unwrap();
        assert_eq!(logging.level, "debug");
        assert!(!logging.json_format);
        assert_eq!(logging.service_name, "resilience");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(Some(LoggingConfig {
            json_format: false,
            ..LoggingConfig::default()
        }))
        .unwrap();
        assert!(init_logging(None).is_ok());
    }
}
