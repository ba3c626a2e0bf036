//! Logging Module
//!
//! Structured logging on top of the `tracing` crate, plus a small epoch
//! timer used by the training engine.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::utils::error::{Result, WasteSorterError};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose config for debugging loader and engine internals
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse a level name, falling back to info
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Filter for the configured level. Directives in `RUST_LOG` are layered on
/// top, so a single module can still be turned up or down.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level.to_tracing_level()).into())
        .from_env_lossy()
}

/// Initialize the global subscriber with the given configuration
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter(config))
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        WasteSorterError::Configuration(format!("Failed to initialize logging: {}", e))
    })
}

/// Epoch timing for the training engine
pub struct TrainingLogger {
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch (0-indexed)
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch_start = Instant::now();
        tracing::debug!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Seconds spent in the current epoch
    pub fn epoch_seconds(&self) -> f64 {
        self.epoch_start.elapsed().as_secs_f64()
    }

    /// Log training completion
    pub fn log_complete(&self, final_val_accuracy: f64) {
        tracing::info!(
            "Training complete: {} epochs in {:.1}s | final val_acc: {:.4}",
            self.total_epochs,
            self.training_start.elapsed().as_secs_f64(),
            final_val_accuracy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::parse("Warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_env_filter_defaults_to_configured_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(env_filter(&LogConfig::quiet()).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(env_filter(&LogConfig::verbose()).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::default().level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level, LogLevel::Debug);
        assert_eq!(LogConfig::quiet().level, LogLevel::Error);
    }
}
