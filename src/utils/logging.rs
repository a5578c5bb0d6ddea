//! Logging Module
//!
//! Structured logging with the `tracing` crate. Events go to stdout in compact
//! form and, when a log directory is given, are appended without ANSI colors
//! to a dated `trainlog_YYYY-MM-DD.log` file next to the training artifacts.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::utils::error::Result;
use crate::utils::format_duration;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to use ANSI colors on stdout
    pub ansi_colors: bool,
    /// Directory receiving the dated log file (stdout only when None)
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
            log_dir: None,
        }
    }
}

impl LogConfig {
    /// Create a verbose logging config for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            ..Default::default()
        }
    }

    /// Write a copy of every event under `dir`
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
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

    /// Create from string, defaulting to Info
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Name of the process log for the current local date
pub fn log_file_name() -> String {
    format!("trainlog_{}.log", Local::now().format("%Y-%m-%d"))
}

/// Initialize logging with the given configuration
///
/// Returns the path of the log file when one was opened. Failing to open the
/// file is an error; a subscriber that is already installed is left in place.
pub fn init_logging(config: &LogConfig) -> Result<Option<PathBuf>> {
    let filter = LevelFilter::from_level(config.level.to_tracing_level());
    let stdout_layer = fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact();

    let (file_layer, file_path) = match &config.log_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(config.include_target)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if installed.is_err() {
        // Already installed (tests, embedding callers).
        tracing::debug!("global tracing subscriber already set; keeping it");
    }

    Ok(file_path)
}

fn open_log_file(dir: &Path) -> Result<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name());
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Training progress logger
pub struct TrainingLogger {
    /// Current epoch
    epoch: usize,
    /// Total epochs
    total_epochs: usize,
    /// Epoch start time
    epoch_start: std::time::Instant,
    /// Training start time
    training_start: std::time::Instant,
}

impl TrainingLogger {
    /// Create a new training logger
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: std::time::Instant::now(),
            training_start: std::time::Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = std::time::Instant::now();

        tracing::info!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Log end of an epoch with losses
    pub fn end_epoch(&self, train_loss: f64, val_loss: f64, val_f1: f64) {
        let epoch_time = self.epoch_start.elapsed().as_secs_f64();
        let total_time = self.training_start.elapsed().as_secs_f64();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time / (self.epoch + 1) as f64;
        let eta_secs = epochs_remaining as f64 * avg_epoch_time;

        tracing::info!(
            "{}",
            self.epoch_line(epoch_time, eta_secs, train_loss, val_loss, val_f1)
        );
    }

    fn epoch_line(
        &self,
        epoch_secs: f64,
        eta_secs: f64,
        train_loss: f64,
        val_loss: f64,
        val_f1: f64,
    ) -> String {
        format!(
            "Epoch {}/{} completed in {} | loss: {:.4} | val_loss: {:.4} | val_f1: {:.4} | ETA: {}",
            self.epoch + 1,
            self.total_epochs,
            format_duration(epoch_secs),
            train_loss,
            val_loss,
            val_f1,
            format_duration(eta_secs)
        )
    }

    /// Log a new best model
    pub fn log_new_best(&self, previous: f64, val_loss: f64) {
        tracing::info!(
            "val_loss improved from {:.5} to {:.5}",
            previous,
            val_loss
        );
    }

    /// Log early stopping
    pub fn log_early_stop(&self, patience: usize) {
        tracing::warn!(
            "Early stopping triggered after {} epochs without improvement",
            patience
        );
    }

    /// Log training completion
    pub fn log_complete(&self, epochs_run: usize, best_val_loss: f64) {
        let total_time = self.training_start.elapsed().as_secs_f64();
        tracing::info!("{}", complete_line(epochs_run, total_time, best_val_loss));
    }
}

fn complete_line(epochs_run: usize, total_secs: f64, best_val_loss: f64) -> String {
    format!(
        "Training complete! {} epochs in {} | Best val_loss: {:.5}",
        epochs_run,
        format_duration(total_secs),
        best_val_loss
    )
}
