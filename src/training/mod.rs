//! Training module
//!
//! This module provides:
//! - Loss and metric functions (Dice loss, F1, precision, recall)
//! - The fit loop over epoch streams with per-epoch callbacks
//! - TensorBoard event files for per-epoch scalars
//! - The end-to-end run from a `TrainConfig` to saved artifacts

pub mod callbacks;
pub mod driver;
pub mod metrics;
pub mod summary;
pub mod trainer;

// Re-export main types for convenience
pub use callbacks::{Callback, CallbackAction, EarlyStopping, EpochLogs, ModelCheckpoint, TensorBoardLogger};
pub use driver::{model_config_for, run, run_with_model, RunSummary};
pub use metrics::{BatchMetrics, EpochMetrics, MetricAccumulator};
pub use trainer::{FitSummary, Trainer, TrainingState};
