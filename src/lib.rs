//! # Land-cover U-Net
//!
//! Trains a U-Net on multi-band satellite patches stored as GZIP TFRecord
//! files of `tf.train.Example` protos, using the Burn framework.
//!
//! ## Modules
//!
//! - `config`: YAML run configuration
//! - `dataset`: record decoding, augmentation, shuffling and batching
//! - `model`: U-Net, its layer graph and persisted artifacts
//! - `training`: metrics, fit loop, callbacks and the end-to-end run
//! - `utils`: errors, logging and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use landcover_unet::backend::{default_device, TrainingBackend};
//! use landcover_unet::config::TrainConfig;
//! use landcover_unet::utils::LogConfig;
//!
//! let config = TrainConfig::load("config.yml".as_ref())?;
//! let summary = landcover_unet::training::run::<TrainingBackend>(
//!     &config,
//!     LogConfig::default(),
//!     default_device(),
//! )?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

pub use config::TrainConfig;
pub use dataset::{SegmentationBatch, SegmentationBatcher, SegmentationDataset, TrainingPair};
pub use model::{LayerGraph, UNet, UNetConfig};
pub use training::{Trainer, TrainingState};
pub use utils::error::{LandcoverError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
