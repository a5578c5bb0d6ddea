//! Fit loop for the U-Net
//!
//! This module implements the training loop using the Burn framework:
//! - Forward/backward passes with automatic differentiation
//! - Dice loss with accuracy, F1, precision, recall and Dice coefficient
//! - Validation on the inner (non-autodiff) backend
//! - Callbacks after every epoch (checkpoint, TensorBoard, early stopping)

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use super::callbacks::{Callback, CallbackAction, EpochLogs};
use super::metrics::{dice_loss, BatchMetrics, EpochMetrics, MetricAccumulator, SMOOTH};
use crate::dataset::{SegmentationBatch, SegmentationBatcher, SegmentationDataset, TrainingPair};
use crate::model::{UNet, UNetConfig};
use crate::utils::error::{LandcoverError, Result};
use crate::utils::logging::TrainingLogger;

/// Training state for monitoring
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    /// Optimizer steps taken in the current epoch
    pub iteration: usize,
    /// Lowest validation loss seen so far
    pub best_val_loss: f64,
    /// Training loss history (per epoch)
    pub train_losses: Vec<f64>,
    /// Validation loss history (per epoch)
    pub val_losses: Vec<f64>,
    /// Number of epochs without improvement
    pub epochs_without_improvement: usize,
    /// Total training samples seen
    pub samples_seen: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            best_val_loss: f64::INFINITY,
            train_losses: Vec::new(),
            val_losses: Vec::new(),
            epochs_without_improvement: 0,
            samples_seen: 0,
        }
    }
}

impl TrainingState {
    /// Record both losses of the current epoch; returns true on a new best
    pub fn record_epoch(&mut self, train_loss: f64, val_loss: f64) -> bool {
        self.train_losses.push(train_loss);
        self.val_losses.push(val_loss);

        if val_loss < self.best_val_loss {
            self.best_val_loss = val_loss;
            self.epochs_without_improvement = 0;
            true
        } else {
            self.epochs_without_improvement += 1;
            false
        }
    }
}

/// Result of a complete fit
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub best_val_loss: f64,
    pub stopped_early: bool,
    pub history: Vec<EpochLogs>,
}

/// Trainer for the U-Net, generic over the optimizer
pub struct Trainer<B: AutodiffBackend, O: Optimizer<UNet<B>, B>> {
    /// Model being trained
    pub model: UNet<B>,
    optimizer: O,
    learning_rate: f64,
    model_config: UNetConfig,
    callbacks: Vec<Box<dyn Callback<B::InnerBackend>>>,
    batcher: SegmentationBatcher,
    device: B::Device,
    /// Current training state
    pub state: TrainingState,
}

impl<B: AutodiffBackend, O: Optimizer<UNet<B>, B>> Trainer<B, O> {
    pub fn new(
        model: UNet<B>,
        optimizer: O,
        model_config: UNetConfig,
        learning_rate: f64,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optimizer,
            learning_rate,
            model_config,
            callbacks: Vec::new(),
            batcher: SegmentationBatcher::new(),
            device,
            state: TrainingState::default(),
        }
    }

    /// Run `callback` after every epoch, in registration order
    pub fn add_callback(&mut self, callback: Box<dyn Callback<B::InnerBackend>>) {
        debug!("Registered callback {}", callback.name());
        self.callbacks.push(callback);
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    fn check_batch<BB: burn::tensor::backend::Backend>(&self, batch: &SegmentationBatch<BB>) -> Result<()> {
        let [_, channels, height, width] = batch.images.dims();
        if channels != self.model_config.in_channels {
            return Err(LandcoverError::Training(format!(
                "batch has {} bands, model expects {}",
                channels, self.model_config.in_channels
            )));
        }
        let mask_dims = batch.masks.dims();
        if mask_dims[1] != self.model_config.num_classes || mask_dims[2..] != [height, width] {
            return Err(LandcoverError::Training(format!(
                "label shape {:?} does not match input {}x{} with {} classes",
                mask_dims, height, width, self.model_config.num_classes
            )));
        }
        self.model_config
            .check_spatial(height, width)
            .map_err(|e| LandcoverError::Training(e.to_string()))
    }

    /// Train for one pass over `batches`
    pub fn train_epoch<I>(&mut self, batches: I) -> Result<EpochMetrics>
    where
        I: IntoIterator<Item = Result<Vec<TrainingPair>>>,
    {
        let mut acc = MetricAccumulator::new();
        self.state.iteration = 0;

        for pairs in batches {
            let batch: SegmentationBatch<B> = self.batcher.batch(pairs?, &self.device);
            self.check_batch(&batch)?;
            let batch_size = batch.len();

            let output = self.model.forward(batch.images);
            let loss = dice_loss(batch.masks.clone(), output.clone(), SMOOTH);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(LandcoverError::Training(format!(
                    "non-finite loss {} at epoch {} step {}",
                    loss_value,
                    self.state.epoch + 1,
                    self.state.iteration + 1
                )));
            }

            let metrics = BatchMetrics::compute(batch.masks.inner(), output.inner(), loss_value);
            acc.update(&metrics);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);

            self.state.iteration += 1;
            self.state.samples_seen += batch_size;

            if self.state.iteration % 10 == 0 {
                debug!(
                    "  Step {}: loss = {:.4}, f1 = {:.4}",
                    self.state.iteration, loss_value, metrics.f1
                );
            }
        }

        if acc.batches() == 0 {
            return Err(LandcoverError::Training(
                "training dataset produced no batches".to_string(),
            ));
        }
        Ok(acc.finish())
    }

    /// Evaluate on `batches` without updating the model
    pub fn evaluate<I>(&self, batches: I) -> Result<EpochMetrics>
    where
        I: IntoIterator<Item = Result<Vec<TrainingPair>>>,
    {
        let model = self.model.valid();
        let mut acc = MetricAccumulator::new();

        for pairs in batches {
            let batch: SegmentationBatch<B::InnerBackend> = self.batcher.batch(pairs?, &self.device);
            self.check_batch(&batch)?;

            let output = model.forward(batch.images);
            let loss_value: f64 = dice_loss(batch.masks.clone(), output.clone(), SMOOTH)
                .into_scalar()
                .elem();
            if !loss_value.is_finite() {
                return Err(LandcoverError::Training(format!(
                    "non-finite validation loss {}",
                    loss_value
                )));
            }
            acc.update(&BatchMetrics::compute(batch.masks, output, loss_value));
        }

        if acc.batches() == 0 {
            return Err(LandcoverError::Training(
                "validation dataset produced no batches".to_string(),
            ));
        }
        Ok(acc.finish())
    }

    /// Train for up to `epochs` epochs, validating after each one
    pub fn fit(
        &mut self,
        train: &SegmentationDataset,
        validation: &SegmentationDataset,
        epochs: usize,
    ) -> Result<FitSummary> {
        let mut logger = TrainingLogger::new(epochs);
        let mut history = Vec::with_capacity(epochs);
        let mut stopped_early = false;

        let progress = ProgressBar::new(epochs as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        for epoch in 0..epochs {
            self.state.epoch = epoch;
            progress.set_position(epoch as u64);
            logger.start_epoch(epoch);

            let train_metrics = self.train_epoch(train.epoch(epoch))?;
            let val_metrics = self.evaluate(validation.epoch(epoch))?;

            let previous_best = self.state.best_val_loss;
            if self.state.record_epoch(train_metrics.loss, val_metrics.loss) {
                logger.log_new_best(previous_best, val_metrics.loss);
            }
            logger.end_epoch(train_metrics.loss, val_metrics.loss, val_metrics.f1);
            info!(
                "  accuracy: {:.4} | f1: {:.4} | precision: {:.4} | recall: {:.4} | dice: {:.4}",
                val_metrics.categorical_accuracy,
                val_metrics.f1,
                val_metrics.precision,
                val_metrics.recall,
                val_metrics.dice_coef
            );

            let logs = EpochLogs {
                epoch,
                train: train_metrics,
                val: val_metrics,
            };
            history.push(logs);

            let snapshot = self.model.valid();
            let mut stop = false;
            for callback in self.callbacks.iter_mut() {
                if callback.on_epoch_end(&logs, &snapshot)? == CallbackAction::Stop {
                    debug!("{} requested stop", callback.name());
                    stop = true;
                }
            }
            if stop {
                logger.log_early_stop(self.state.epochs_without_improvement);
                stopped_early = true;
                break;
            }
        }

        progress.finish_with_message("Training completed");

        let snapshot = self.model.valid();
        for callback in self.callbacks.iter_mut() {
            callback.on_train_end(&snapshot).inspect_err(|e| {
                warn!("{} failed at train end: {}", callback.name(), e);
            })?;
        }

        logger.log_complete(history.len(), self.state.best_val_loss);

        Ok(FitSummary {
            epochs_run: history.len(),
            best_val_loss: self.state.best_val_loss,
            stopped_early,
            history,
        })
    }
}
