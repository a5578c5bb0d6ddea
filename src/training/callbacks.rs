//! Fit-loop callbacks
//!
//! Each callback sees the finished epoch's training and validation metrics
//! and the current model. Any callback may ask the loop to stop.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use tracing::{debug, info};

use super::metrics::EpochMetrics;
use super::summary::EventWriter;
use crate::model::artifact::{save_model, ArtifactMeta, TrainingParams};
use crate::model::{UNet, UNetConfig};
use crate::utils::error::Result;

/// What the fit loop should do after an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Metrics of one finished epoch
#[derive(Debug, Clone, Copy)]
pub struct EpochLogs {
    /// 0-indexed epoch
    pub epoch: usize,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
}

pub trait Callback<B: Backend> {
    fn on_epoch_end(&mut self, logs: &EpochLogs, model: &UNet<B>) -> Result<CallbackAction>;

    fn on_train_end(&mut self, _model: &UNet<B>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Saves the model whenever validation loss reaches a new minimum
pub struct ModelCheckpoint {
    stem: PathBuf,
    model_config: UNetConfig,
    params: TrainingParams,
    best: f64,
    saved: usize,
}

impl ModelCheckpoint {
    pub fn new(stem: impl Into<PathBuf>, model_config: UNetConfig, params: TrainingParams) -> Self {
        Self {
            stem: stem.into(),
            model_config,
            params,
            best: f64::INFINITY,
            saved: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn stem(&self) -> &Path {
        &self.stem
    }

    pub fn times_saved(&self) -> usize {
        self.saved
    }
}

impl<B: Backend> Callback<B> for ModelCheckpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, model: &UNet<B>) -> Result<CallbackAction> {
        let current = logs.val.loss;
        if current < self.best {
            let meta = ArtifactMeta::new(
                &self.model_config,
                self.params.clone(),
                logs.epoch + 1,
                Some(current),
            );
            save_model(model, &meta, &self.stem)?;
            info!(
                "Epoch {}: val_loss improved from {:.5} to {:.5}, saving model to {:?}",
                logs.epoch + 1,
                self.best,
                current,
                self.stem
            );
            self.best = current;
            self.saved += 1;
        } else {
            debug!(
                "Epoch {}: val_loss did not improve from {:.5}",
                logs.epoch + 1,
                self.best
            );
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }
}

/// Per-epoch scalars to `logs/train` and `logs/validation`
pub struct TensorBoardLogger {
    train: EventWriter,
    validation: EventWriter,
}

impl TensorBoardLogger {
    pub fn new(log_dir: &Path) -> Result<Self> {
        Ok(Self {
            train: EventWriter::create(&log_dir.join("train"))?,
            validation: EventWriter::create(&log_dir.join("validation"))?,
        })
    }

    pub fn train_path(&self) -> &Path {
        self.train.path()
    }

    pub fn validation_path(&self) -> &Path {
        self.validation.path()
    }
}

impl<B: Backend> Callback<B> for TensorBoardLogger {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _model: &UNet<B>) -> Result<CallbackAction> {
        self.train.add_scalars(logs.epoch, &logs.train.scalars())?;
        self.validation.add_scalars(logs.epoch, &logs.val.scalars())?;
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "TensorBoard"
    }
}

/// Stops after `patience` epochs without a lower validation loss
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            wait: 0,
            stopped_epoch: None,
        }
    }

    /// Record a validation loss; true when training should stop
    pub fn update(&mut self, epoch: usize, val_loss: f64) -> bool {
        if val_loss < self.best {
            self.best = val_loss;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        if self.patience > 0 && self.wait >= self.patience {
            self.stopped_epoch = Some(epoch);
            return true;
        }
        false
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

impl<B: Backend> Callback<B> for EarlyStopping {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _model: &UNet<B>) -> Result<CallbackAction> {
        if self.update(logs.epoch, logs.val.loss) {
            Ok(CallbackAction::Stop)
        } else {
            Ok(CallbackAction::Continue)
        }
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn logs(epoch: usize, val_loss: f64) -> EpochLogs {
        EpochLogs {
            epoch,
            train: EpochMetrics::default(),
            val: EpochMetrics {
                loss: val_loss,
                ..Default::default()
            },
        }
    }

    fn params() -> TrainingParams {
        TrainingParams {
            epochs: 3,
            batch_size: 2,
            buffer_size: 4,
            learning_rate: 1e-3,
            seed: 1,
            kernel_size: 32,
            bands: vec!["R".into()],
            response: "label".into(),
        }
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut es = EarlyStopping::new(2);
        assert!(!es.update(0, 0.5));
        assert!(!es.update(1, 0.6));
        assert!(!es.update(2, 0.4));
        assert!(!es.update(3, 0.4));
        assert!(es.update(4, 0.45));
        assert_eq!(es.stopped_epoch(), Some(4));
    }

    #[test]
    fn test_early_stopping_disabled() {
        let mut es = EarlyStopping::new(0);
        for epoch in 0..10 {
            assert!(!es.update(epoch, 1.0));
        }
    }

    #[test]
    fn test_checkpoint_saves_only_improvements() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = UNetConfig::new().with_in_channels(1).with_base_filters(1).with_depth(1);
        let model: UNet<TestBackend> = config.init(&device);
        let stem = dir.path().join("best");
        let mut checkpoint = ModelCheckpoint::new(&stem, config, params());

        for (epoch, loss) in [0.5, 0.7, 0.3].into_iter().enumerate() {
            let action =
                Callback::<TestBackend>::on_epoch_end(&mut checkpoint, &logs(epoch, loss), &model).unwrap();
            assert_eq!(action, CallbackAction::Continue);
        }
        assert_eq!(checkpoint.times_saved(), 2);
        assert_eq!(checkpoint.best(), 0.3);

        let meta = crate::model::artifact::load_meta(&stem).unwrap();
        assert_eq!(meta.epoch, 3);
        assert_eq!(meta.val_loss, Some(0.3));
    }

    #[test]
    fn test_tensorboard_creates_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new().with_depth(1).with_base_filters(1).init(&device);
        let mut tb = TensorBoardLogger::new(&dir.path().join("logs")).unwrap();
        Callback::<TestBackend>::on_epoch_end(&mut tb, &logs(0, 0.2), &model).unwrap();
        assert!(tb.train_path().starts_with(dir.path().join("logs/train")));
        assert!(tb.validation_path().starts_with(dir.path().join("logs/validation")));
        assert!(std::fs::metadata(tb.validation_path()).unwrap().len() > 0);
    }
}
