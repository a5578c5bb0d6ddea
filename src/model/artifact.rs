//! Persisted model artifacts
//!
//! An artifact is a set of files sharing one stem:
//!
//! - `<stem>.mpk`        model weights (named MessagePack, full precision)
//! - `<stem>.optim.mpk`  optimizer state, when saved
//! - `<stem>.json`       architecture, layer graph, loss/metric registry and
//!   training parameters
//!
//! Loading refuses sidecars naming loss or metric functions this crate does
//! not provide.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::graph::LayerGraph;
use super::unet::{UNet, UNetConfig};
use crate::config::TrainConfig;
use crate::training::metrics::{is_registered, CUSTOM_OBJECTS, LOSS_NAME, METRIC_NAMES};
use crate::utils::error::{LandcoverError, Result};

/// Bumped when the sidecar layout changes incompatibly
pub const ARTIFACT_VERSION: u32 = 1;

type ArtifactRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Files making up one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub weights: PathBuf,
    pub optimizer: PathBuf,
    pub meta: PathBuf,
}

impl ArtifactPaths {
    /// Paths for `stem`; a trailing `.mpk` or `.json` is ignored
    pub fn for_stem(stem: &Path) -> Self {
        let base = stem.to_string_lossy();
        let base = base
            .strip_suffix(".optim.mpk")
            .or_else(|| base.strip_suffix(".mpk"))
            .or_else(|| base.strip_suffix(".json"))
            .unwrap_or(&base)
            .to_string();
        Self {
            weights: PathBuf::from(format!("{}.mpk", base)),
            optimizer: PathBuf::from(format!("{}.optim.mpk", base)),
            meta: PathBuf::from(format!("{}.json", base)),
        }
    }
}

/// Hyperparameters the model was trained with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub kernel_size: usize,
    pub bands: Vec<String>,
    pub response: String,
}

impl TrainingParams {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            buffer_size: config.buffer_size,
            learning_rate: config.learning_rate,
            seed: config.seed,
            kernel_size: config.kernel_size,
            bands: config.bands.clone(),
            response: config.response.clone(),
        }
    }
}

/// Contents of `<stem>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub version: u32,
    pub created_at: String,
    pub backend: String,
    pub model: UNetConfig,
    pub graph: LayerGraph,
    pub loss: String,
    pub metrics: Vec<String>,
    /// Custom loss/metric functions needed to rebuild the compiled model
    pub custom_objects: Vec<String>,
    /// Epochs completed when the artifact was written
    pub epoch: usize,
    pub val_loss: Option<f64>,
    pub training: TrainingParams,
}

impl ArtifactMeta {
    pub fn new(model: &UNetConfig, training: TrainingParams, epoch: usize, val_loss: Option<f64>) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            created_at: Local::now().to_rfc3339(),
            backend: crate::backend::backend_name().to_string(),
            model: model.clone(),
            graph: LayerGraph::from_config(model),
            loss: LOSS_NAME.to_string(),
            metrics: METRIC_NAMES.iter().map(|m| m.to_string()).collect(),
            custom_objects: CUSTOM_OBJECTS.iter().map(|m| m.to_string()).collect(),
            epoch,
            val_loss,
            training,
        }
    }

    /// Reject sidecars this build cannot honor
    pub fn check(&self) -> Result<()> {
        if self.version != ARTIFACT_VERSION {
            return Err(LandcoverError::Model(format!(
                "artifact version {} is not supported (expected {})",
                self.version, ARTIFACT_VERSION
            )));
        }
        let unknown: Vec<&str> = self
            .custom_objects
            .iter()
            .chain(std::iter::once(&self.loss))
            .map(|s| s.as_str())
            .filter(|name| !is_registered(name))
            .collect();
        if !unknown.is_empty() {
            return Err(LandcoverError::Model(format!(
                "artifact references unknown custom objects: {}",
                unknown.join(", ")
            )));
        }
        if self.graph != LayerGraph::from_config(&self.model) {
            return Err(LandcoverError::Model(
                "stored layer graph does not match the stored model config".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write weights and sidecar for `model` under `stem`
pub fn save_model<B: Backend>(model: &UNet<B>, meta: &ArtifactMeta, stem: &Path) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::for_stem(stem);
    if let Some(parent) = paths.weights.parent() {
        std::fs::create_dir_all(parent)?;
    }

    model
        .clone()
        .save_file(paths.weights.clone(), &ArtifactRecorder::new())
        .map_err(|e| LandcoverError::Model(format!("Failed to save model: {:?}", e)))?;

    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(&paths.meta, json)?;

    debug!("Saved model weights to {:?}", paths.weights);
    Ok(paths)
}

/// Write optimizer state next to the weights of `stem`
pub fn save_optimizer<B, O>(optimizer: &O, stem: &Path) -> Result<PathBuf>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let path = ArtifactPaths::for_stem(stem).optimizer;
    Recorder::<B>::record(&ArtifactRecorder::new(), optimizer.to_record(), path.clone())?;
    debug!("Saved optimizer state to {:?}", path);
    Ok(path)
}

/// Read and check the sidecar of `stem`
pub fn load_meta(stem: &Path) -> Result<ArtifactMeta> {
    let path = ArtifactPaths::for_stem(stem).meta;
    let text = std::fs::read_to_string(&path).map_err(|e| {
        LandcoverError::Model(format!("cannot read artifact metadata {:?}: {}", path, e))
    })?;
    let meta: ArtifactMeta = serde_json::from_str(&text)?;
    meta.check()?;
    Ok(meta)
}

/// Rebuild a model from the artifact at `stem`
pub fn load_model<B: Backend>(stem: &Path, device: &B::Device) -> Result<(UNet<B>, ArtifactMeta)> {
    let meta = load_meta(stem)?;
    let paths = ArtifactPaths::for_stem(stem);
    info!("Loading model from {:?}", paths.weights);

    let model = meta
        .model
        .init::<B>(device)
        .load_file(paths.weights, &ArtifactRecorder::new(), device)
        .map_err(|e| LandcoverError::Model(format!("Failed to load model: {:?}", e)))?;

    Ok((model, meta))
}

/// Restore optimizer state saved under `stem`
pub fn load_optimizer<B, O>(optimizer: O, stem: &Path, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let path = ArtifactPaths::for_stem(stem).optimizer;
    let record = Recorder::<B>::load(&ArtifactRecorder::new(), path, device)?;
    Ok(optimizer.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use burn::tensor::{Distribution, Tensor};

    type TestBackend = NdArray<f32>;

    fn meta(config: &UNetConfig) -> ArtifactMeta {
        ArtifactMeta::new(
            config,
            TrainingParams {
                epochs: 1,
                batch_size: 2,
                buffer_size: 4,
                learning_rate: 1e-3,
                seed: 0,
                kernel_size: 32,
                bands: vec!["R".into(), "G".into(), "B".into()],
                response: "label".into(),
            },
            1,
            Some(0.5),
        )
    }

    #[test]
    fn test_paths_for_stem() {
        let paths = ArtifactPaths::for_stem(Path::new("/out/run/model_epoch_10"));
        assert_eq!(paths.weights, PathBuf::from("/out/run/model_epoch_10.mpk"));
        assert_eq!(paths.optimizer, PathBuf::from("/out/run/model_epoch_10.optim.mpk"));
        assert_eq!(paths.meta, PathBuf::from("/out/run/model_epoch_10.json"));
        assert_eq!(ArtifactPaths::for_stem(Path::new("/out/m.mpk")).meta, PathBuf::from("/out/m.json"));
    }

    #[test]
    fn test_save_load_round_trip_restores_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("nested").join("bestmodel");
        let device = Default::default();
        let config = UNetConfig::new().with_base_filters(2).with_depth(2);
        let model: UNet<TestBackend> = config.init(&device);

        save_model(&model, &meta(&config), &stem).unwrap();
        let (restored, restored_meta) = load_model::<TestBackend>(&stem, &device).unwrap();
        assert_eq!(restored_meta.model, config);
        assert_eq!(restored_meta.epoch, 1);

        let input = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Default, &device);
        let a: Vec<f32> = model.forward(input.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = restored.forward(input).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_custom_object_rejected() {
        let config = UNetConfig::new().with_depth(1);
        let mut m = meta(&config);
        m.custom_objects.push("focal_tversky".to_string());
        let err = m.check().unwrap_err();
        assert!(err.to_string().contains("focal_tversky"));
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_meta(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_optimizer_round_trip() {
        type Train = Autodiff<TestBackend>;
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model");
        let device = Default::default();

        let optimizer = AdamConfig::new().init::<Train, UNet<Train>>();
        let path = save_optimizer::<Train, _>(&optimizer, &stem).unwrap();
        assert!(path.exists());

        let fresh = AdamConfig::new().init::<Train, UNet<Train>>();
        load_optimizer::<Train, _>(fresh, &stem, &device).unwrap();
    }
}
