//! Training Configuration
//!
//! The YAML file handed to the binary with `--config`. It is loaded once,
//! validated, and then passed by reference to every stage of the run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::error::{LandcoverError, Result};
use crate::utils::logging::LogLevel;

/// Patch side length must be divisible by 2^5 so the five pooling levels
/// line up with their skip connections.
pub const SPATIAL_MULTIPLE: usize = 32;

/// Immutable run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainConfig {
    /// Name of the run; artifacts go to `<output_dir>/<experiment_name>/`
    pub experiment_name: String,
    /// Root directory for artifacts
    pub output_dir: PathBuf,
    /// Seed for shuffling and augmentation
    pub seed: u64,
    /// Number of passes over the training set
    pub epochs: usize,
    /// Examples per batch
    pub batch_size: usize,
    /// Capacity of the shuffle buffer; must exceed `batch_size`
    pub buffer_size: usize,
    /// Epochs without val_loss improvement before stopping (0 disables)
    pub early_stopping_patience: usize,

    /// Glob over training record files
    #[serde(default = "default_training_pattern")]
    pub training_pattern: String,
    /// Glob over validation record files
    #[serde(default = "default_testing_pattern")]
    pub testing_pattern: String,
    /// Input band feature names, in channel order
    #[serde(default = "default_bands")]
    pub bands: Vec<String>,
    /// Label feature name
    #[serde(default = "default_response")]
    pub response: String,
    /// Patch side length in pixels
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Adam learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Decode/augment worker threads
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Batches buffered between the producer and the fit loop
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,
    /// Artifact stem to resume from
    #[serde(default)]
    pub initial_model: Option<PathBuf>,
    /// trace | debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_training_pattern() -> String {
    "data/training/*".to_string()
}

fn default_testing_pattern() -> String {
    "data/testing/*".to_string()
}

fn default_bands() -> Vec<String> {
    vec!["R".to_string(), "G".to_string(), "B".to_string()]
}

fn default_response() -> String {
    "label".to_string()
}

fn default_kernel_size() -> usize {
    256
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_num_workers() -> usize {
    5
}

fn default_prefetch_batches() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TrainConfig {
    /// Read and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LandcoverError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// Parse and validate YAML text; `origin` is only used in messages
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self> {
        let config: TrainConfig =
            serde_yaml::from_str(text).map_err(|source| LandcoverError::ConfigParse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(invalid("experiment_name must not be empty"));
        }

        if self.epochs == 0 {
            return Err(invalid("epochs must be at least 1"));
        }

        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }

        if self.buffer_size <= self.batch_size {
            return Err(invalid(&format!(
                "buffer_size ({}) must be larger than batch_size ({})",
                self.buffer_size, self.batch_size
            )));
        }

        if self.kernel_size == 0 || self.kernel_size % SPATIAL_MULTIPLE != 0 {
            return Err(invalid(&format!(
                "kernel_size ({}) must be a positive multiple of {}",
                self.kernel_size, SPATIAL_MULTIPLE
            )));
        }

        if self.bands.is_empty() {
            return Err(invalid("bands must name at least one feature"));
        }

        if self.bands.iter().any(|b| b == &self.response) {
            return Err(invalid(&format!(
                "response '{}' is also listed as a band",
                self.response
            )));
        }

        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(invalid("learning_rate must be a positive number"));
        }

        if self.num_workers == 0 {
            return Err(invalid("num_workers must be at least 1"));
        }

        if self.prefetch_batches == 0 {
            return Err(invalid("prefetch_batches must be at least 1"));
        }

        let mut paths = vec![
            ("output_dir", self.output_dir.to_string_lossy().into_owned()),
            ("training_pattern", self.training_pattern.clone()),
            ("testing_pattern", self.testing_pattern.clone()),
        ];
        if let Some(stem) = &self.initial_model {
            paths.push(("initial_model", stem.to_string_lossy().into_owned()));
        }
        for (key, value) in paths {
            if is_remote(&value) {
                return Err(invalid(&format!(
                    "{} '{}' points at remote storage; only local paths are supported",
                    key, value
                )));
            }
        }

        Ok(())
    }

    /// Feature names in record order: bands then the response
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = self.bands.clone();
        names.push(self.response.clone());
        names
    }

    /// Directory receiving every artifact of this run
    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir.join(&self.experiment_name)
    }

    /// Stem of the best-on-validation checkpoint
    pub fn best_model_stem(&self) -> PathBuf {
        self.experiment_dir().join(format!(
            "epochs_{}_batchSize_{}_bufferSize_{}_bestmodel",
            self.epochs, self.batch_size, self.buffer_size
        ))
    }

    /// Stem of the model persisted after the fit loop
    pub fn final_model_stem(&self) -> PathBuf {
        self.experiment_dir().join(format!(
            "model_epoch_{}_batchSize_{}_bufferSize_{}",
            self.epochs, self.batch_size, self.buffer_size
        ))
    }

    /// TensorBoard log root
    pub fn logs_dir(&self) -> PathBuf {
        self.experiment_dir().join("logs")
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level)
    }
}

fn invalid(msg: &str) -> LandcoverError {
    LandcoverError::Config(msg.to_string())
}

fn is_remote(path: &str) -> bool {
    match path.find("://") {
        Some(idx) => {
            let scheme = &path[..idx];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
experiment_name: pv_mapping
output_dir: /tmp/runs
seed: 42
epochs: 10
batch_size: 64
buffer_size: 320
early_stopping_patience: 5
";

    fn parse(text: &str) -> Result<TrainConfig> {
        TrainConfig::from_yaml_str(text, Path::new("test.yml"))
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.experiment_name, "pv_mapping");
        assert_eq!(config.bands, vec!["R", "G", "B"]);
        assert_eq!(config.response, "label");
        assert_eq!(config.kernel_size, 256);
        assert_eq!(config.num_workers, 5);
        assert_eq!(config.training_pattern, "data/training/*");
        assert!(config.initial_model.is_none());
        assert_eq!(config.log_level(), LogLevel::Info);
    }

    #[test]
    fn test_missing_required_key() {
        let text = MINIMAL.replace("seed: 42\n", "");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, LandcoverError::ConfigParse { .. }));
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn test_buffer_must_exceed_batch() {
        let text = MINIMAL.replace("buffer_size: 320", "buffer_size: 64");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, LandcoverError::Config(_)));
    }

    #[test]
    fn test_zero_batch_and_epochs_rejected() {
        assert!(parse(&MINIMAL.replace("batch_size: 64", "batch_size: 0")).is_err());
        assert!(parse(&MINIMAL.replace("epochs: 10", "epochs: 0")).is_err());
    }

    #[test]
    fn test_kernel_size_multiple_of_32() {
        let text = format!("{}kernel_size: 100\n", MINIMAL);
        assert!(parse(&text).is_err());
        let text = format!("{}kernel_size: 64\n", MINIMAL);
        assert_eq!(parse(&text).unwrap().kernel_size, 64);
    }

    #[test]
    fn test_remote_paths_rejected() {
        let text = MINIMAL.replace("/tmp/runs", "gs://pv_mapping/model_data");
        let err = parse(&text).unwrap_err();
        assert!(err.to_string().contains("remote"));
        assert!(!is_remote("data/training/*"));
        assert!(!is_remote("C:/data/*"));
    }

    #[test]
    fn test_artifact_names() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(
            config.best_model_stem(),
            PathBuf::from("/tmp/runs/pv_mapping/epochs_10_batchSize_64_bufferSize_320_bestmodel")
        );
        assert_eq!(
            config.final_model_stem(),
            PathBuf::from("/tmp/runs/pv_mapping/model_epoch_10_batchSize_64_bufferSize_320")
        );
        assert_eq!(config.feature_names(), vec!["R", "G", "B", "label"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = TrainConfig::load(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(matches!(err, LandcoverError::Config(_)));
    }
}
