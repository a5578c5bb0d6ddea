//! End-to-end training run
//!
//! Config → logging → datasets → model (fresh or resumed) → fit loop with
//! callbacks → final artifact.

use std::path::PathBuf;

use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use tracing::{info, warn};

use super::callbacks::{EarlyStopping, ModelCheckpoint, TensorBoardLogger};
use super::trainer::{FitSummary, Trainer};
use crate::config::TrainConfig;
use crate::dataset::SegmentationDataset;
use crate::model::artifact::{
    load_model, load_optimizer, save_model, save_optimizer, ArtifactMeta, ArtifactPaths,
    TrainingParams,
};
use crate::model::{LayerGraph, UNet, UNetConfig};
use crate::utils::error::{LandcoverError, Result, ResultExt};
use crate::utils::logging::{init_logging, LogConfig};
use crate::utils::format_number;

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub fit: FitSummary,
    pub best_model: PathBuf,
    pub final_model: ArtifactPaths,
    pub log_file: Option<PathBuf>,
}

/// Network for `config`: the default U-Net over the configured bands
pub fn model_config_for(config: &TrainConfig) -> UNetConfig {
    UNetConfig::new().with_in_channels(config.bands.len())
}

/// Run training as described by `config`
pub fn run<B: AutodiffBackend>(
    config: &TrainConfig,
    log_config: LogConfig,
    device: B::Device,
) -> Result<RunSummary> {
    run_with_model::<B>(config, model_config_for(config), log_config, device)
}

/// Same as [`run`] with an explicit network shape
pub fn run_with_model<B: AutodiffBackend>(
    config: &TrainConfig,
    model_config: UNetConfig,
    log_config: LogConfig,
    device: B::Device,
) -> Result<RunSummary> {
    let experiment_dir = config.experiment_dir();
    std::fs::create_dir_all(&experiment_dir)
        .with_context(|| format!("cannot create experiment directory {:?}", experiment_dir))?;

    let log_file = init_logging(&log_config.with_log_dir(&experiment_dir))?;
    println!("{}", "Initializing Training...".green().bold());
    info!("  Experiment: {}", config.experiment_name);
    info!("  Output:     {:?}", experiment_dir);
    if let Some(path) = &log_file {
        info!("  Log file:   {:?}", path);
    }

    println!("{}", "Loading Datasets...".cyan());
    let train = SegmentationDataset::from_pattern(&config.training_pattern, config)?;
    let validation = SegmentationDataset::from_pattern(&config.testing_pattern, config)?;

    println!("{}", "Creating Model...".cyan());
    let optimizer = AdamConfig::new().init::<B, UNet<B>>();
    let (model, model_config, optimizer) = match &config.initial_model {
        Some(stem) => resume::<B, _>(stem, optimizer, &device)?,
        None => (model_config.init::<B>(&device), model_config, optimizer),
    };

    if model_config.in_channels != config.bands.len() {
        return Err(LandcoverError::Config(format!(
            "model expects {} input bands but {} are configured",
            model_config.in_channels,
            config.bands.len()
        )));
    }
    model_config.check_spatial(config.kernel_size, config.kernel_size)?;

    let graph = LayerGraph::from_config(&model_config);
    graph.validate()?;
    info!("\n{}", graph.summary());

    println!("{}", "Training Configuration:".cyan().bold());
    info!("  Epochs:          {}", config.epochs);
    info!("  Batch size:      {}", config.batch_size);
    info!("  Shuffle buffer:  {}", config.buffer_size);
    info!("  Learning rate:   {}", config.learning_rate);
    info!("  Patch size:      {}x{}", config.kernel_size, config.kernel_size);
    info!("  Bands:           {}", config.bands.join(", "));
    info!("  Parameters:      {}", format_number(graph.total_params()));

    let params = TrainingParams::from_config(config);
    let best_model = config.best_model_stem();

    let mut trainer = Trainer::new(
        model,
        optimizer,
        model_config.clone(),
        config.learning_rate,
        device,
    );
    trainer.add_callback(Box::new(ModelCheckpoint::new(
        &best_model,
        model_config.clone(),
        params.clone(),
    )));
    trainer.add_callback(Box::new(TensorBoardLogger::new(&config.logs_dir())?));
    if config.early_stopping_patience > 0 {
        trainer.add_callback(Box::new(EarlyStopping::new(config.early_stopping_patience)));
    }

    println!("{}", "Starting Training...".green().bold());
    let fit = trainer.fit(&train, &validation, config.epochs)?;

    println!("{}", "Saving Model...".cyan());
    let final_stem = config.final_model_stem();
    let last_val_loss = fit.history.last().map(|logs| logs.val.loss);
    let meta = ArtifactMeta::new(&model_config, params, fit.epochs_run, last_val_loss);
    let final_model = save_model(&trainer.model, &meta, &final_stem)?;
    save_optimizer::<B, _>(trainer.optimizer(), &final_stem)?;
    info!("  Saved to: {:?}", final_model.weights);

    Ok(RunSummary {
        fit,
        best_model,
        final_model,
        log_file,
    })
}

/// Load weights (and optimizer state when present) from an earlier run
fn resume<B, O>(
    stem: &std::path::Path,
    optimizer: O,
    device: &B::Device,
) -> Result<(UNet<B>, UNetConfig, O)>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let (model, meta) = load_model::<B>(stem, device)?;
    info!("Resuming from {:?} (trained {} epochs)", stem, meta.epoch);

    let optimizer_path = ArtifactPaths::for_stem(stem).optimizer;
    let optimizer = if optimizer_path.exists() {
        load_optimizer::<B, O>(optimizer, stem, device)?
    } else {
        warn!("No optimizer state at {:?}; starting Adam fresh", optimizer_path);
        optimizer
    };

    Ok((model, meta.model, optimizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::write_shards;
    use crate::model::artifact::load_meta;
    use burn::backend::{Autodiff, NdArray};
    use std::path::Path;

    type TestBackend = Autodiff<NdArray<f32>>;

    const SIDE: usize = 32;

    fn config(root: &Path, epochs: usize, patience: usize) -> TrainConfig {
        let data = root.join("data");
        write_shards(&data.join("training"), SIDE);
        write_shards(&data.join("testing"), SIDE);
        let text = format!(
            "experiment_name: unit\n\
             output_dir: {out}\n\
             seed: 7\n\
             epochs: {epochs}\n\
             batch_size: 4\n\
             buffer_size: 8\n\
             early_stopping_patience: {patience}\n\
             training_pattern: {data}/training/*\n\
             testing_pattern: {data}/testing/*\n\
             kernel_size: {side}\n\
             num_workers: 2\n",
            out = root.join("runs").display(),
            data = data.display(),
            side = SIDE,
        );
        TrainConfig::from_yaml_str(&text, Path::new("unit.yml")).unwrap()
    }

    fn tiny(config: &TrainConfig) -> UNetConfig {
        model_config_for(config).with_base_filters(2)
    }

    #[test]
    fn test_run_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2, 0);

        let summary =
            run_with_model::<TestBackend>(&config, tiny(&config), LogConfig::default(), Default::default())
                .unwrap();

        assert_eq!(summary.fit.epochs_run, 2);
        assert!(summary.final_model.weights.exists());
        assert!(summary.final_model.optimizer.exists());
        assert!(summary.final_model.meta.exists());
        assert!(ArtifactPaths::for_stem(&summary.best_model).weights.exists());

        let exp = config.experiment_dir();
        assert!(summary.log_file.unwrap().starts_with(&exp));
        for stream in ["train", "validation"] {
            let files: Vec<_> = std::fs::read_dir(exp.join("logs").join(stream))
                .unwrap()
                .collect();
            assert_eq!(files.len(), 1);
        }

        let meta = load_meta(&config.final_model_stem()).unwrap();
        assert_eq!(meta.epoch, 2);
        assert_eq!(meta.model.base_filters, 2);
    }

    #[test]
    fn test_resume_from_best_model() {
        let dir = tempfile::tempdir().unwrap();
        let first = config(dir.path(), 1, 0);
        run_with_model::<TestBackend>(&first, tiny(&first), LogConfig::default(), Default::default())
            .unwrap();

        let mut second = first.clone();
        second.experiment_name = "resumed".to_string();
        second.initial_model = Some(first.final_model_stem());
        // The stored shape wins over the one passed in.
        let summary = run_with_model::<TestBackend>(
            &second,
            model_config_for(&second).with_base_filters(4),
            LogConfig::default(),
            Default::default(),
        )
        .unwrap();

        let meta = load_meta(&summary.final_model.weights).unwrap();
        assert_eq!(meta.model.base_filters, 2);
    }

    #[test]
    fn test_empty_pattern_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1, 0);
        config.training_pattern = dir.path().join("nothing/*").display().to_string();

        let err =
            run_with_model::<TestBackend>(&config, tiny(&config), LogConfig::default(), Default::default())
                .unwrap_err();
        assert!(matches!(err, LandcoverError::Dataset(_)));
    }

    #[test]
    fn test_band_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1, 0);
        let err = run_with_model::<TestBackend>(
            &config,
            tiny(&config).with_in_channels(5),
            LogConfig::default(),
            Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LandcoverError::Config(_)));
    }
}
