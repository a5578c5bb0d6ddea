//! Land-cover U-Net training CLI
//!
//! Reads one YAML configuration and runs a full training job with it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use landcover_unet::backend::{backend_name, default_device, TrainingBackend};
use landcover_unet::config::TrainConfig;
use landcover_unet::training;
use landcover_unet::utils::logging::LogConfig;

/// Train a U-Net for land-cover segmentation of satellite patches
#[derive(Parser, Debug)]
#[command(name = "landcover_unet")]
#[command(version)]
#[command(about = "U-Net land-cover segmentation training with Burn", long_about = None)]
struct Cli {
    /// Path to the YAML training configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose (debug) logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    print_banner();

    let config = TrainConfig::load(&cli.config)
        .with_context(|| format!("loading configuration {:?}", cli.config))?;

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig {
            level: config.log_level(),
            ..Default::default()
        }
    };

    println!("  Backend: {}", backend_name());
    println!();

    let summary = training::run::<TrainingBackend>(&config, log_config, default_device())
        .context("training failed")?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!("  Epochs run:          {}", summary.fit.epochs_run);
    println!("  Best val_loss:       {:.5}", summary.fit.best_val_loss);
    if summary.fit.stopped_early {
        println!("  {}", "Stopped early (no val_loss improvement)".yellow());
    }
    println!("  Best checkpoint:     {:?}", summary.best_model);
    println!("  Final model:         {:?}", summary.final_model.weights);
    println!();

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════╗
 ║   Land-cover U-Net                                       ║
 ║   Satellite patch segmentation with Burn + Rust          ║
 ╚══════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
