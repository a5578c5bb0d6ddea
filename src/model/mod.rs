//! Model module: U-Net definition, its layer graph and persisted artifacts

pub mod artifact;
pub mod graph;
pub mod unet;

pub use artifact::{load_model, save_model, ArtifactMeta, ArtifactPaths, TrainingParams};
pub use graph::{LayerGraph, LayerKind, LayerSpec};
pub use unet::{UNet, UNetConfig};
