//! Layer graph: the U-Net described as data
//!
//! An ordered list of typed layers with named inputs, built from the same
//! [`UNetConfig`] as the burn module. It drives the printed model summary and
//! is stored in the artifact sidecar.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::unet::UNetConfig;
use crate::utils::error::{LandcoverError, Result};
use crate::utils::format_number;

/// Layer types appearing in the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Input { channels: usize },
    Conv2d { in_channels: usize, out_channels: usize, kernel: usize },
    BatchNorm { channels: usize },
    Relu,
    MaxPool { size: usize, stride: usize },
    ConvTranspose2d { in_channels: usize, out_channels: usize, kernel: usize, stride: usize },
    Concat,
    Sigmoid,
}

impl LayerKind {
    /// Learned parameters (weights, biases, BN scale and shift)
    pub fn trainable_params(&self) -> usize {
        match *self {
            LayerKind::Conv2d {
                in_channels,
                out_channels,
                kernel,
            }
            | LayerKind::ConvTranspose2d {
                in_channels,
                out_channels,
                kernel,
                ..
            } => in_channels * out_channels * kernel * kernel + out_channels,
            LayerKind::BatchNorm { channels } => 2 * channels,
            _ => 0,
        }
    }

    /// Running statistics (BN mean and variance)
    pub fn non_trainable_params(&self) -> usize {
        match *self {
            LayerKind::BatchNorm { channels } => 2 * channels,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "Input",
            LayerKind::Conv2d { .. } => "Conv2d",
            LayerKind::BatchNorm { .. } => "BatchNorm",
            LayerKind::Relu => "Relu",
            LayerKind::MaxPool { .. } => "MaxPool2d",
            LayerKind::ConvTranspose2d { .. } => "ConvTranspose2d",
            LayerKind::Concat => "Concatenate",
            LayerKind::Sigmoid => "Sigmoid",
        }
    }
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    /// Names of the layers feeding this one
    pub inputs: Vec<String>,
    pub out_channels: usize,
    /// Output side relative to the input (1 = full resolution, 2 = half, ...)
    pub downsample: usize,
}

/// Ordered U-Net description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerGraph {
    pub layers: Vec<LayerSpec>,
}

struct GraphBuilder {
    layers: Vec<LayerSpec>,
    index: HashMap<String, usize>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            layers: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn layer(&self, name: &str) -> &LayerSpec {
        &self.layers[self.index[name]]
    }

    fn add(&mut self, name: String, kind: LayerKind, inputs: Vec<String>) -> String {
        let first = inputs.first().map(|i| self.layer(i).clone());
        let (out_channels, downsample) = match (&kind, &first) {
            (LayerKind::Input { channels }, _) => (*channels, 1),
            (LayerKind::Conv2d { out_channels, .. }, Some(src)) => (*out_channels, src.downsample),
            (LayerKind::ConvTranspose2d { out_channels, stride, .. }, Some(src)) => {
                (*out_channels, src.downsample / stride)
            }
            (LayerKind::MaxPool { stride, .. }, Some(src)) => {
                (src.out_channels, src.downsample * stride)
            }
            (LayerKind::Concat, Some(src)) => (
                inputs.iter().map(|i| self.layer(i).out_channels).sum(),
                src.downsample,
            ),
            (_, Some(src)) => (src.out_channels, src.downsample),
            (_, None) => (0, 1),
        };

        self.index.insert(name.clone(), self.layers.len());
        self.layers.push(LayerSpec {
            name: name.clone(),
            kind,
            inputs,
            out_channels,
            downsample,
        });
        name
    }

    /// conv → bn → relu, twice
    fn conv_block(&mut self, prefix: &str, input: String, filters: usize) -> String {
        let mut x = input;
        for i in 1..=2 {
            let in_channels = self.layer(&x).out_channels;
            x = self.add(
                format!("{}_conv{}", prefix, i),
                LayerKind::Conv2d {
                    in_channels,
                    out_channels: filters,
                    kernel: 3,
                },
                vec![x],
            );
            x = self.add(
                format!("{}_bn{}", prefix, i),
                LayerKind::BatchNorm { channels: filters },
                vec![x],
            );
            x = self.add(format!("{}_relu{}", prefix, i), LayerKind::Relu, vec![x]);
        }
        x
    }
}

impl LayerGraph {
    /// Describe the network built by `UNet::new(config)`
    pub fn from_config(config: &UNetConfig) -> Self {
        let mut g = GraphBuilder::new();
        let mut x = g.add(
            "input".to_string(),
            LayerKind::Input {
                channels: config.in_channels,
            },
            Vec::new(),
        );

        let filters = config.encoder_filters();
        let mut skips = Vec::with_capacity(filters.len());
        for (level, &f) in filters.iter().enumerate() {
            let skip = g.conv_block(&format!("encoder{}", level), x, f);
            x = g.add(
                format!("encoder{}_pool", level),
                LayerKind::MaxPool { size: 2, stride: 2 },
                vec![skip.clone()],
            );
            skips.push(skip);
        }

        x = g.conv_block("center", x, config.center_filters());

        for (level, &f) in filters.iter().enumerate().rev() {
            let in_channels = g.layer(&x).out_channels;
            let up = g.add(
                format!("decoder{}_up", level),
                LayerKind::ConvTranspose2d {
                    in_channels,
                    out_channels: f,
                    kernel: 2,
                    stride: 2,
                },
                vec![x],
            );
            let skip = skips[level].clone();
            let cat = g.add(format!("decoder{}_concat", level), LayerKind::Concat, vec![skip, up]);
            let bn = g.add(
                format!("decoder{}_bn", level),
                LayerKind::BatchNorm { channels: 2 * f },
                vec![cat],
            );
            let relu = g.add(format!("decoder{}_relu", level), LayerKind::Relu, vec![bn]);
            x = g.conv_block(&format!("decoder{}", level), relu, f);
        }

        let in_channels = g.layer(&x).out_channels;
        x = g.add(
            "head_conv".to_string(),
            LayerKind::Conv2d {
                in_channels,
                out_channels: config.num_classes,
                kernel: 1,
            },
            vec![x],
        );
        g.add("head_sigmoid".to_string(), LayerKind::Sigmoid, vec![x]);

        Self { layers: g.layers }
    }

    pub fn trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.kind.trainable_params()).sum()
    }

    pub fn non_trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.kind.non_trainable_params()).sum()
    }

    /// All parameter tensors' elements, running statistics included
    pub fn total_params(&self) -> usize {
        self.trainable_params() + self.non_trainable_params()
    }

    pub fn output_channels(&self) -> usize {
        self.layers.last().map(|l| l.out_channels).unwrap_or(0)
    }

    /// Every input names an earlier layer and concatenated inputs share a resolution
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, &LayerSpec> = HashMap::new();
        for layer in &self.layers {
            for input in &layer.inputs {
                if !seen.contains_key(input.as_str()) {
                    return Err(LandcoverError::Model(format!(
                        "layer '{}' consumes unknown layer '{}'",
                        layer.name, input
                    )));
                }
            }
            if layer.kind == LayerKind::Concat {
                let scales: Vec<usize> = layer.inputs.iter().map(|i| seen[i.as_str()].downsample).collect();
                if scales.windows(2).any(|w| w[0] != w[1]) {
                    return Err(LandcoverError::Model(format!(
                        "layer '{}' concatenates inputs of different resolution",
                        layer.name
                    )));
                }
            }
            if seen.insert(layer.name.as_str(), layer).is_some() {
                return Err(LandcoverError::Model(format!(
                    "duplicate layer name '{}'",
                    layer.name
                )));
            }
        }
        Ok(())
    }

    /// Keras-style table of layers
    pub fn summary(&self) -> String {
        let rule = "=".repeat(96);
        let thin = "-".repeat(96);
        let mut out = String::new();
        out.push_str(&format!(
            "{:<22} {:<16} {:>9} {:>12}  {}\n",
            "Layer", "Type", "Channels", "Params", "Connected to"
        ));
        out.push_str(&rule);
        out.push('\n');
        for layer in &self.layers {
            let params = layer.kind.trainable_params() + layer.kind.non_trainable_params();
            out.push_str(&format!(
                "{:<22} {:<16} {:>9} {:>12}  {}\n",
                layer.name,
                layer.kind.name(),
                layer.out_channels,
                format_number(params),
                layer.inputs.join(", ")
            ));
        }
        out.push_str(&thin);
        out.push('\n');
        out.push_str(&format!("Total params: {}\n", format_number(self.total_params())));
        out.push_str(&format!(
            "Trainable params: {}\n",
            format_number(self.trainable_params())
        ));
        out.push_str(&format!(
            "Non-trainable params: {}\n",
            format_number(self.non_trainable_params())
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::unet::UNet;
    use burn::backend::NdArray;
    use burn::module::Module;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_default_graph_is_valid() {
        let graph = LayerGraph::from_config(&UNetConfig::new());
        graph.validate().unwrap();
        assert_eq!(graph.output_channels(), 2);
        assert_eq!(graph.layers.first().unwrap().name, "input");
        assert_eq!(graph.layers.last().unwrap().kind, LayerKind::Sigmoid);

        let center = graph
            .layers
            .iter()
            .find(|l| l.name == "center_relu2")
            .unwrap();
        assert_eq!(center.out_channels, 512);
        assert_eq!(center.downsample, 32);
    }

    #[test]
    fn test_decoder_concat_channels() {
        let graph = LayerGraph::from_config(&UNetConfig::new());
        let cat = graph
            .layers
            .iter()
            .find(|l| l.name == "decoder4_concat")
            .unwrap();
        assert_eq!(cat.inputs, vec!["encoder4_relu2", "decoder4_up"]);
        assert_eq!(cat.out_channels, 512);
    }

    #[test]
    fn test_param_count_matches_module() {
        let device = Default::default();
        for config in [
            UNetConfig::new().with_base_filters(2).with_depth(2),
            UNetConfig::new().with_base_filters(4).with_in_channels(4),
        ] {
            let graph = LayerGraph::from_config(&config);
            let model: UNet<TestBackend> = config.init(&device);
            assert_eq!(graph.total_params(), model.num_params());
        }
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut graph = LayerGraph::from_config(&UNetConfig::new().with_depth(1));
        graph.layers[1].inputs = vec!["missing".to_string()];
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_summary_lists_totals() {
        let graph = LayerGraph::from_config(&UNetConfig::new());
        let summary = graph.summary();
        assert!(summary.contains("encoder0_conv1"));
        assert!(summary.contains("Total params"));
        assert!(summary.contains(&format_number(graph.trainable_params())));
    }
}
