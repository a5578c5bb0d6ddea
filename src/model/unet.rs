//! U-Net for binary land-cover segmentation
//!
//! Five encoder levels (16 → 256 filters by default), a 512-filter center
//! block and five mirrored decoder levels with skip connections. The head is
//! a 1×1 convolution followed by an independent sigmoid per output channel.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::utils::error::LandcoverError;

/// Configuration for the U-Net
#[derive(Config, Debug, PartialEq)]
pub struct UNetConfig {
    /// Number of input bands
    #[config(default = "3")]
    pub in_channels: usize,

    /// Output channels (label + complement)
    #[config(default = "2")]
    pub num_classes: usize,

    /// Filters of the first encoder level; doubled at each level
    #[config(default = "16")]
    pub base_filters: usize,

    /// Number of encoder (and decoder) levels
    #[config(default = "5")]
    pub depth: usize,
}

impl UNetConfig {
    /// Filters per encoder level, shallowest first
    pub fn encoder_filters(&self) -> Vec<usize> {
        (0..self.depth).map(|i| self.base_filters << i).collect()
    }

    pub fn center_filters(&self) -> usize {
        self.base_filters << self.depth
    }

    /// Spatial dims must survive `depth` halvings exactly
    pub fn spatial_multiple(&self) -> usize {
        1 << self.depth
    }

    /// Check that an `height × width` input lines up with every skip
    pub fn check_spatial(&self, height: usize, width: usize) -> crate::utils::error::Result<()> {
        let m = self.spatial_multiple();
        if height == 0 || width == 0 || height % m != 0 || width % m != 0 {
            return Err(LandcoverError::Model(format!(
                "input {}x{} is not a multiple of {}",
                height, width, m
            )));
        }
        Ok(())
    }

    /// Initialize a model on `device`
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        UNet::new(self, device)
    }
}

/// Two × [3×3 conv "same" → BatchNorm → ReLU]
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub relu: Relu,
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3(in_channels, out_channels, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        self.relu.forward(self.bn2.forward(self.conv2.forward(x)))
    }
}

/// Conv block followed by 2×2/2 max pooling
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub block: ConvBlock<B>,
    pub pool: MaxPool2d,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            block: ConvBlock::new(in_channels, out_channels, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Returns `(pooled, skip)`
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip = self.block.forward(x);
        (self.pool.forward(skip.clone()), skip)
    }
}

/// 2×2/2 transposed conv → concat [skip, up] → BatchNorm → ReLU → conv block
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub up: ConvTranspose2d<B>,
    pub bn: BatchNorm<B>,
    pub block: ConvBlock<B>,
    pub relu: Relu,
}

impl<B: Backend> DecoderBlock<B> {
    /// `skip_channels` must equal `out_channels` in a standard U-Net
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            bn: BatchNormConfig::new(out_channels * 2).init(device),
            block: ConvBlock::new(out_channels * 2, out_channels, device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = self.up.forward(x);
        let x = Tensor::cat(vec![skip, up], 1);
        let x = self.relu.forward(self.bn.forward(x));
        self.block.forward(x)
    }
}

/// U-Net segmentation model
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub encoders: Vec<EncoderBlock<B>>,
    pub center: ConvBlock<B>,
    /// Deepest level first
    pub decoders: Vec<DecoderBlock<B>>,
    pub head: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    pub fn new(config: &UNetConfig, device: &B::Device) -> Self {
        let filters = config.encoder_filters();

        let mut encoders = Vec::with_capacity(filters.len());
        let mut in_channels = config.in_channels;
        for &f in &filters {
            encoders.push(EncoderBlock::new(in_channels, f, device));
            in_channels = f;
        }

        let center = ConvBlock::new(in_channels, config.center_filters(), device);

        let mut decoders = Vec::with_capacity(filters.len());
        let mut in_channels = config.center_filters();
        for &f in filters.iter().rev() {
            decoders.push(DecoderBlock::new(in_channels, f, device));
            in_channels = f;
        }

        let head = Conv2dConfig::new([in_channels, config.num_classes], [1, 1]).init(device);

        Self {
            encoders,
            center,
            decoders,
            head,
        }
    }

    /// Per-channel probabilities
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, bands, height, width]
    ///
    /// # Returns
    /// * Tensor of shape [batch_size, num_classes, height, width] in (0, 1)
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut x = x;
        for encoder in &self.encoders {
            let (pooled, skip) = encoder.forward(x);
            skips.push(skip);
            x = pooled;
        }

        let mut x = self.center.forward(x);
        for decoder in &self.decoders {
            // Decoders run deepest first, matching the reversed skip stack.
            let skip = match skips.pop() {
                Some(skip) => skip,
                None => break,
            };
            x = decoder.forward(x, skip);
        }

        sigmoid(self.head.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> UNetConfig {
        UNetConfig::new().with_base_filters(2).with_depth(2)
    }

    #[test]
    fn test_default_filters() {
        let config = UNetConfig::new();
        assert_eq!(config.encoder_filters(), vec![16, 32, 64, 128, 256]);
        assert_eq!(config.center_filters(), 512);
        assert_eq!(config.spatial_multiple(), 32);
    }

    #[test]
    fn test_check_spatial() {
        let config = UNetConfig::new();
        assert!(config.check_spatial(256, 256).is_ok());
        assert!(config.check_spatial(64, 32).is_ok());
        assert!(config.check_spatial(100, 256).is_err());
        assert!(config.check_spatial(0, 32).is_err());
    }

    #[test]
    fn test_forward_shape_and_range() {
        let device = Default::default();
        let model: UNet<TestBackend> = small_config().init(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 8, 8],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let output = model.forward(input);
        assert_eq!(output.dims(), [2, 2, 8, 8]);

        let values: Vec<f32> = output.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_full_depth_forward() {
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new().with_base_filters(1).init(&device);
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(input).dims(), [1, 2, 32, 32]);
    }
}
