//! Burn Batcher for segmentation pairs
//!
//! Converts channel-last [`TrainingPair`]s into NCHW tensors on the target
//! device.

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{backend::Backend, Tensor, TensorData};

use super::tuple::{Patch, TrainingPair};

/// A batch ready for the model
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Input bands with shape [batch_size, bands, height, width]
    pub images: Tensor<B, 4>,
    /// Label and complement with shape [batch_size, 2, height, width]
    pub masks: Tensor<B, 4>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks training pairs into tensors
#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

impl SegmentationBatcher {
    pub fn new() -> Self {
        Self
    }
}

fn stack<B: Backend>(patches: Vec<&Patch>, device: &B::Device) -> Tensor<B, 4> {
    let batch_size = patches.len();
    let (channels, height, width) = patches
        .first()
        .map(|p| (p.channels, p.height, p.width))
        .unwrap_or((0, 0, 0));

    let mut data = Vec::with_capacity(batch_size * channels * height * width);
    for patch in patches {
        data.extend(patch.to_chw());
    }

    Tensor::<B, 4>::from_data(
        TensorData::new(data, [batch_size, channels, height, width]),
        device,
    )
}

impl<B: Backend> Batcher<B, TrainingPair, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<TrainingPair>, device: &B::Device) -> SegmentationBatch<B> {
        let images = stack::<B>(items.iter().map(|p| &p.input).collect(), device);
        let masks = stack::<B>(items.iter().map(|p| &p.label).collect(), device);

        SegmentationBatch { images, masks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_is_nchw() {
        // 1x2 patch, 2 bands: pixel0 = (1, 10), pixel1 = (2, 20)
        let pair = TrainingPair {
            input: Patch::new(1, 2, 2, vec![1.0, 10.0, 2.0, 20.0]),
            label: Patch::new(1, 2, 2, vec![1.0, 0.0, 0.0, 1.0]),
        };
        let device = Default::default();
        let batch: SegmentationBatch<TestBackend> =
            SegmentationBatcher::new().batch(vec![pair.clone(), pair], &device);

        assert_eq!(batch.images.dims(), [2, 2, 1, 2]);
        assert_eq!(batch.masks.dims(), [2, 2, 1, 2]);
        assert_eq!(batch.len(), 2);

        let images: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert_eq!(&images[..4], &[1.0, 2.0, 10.0, 20.0]);
        let masks: Vec<f32> = batch.masks.into_data().to_vec().unwrap();
        assert_eq!(&masks[..4], &[1.0, 0.0, 0.0, 1.0]);
    }
}
