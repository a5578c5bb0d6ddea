//! Feature stacking into (input, label) training pairs

use super::example::{FeatureMap, FeatureSchema};
use crate::utils::error::{LandcoverError, Result};

/// Channel-last (H×W×C) float patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Patch {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), height * width * channels);
        Self {
            height,
            width,
            channels,
            data,
        }
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize, channel: usize) -> usize {
        (row * self.width + col) * self.channels + channel
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize, channel: usize) -> f32 {
        self.data[self.index(row, col, channel)]
    }

    /// Same pixels, channels reordered to C×H×W
    pub fn to_chw(&self) -> Vec<f32> {
        let plane = self.height * self.width;
        let mut out = vec![0.0; self.data.len()];
        for (pixel, values) in self.data.chunks_exact(self.channels).enumerate() {
            for (c, v) in values.iter().enumerate() {
                out[c * plane + pixel] = *v;
            }
        }
        out
    }
}

/// Model input and its two-channel label
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    /// H×W×bands
    pub input: Patch,
    /// H×W×2: the label and its complement
    pub label: Patch,
}

/// Stack `bands…, response` in declared order, split bands from the label
/// and append `1 - label` as a second label channel.
pub fn to_tuple(features: &FeatureMap, schema: &FeatureSchema, side: usize) -> Result<TrainingPair> {
    let names = schema.names();
    if names.len() < 2 {
        return Err(LandcoverError::Dataset(
            "schema needs at least one band and one label feature".to_string(),
        ));
    }
    let plane = side * side;
    let num_bands = names.len() - 1;

    let columns: Vec<&[f32]> = names
        .iter()
        .map(|name| {
            features
                .get(name)
                .filter(|v| v.len() == plane)
                .map(|v| v.as_slice())
                .ok_or_else(|| {
                    LandcoverError::Dataset(format!(
                        "feature '{}' missing or not {}x{}",
                        name, side, side
                    ))
                })
        })
        .collect::<Result<_>>()?;

    let mut input = Vec::with_capacity(plane * num_bands);
    let mut label = Vec::with_capacity(plane * 2);
    for pixel in 0..plane {
        for band in &columns[..num_bands] {
            input.push(band[pixel]);
        }
        let y = columns[num_bands][pixel];
        label.push(y);
        label.push(1.0 - y);
    }

    Ok(TrainingPair {
        input: Patch::new(side, side, num_bands, input),
        label: Patch::new(side, side, 2, label),
    })
}
