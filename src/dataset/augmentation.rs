//! Geometric augmentation for segmentation pairs
//!
//! One uniform draw per pair picks a [`Transform`]; the same transform is
//! applied to the input bands and to the label so pixels stay aligned.
//!
//! # Probability bands
//!
//! | draw        | transform            |
//! |-------------|----------------------|
//! | `[0.0,0.1)` | flip left-right      |
//! | `[0.1,0.2)` | flip up-down         |
//! | `[0.2,0.3)` | flip both            |
//! | `[0.3,0.4)` | rotate 90° CCW       |
//! | `[0.4,0.5)` | rotate 180°          |
//! | `[0.5,0.6)` | rotate 270° CCW      |
//! | `[0.6,1.0)` | unchanged            |

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::tuple::{Patch, TrainingPair};

/// Dihedral transforms used for augmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    Identity,
    /// Mirror columns (left-right)
    FlipH,
    /// Mirror rows (up-down)
    FlipV,
    FlipHV,
    /// Quarter turn counter-clockwise
    Rot90,
    Rot180,
    /// Three quarter turns counter-clockwise
    Rot270,
}

impl Transform {
    /// Map a uniform draw in `[0, 1)` to its transform
    pub fn select(x: f32) -> Self {
        if x < 0.1 {
            Transform::FlipH
        } else if x < 0.2 {
            Transform::FlipV
        } else if x < 0.3 {
            Transform::FlipHV
        } else if x < 0.4 {
            Transform::Rot90
        } else if x < 0.5 {
            Transform::Rot180
        } else if x < 0.6 {
            Transform::Rot270
        } else {
            Transform::Identity
        }
    }

    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::select(rng.gen::<f32>())
    }

    /// Apply to one channel-last patch
    pub fn apply(self, patch: &Patch) -> Patch {
        let (h, w) = (patch.height, patch.width);
        match self {
            Transform::Identity => patch.clone(),
            Transform::FlipH => remap(patch, h, w, |i, j| (i, w - 1 - j)),
            Transform::FlipV => remap(patch, h, w, |i, j| (h - 1 - i, j)),
            Transform::FlipHV | Transform::Rot180 => {
                remap(patch, h, w, |i, j| (h - 1 - i, w - 1 - j))
            }
            Transform::Rot90 => remap(patch, w, h, |i, j| (j, w - 1 - i)),
            Transform::Rot270 => remap(patch, w, h, |i, j| (h - 1 - j, i)),
        }
    }

    /// Apply to input and label together
    pub fn apply_pair(self, pair: &TrainingPair) -> TrainingPair {
        TrainingPair {
            input: self.apply(&pair.input),
            label: self.apply(&pair.label),
        }
    }
}

/// Build an `out_h × out_w` patch whose pixel `(i, j)` comes from `src(i, j)`
fn remap<F>(patch: &Patch, out_h: usize, out_w: usize, src: F) -> Patch
where
    F: Fn(usize, usize) -> (usize, usize),
{
    let c = patch.channels;
    let mut data = Vec::with_capacity(patch.data.len());
    for i in 0..out_h {
        for j in 0..out_w {
            let (r, s) = src(i, j);
            let start = patch.index(r, s, 0);
            data.extend_from_slice(&patch.data[start..start + c]);
        }
    }
    Patch::new(out_h, out_w, c, data)
}

/// Per-example RNG independent of worker scheduling
pub fn example_rng(seed: u64, epoch: usize, index: usize) -> ChaCha8Rng {
    let mixed = seed ^ ((epoch as u64) << 40) ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    ChaCha8Rng::seed_from_u64(mixed)
}

/// Draw a transform for example `index` of `epoch` and apply it
pub fn random_transform(pair: &TrainingPair, seed: u64, epoch: usize, index: usize) -> TrainingPair {
    let mut rng = example_rng(seed, epoch, index);
    Transform::sample(&mut rng).apply_pair(pair)
}
