//! Segmentation metrics and the Dice loss
//!
//! All functions take `(y_true, y_pred)` as `[batch, channels, height, width]`
//! tensors with values in `[0, 1]`. Precision, recall and F1 count pixels after
//! clipping and rounding, with `EPSILON` in every denominator.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};

/// Fuzz factor for denominators
pub const EPSILON: f64 = 1e-7;

/// Default Dice smoothing term
pub const SMOOTH: f64 = 1.0;

/// Name of the training loss as stored in artifacts
pub const LOSS_NAME: &str = "dice_loss";

/// Metrics reported during fit, in logging order
pub const METRIC_NAMES: [&str; 4] = ["categorical_accuracy", "f1_m", "precision_m", "recall_m"];

/// Functions an artifact may reference beyond the built-in accuracy
pub const CUSTOM_OBJECTS: [&str; 5] = ["f1_m", "precision_m", "recall_m", "dice_coef", "dice_loss"];

/// Whether an artifact's loss/metric name can be resolved
pub fn is_registered(name: &str) -> bool {
    name == "categorical_accuracy" || CUSTOM_OBJECTS.contains(&name)
}

fn count<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    x.clamp(0.0, 1.0).round().sum()
}

/// `tp / (possible positives + ε)`
pub fn recall_m<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>) -> Tensor<B, 1> {
    let true_positives = count(y_true.clone() * y_pred);
    let possible_positives = count(y_true);
    true_positives / possible_positives.add_scalar(EPSILON)
}

/// `tp / (predicted positives + ε)`
pub fn precision_m<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>) -> Tensor<B, 1> {
    let true_positives = count(y_true * y_pred.clone());
    let predicted_positives = count(y_pred);
    true_positives / predicted_positives.add_scalar(EPSILON)
}

/// `2·p·r / (p + r + ε)`
pub fn f1_m<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>) -> Tensor<B, 1> {
    let precision = precision_m(y_true.clone(), y_pred.clone());
    let recall = recall_m(y_true, y_pred);
    f1_from(precision, recall)
}

fn f1_from<B: Backend>(precision: Tensor<B, 1>, recall: Tensor<B, 1>) -> Tensor<B, 1> {
    let product = precision.clone() * recall.clone();
    (product / (precision + recall).add_scalar(EPSILON)).mul_scalar(2.0)
}

/// `(2·Σ(t·p) + smooth) / (Σt + Σp + smooth)` over every element
pub fn dice_coef<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>, smooth: f64) -> Tensor<B, 1> {
    let intersection = (y_true.clone() * y_pred.clone()).sum();
    let denominator = y_true.sum() + y_pred.sum();
    intersection.mul_scalar(2.0).add_scalar(smooth) / denominator.add_scalar(smooth)
}

/// Per-pixel Dice loss over the channel axis, averaged over pixels and batch
///
/// Uses squared sums in the denominator, unlike [`dice_coef`].
pub fn dice_loss<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>, smooth: f64) -> Tensor<B, 1> {
    let intersection = (y_true.clone() * y_pred.clone()).abs().sum_dim(1);
    let true_sum = (y_true.clone() * y_true).sum_dim(1);
    let pred_sum = (y_pred.clone() * y_pred).sum_dim(1);
    let ratio = intersection.mul_scalar(2.0).add_scalar(smooth) / (true_sum + pred_sum).add_scalar(smooth);
    ratio.neg().add_scalar(1.0).mean()
}

/// Fraction of pixels whose arg-max channel agrees
pub fn categorical_accuracy<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>) -> Tensor<B, 1> {
    y_true.argmax(1).equal(y_pred.argmax(1)).float().mean()
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

/// Host-side metric values of one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub loss: f64,
    pub categorical_accuracy: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub dice_coef: f64,
    pub batch_size: usize,
}

impl BatchMetrics {
    /// Evaluate every metric; `loss` is the already-computed batch loss
    pub fn compute<B: Backend>(y_true: Tensor<B, 4>, y_pred: Tensor<B, 4>, loss: f64) -> Self {
        let batch_size = y_true.dims()[0];
        let precision = precision_m(y_true.clone(), y_pred.clone());
        let recall = recall_m(y_true.clone(), y_pred.clone());
        let f1 = f1_from(precision.clone(), recall.clone());

        Self {
            loss,
            categorical_accuracy: scalar(categorical_accuracy(y_true.clone(), y_pred.clone())),
            f1: scalar(f1),
            precision: scalar(precision),
            recall: scalar(recall),
            dice_coef: scalar(dice_coef(y_true, y_pred, SMOOTH)),
            batch_size,
        }
    }
}

/// Epoch-level averages
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EpochMetrics {
    pub loss: f64,
    pub categorical_accuracy: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub dice_coef: f64,
    pub batches: usize,
    pub samples: usize,
}

impl EpochMetrics {
    /// TensorBoard scalar tags and values
    pub fn scalars(&self) -> [(&'static str, f64); 6] {
        [
            ("epoch_loss", self.loss),
            ("epoch_categorical_accuracy", self.categorical_accuracy),
            ("epoch_f1_m", self.f1),
            ("epoch_precision_m", self.precision),
            ("epoch_recall_m", self.recall),
            ("epoch_dice_coef", self.dice_coef),
        ]
    }
}

/// Running averages over an epoch
///
/// Loss and accuracy are weighted by batch size (their per-element means
/// over the epoch); the counting metrics average their per-batch values.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    weighted_loss: f64,
    weighted_accuracy: f64,
    f1: f64,
    precision: f64,
    recall: f64,
    dice_coef: f64,
    batches: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, batch: &BatchMetrics) {
        let n = batch.batch_size as f64;
        self.weighted_loss += batch.loss * n;
        self.weighted_accuracy += batch.categorical_accuracy * n;
        self.f1 += batch.f1;
        self.precision += batch.precision;
        self.recall += batch.recall;
        self.dice_coef += batch.dice_coef;
        self.batches += 1;
        self.samples += batch.batch_size;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn finish(&self) -> EpochMetrics {
        if self.batches == 0 {
            return EpochMetrics::default();
        }
        let b = self.batches as f64;
        let s = self.samples.max(1) as f64;
        EpochMetrics {
            loss: self.weighted_loss / s,
            categorical_accuracy: self.weighted_accuracy / s,
            f1: self.f1 / b,
            precision: self.precision / b,
            recall: self.recall / b,
            dice_coef: self.dice_coef / b,
            batches: self.batches,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    /// [1, 2, 1, 2] tensor; data is channel 0 then channel 1
    fn t(values: [f32; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(values.to_vec(), [1, 2, 1, 2]), &Default::default())
    }

    fn truth() -> Tensor<TestBackend, 4> {
        // pixel0 = class 0, pixel1 = class 1
        t([1.0, 0.0, 0.0, 1.0])
    }

    fn approx(actual: Tensor<TestBackend, 1>, expected: f64) {
        let v = scalar(actual);
        assert!((v - expected).abs() < 1e-5, "{} != {}", v, expected);
    }

    #[test]
    fn test_perfect_prediction() {
        approx(precision_m(truth(), truth()), 1.0);
        approx(recall_m(truth(), truth()), 1.0);
        approx(f1_m(truth(), truth()), 1.0);
        approx(dice_coef(truth(), truth(), SMOOTH), 1.0);
        approx(dice_loss(truth(), truth(), SMOOTH), 0.0);
        approx(categorical_accuracy(truth(), truth()), 1.0);
    }

    #[test]
    fn test_soft_prediction() {
        let pred = t([0.6, 0.3, 0.4, 0.7]);
        approx(precision_m(truth(), pred.clone()), 1.0);
        approx(recall_m(truth(), pred.clone()), 1.0);
        approx(dice_coef(truth(), pred.clone(), SMOOTH), 0.72);
        let expected_loss = ((1.0 - 2.2 / 2.52) + (1.0 - 2.4 / 2.58)) / 2.0;
        approx(dice_loss(truth(), pred.clone(), SMOOTH), expected_loss);
        approx(categorical_accuracy(truth(), pred), 1.0);
    }

    #[test]
    fn test_half_wrong_prediction() {
        let pred = t([0.4, 0.3, 0.6, 0.7]);
        approx(recall_m(truth(), pred.clone()), 0.5);
        approx(precision_m(truth(), pred.clone()), 0.5);
        approx(f1_m(truth(), pred.clone()), 0.5);
        approx(categorical_accuracy(truth(), pred), 0.5);
    }

    #[test]
    fn test_empty_prediction_does_not_divide_by_zero() {
        let pred = t([0.0; 4]);
        approx(precision_m(truth(), pred.clone()), 0.0);
        approx(recall_m(truth(), pred.clone()), 0.0);
        approx(f1_m(truth(), pred), 0.0);
    }

    #[test]
    fn test_accumulator_weighting() {
        let mut acc = MetricAccumulator::new();
        let base = BatchMetrics {
            loss: 1.0,
            categorical_accuracy: 1.0,
            f1: 1.0,
            precision: 1.0,
            recall: 1.0,
            dice_coef: 1.0,
            batch_size: 3,
        };
        acc.update(&base);
        acc.update(&BatchMetrics {
            loss: 0.0,
            categorical_accuracy: 0.0,
            f1: 0.0,
            batch_size: 1,
            ..base
        });
        let epoch = acc.finish();
        assert_eq!(epoch.batches, 2);
        assert_eq!(epoch.samples, 4);
        assert!((epoch.loss - 0.75).abs() < 1e-12);
        assert!((epoch.categorical_accuracy - 0.75).abs() < 1e-12);
        assert!((epoch.f1 - 0.5).abs() < 1e-12);
        assert!((epoch.precision - 1.0).abs() < 1e-12);
        assert_eq!(epoch.scalars()[0].0, "epoch_loss");
    }

    #[test]
    fn test_registry() {
        assert!(is_registered("dice_loss"));
        assert!(is_registered("categorical_accuracy"));
        assert!(!is_registered("binary_crossentropy"));
    }
}
