//! Dataset module: record decoding, augmentation and batching
//!
//! - `record`/`wire`/`example`: TFRecord frames and `tf.train.Example` payloads
//! - `tuple`: stacks decoded features into (input, label) pairs
//! - `augmentation`: flip/rotate transforms shared by input and label
//! - `pipeline`: glob → decode → augment → shuffle → batch, per epoch
//! - `burn_dataset`: turns pairs into NCHW burn tensors

pub mod augmentation;
pub mod burn_dataset;
pub mod example;
pub mod pipeline;
pub mod record;
pub mod tuple;
pub mod wire;

#[cfg(test)]
pub(crate) mod fixtures;

pub use augmentation::Transform;
pub use burn_dataset::{SegmentationBatch, SegmentationBatcher};
pub use example::{encode_example, parse_example, FeatureSchema};
pub use pipeline::{resolve_pattern, EpochStream, PipelineOptions, SegmentationDataset};
pub use record::{RecordReader, RecordWriter};
pub use tuple::{to_tuple, Patch, TrainingPair};
