//! Record files → shuffled batches of training pairs
//!
//! Every epoch pass runs on its own producer thread:
//!
//! 1. read raw frames from each matched file in sorted order,
//! 2. decode and stack them on a rayon pool (order kept within a chunk),
//! 3. replay the same records again with a random [`Transform`] applied,
//! 4. push everything through a bounded reservoir shuffle,
//! 5. group into batches and send them over a bounded channel.
//!
//! The consumer only waits on the channel. Dropping the stream disconnects
//! the channel and the producer stops at its next send.
//!
//! [`Transform`]: super::augmentation::Transform

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::augmentation::random_transform;
use super::example::{parse_example, FeatureSchema};
use super::record::RecordReader;
use super::tuple::{to_tuple, TrainingPair};
use crate::config::TrainConfig;
use crate::utils::error::{LandcoverError, Result, ResultExt};

/// Records decoded per rayon dispatch, per worker
const RECORDS_PER_WORKER: usize = 8;

/// Knobs of the input pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub seed: u64,
    pub num_workers: usize,
    pub prefetch_batches: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            buffer_size: config.buffer_size,
            seed: config.seed,
            num_workers: config.num_workers,
            prefetch_batches: config.prefetch_batches,
        }
    }
}

/// Bounded reservoir shuffle: once full, every insert evicts a random slot
#[derive(Debug)]
pub struct ShuffleBuffer<T> {
    capacity: usize,
    items: Vec<T>,
    rng: ChaCha8Rng,
}

impl<T> ShuffleBuffer<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Insert an item; returns the evicted one once the buffer is full
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.items.len() < self.capacity {
            self.items.push(item);
            return None;
        }
        let slot = self.rng.gen_range(0..self.items.len());
        Some(std::mem::replace(&mut self.items[slot], item))
    }

    /// Remove a random remaining item
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let slot = self.rng.gen_range(0..self.items.len());
        Some(self.items.swap_remove(slot))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A set of record files plus everything needed to turn them into batches
pub struct SegmentationDataset {
    files: Arc<Vec<PathBuf>>,
    schema: FeatureSchema,
    side: usize,
    options: PipelineOptions,
    pool: Arc<rayon::ThreadPool>,
}

impl std::fmt::Debug for SegmentationDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationDataset")
            .field("files", &self.files.len())
            .field("side", &self.side)
            .field("options", &self.options)
            .finish()
    }
}

impl SegmentationDataset {
    /// Resolve `pattern` and build a dataset over the matched files
    pub fn from_pattern(pattern: &str, config: &TrainConfig) -> Result<Self> {
        let files = resolve_pattern(pattern)?;
        info!("Pattern '{}' matched {} record files", pattern, files.len());
        Self::new(
            files,
            FeatureSchema::square(config.feature_names(), config.kernel_size),
            config.kernel_size,
            PipelineOptions::from_config(config),
        )
    }

    pub fn new(
        files: Vec<PathBuf>,
        schema: FeatureSchema,
        side: usize,
        options: PipelineOptions,
    ) -> Result<Self> {
        if files.is_empty() {
            return Err(LandcoverError::Dataset("no record files given".to_string()));
        }
        if options.batch_size == 0 || options.buffer_size <= options.batch_size {
            return Err(LandcoverError::Dataset(format!(
                "buffer_size ({}) must exceed batch_size ({})",
                options.buffer_size, options.batch_size
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_workers.max(1))
            .thread_name(|i| format!("decode-{}", i))
            .build()
            .context("Failed to build decode worker pool")?;

        Ok(Self {
            files: Arc::new(files),
            schema,
            side,
            options,
            pool: Arc::new(pool),
        })
    }

    /// Start a single pass over the data for epoch `epoch` (0-indexed)
    pub fn epoch(&self, epoch: usize) -> EpochStream {
        let (tx, rx) = bounded(self.options.prefetch_batches.max(1));
        let producer = Producer {
            files: Arc::clone(&self.files),
            schema: self.schema.clone(),
            side: self.side,
            options: self.options.clone(),
            pool: Arc::clone(&self.pool),
            epoch,
        };
        let handle = thread::Builder::new()
            .name(format!("epoch-{}-producer", epoch))
            .spawn(move || producer.run(tx));

        match handle {
            Ok(handle) => EpochStream {
                rx: Some(rx),
                handle: Some(handle),
                pending_error: None,
            },
            Err(e) => EpochStream {
                rx: None,
                handle: None,
                pending_error: Some(LandcoverError::Io(e)),
            },
        }
    }
}

/// Sorted local paths matching a glob; an empty match is an error
pub fn resolve_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| LandcoverError::Dataset(format!("invalid pattern '{}': {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            LandcoverError::Dataset(format!("cannot read match of '{}': {}", pattern, e))
        })?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(LandcoverError::Dataset(format!(
            "pattern '{}' matched no record files",
            pattern
        )));
    }
    Ok(files)
}

type BatchResult = Result<Vec<TrainingPair>>;

/// Batches of one epoch pass
pub struct EpochStream {
    rx: Option<Receiver<BatchResult>>,
    handle: Option<JoinHandle<()>>,
    pending_error: Option<LandcoverError>,
}

impl Iterator for EpochStream {
    type Item = BatchResult;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let next = self.rx.as_ref()?.recv().ok();
        if next.is_none() {
            self.rx = None;
        }
        next
    }
}

impl Drop for EpochStream {
    fn drop(&mut self) {
        // Disconnect first so a blocked producer wakes up and exits.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Dataset producer thread panicked");
            }
        }
    }
}

struct Producer {
    files: Arc<Vec<PathBuf>>,
    schema: FeatureSchema,
    side: usize,
    options: PipelineOptions,
    pool: Arc<rayon::ThreadPool>,
    epoch: usize,
}

/// Stops the producer: the consumer hung up or an error was forwarded
struct Stop;

impl Producer {
    fn run(self, tx: Sender<BatchResult>) {
        let mut sink = BatchSink {
            shuffle: ShuffleBuffer::new(
                self.options.buffer_size,
                self.options.seed.wrapping_add(self.epoch as u64),
            ),
            batch: Vec::with_capacity(self.options.batch_size),
            batch_size: self.options.batch_size,
            tx: &tx,
            sent: 0,
        };

        let outcome = self
            .pass(false, &mut sink)
            .and_then(|_| self.pass(true, &mut sink))
            .and_then(|_| sink.finish());

        match outcome {
            Ok(()) => debug!("Epoch {} producer sent {} batches", self.epoch, sink.sent),
            Err(Stop) => debug!("Epoch {} producer stopped early", self.epoch),
        }
    }

    /// One sweep over every file; `augment` selects the transformed copy
    fn pass(&self, augment: bool, sink: &mut BatchSink<'_>) -> std::result::Result<(), Stop> {
        let chunk_len = self.options.num_workers.max(1) * RECORDS_PER_WORKER;
        let mut global_index = 0usize;

        for path in self.files.iter() {
            let reader = match RecordReader::open(path) {
                Ok(r) => r,
                Err(e) => return sink.fail(e),
            };

            let mut chunk: Vec<Vec<u8>> = Vec::with_capacity(chunk_len);
            let mut chunk_local = 0usize;
            let mut chunk_global = global_index;
            for (local, record) in reader.enumerate() {
                if chunk.is_empty() {
                    chunk_local = local;
                    chunk_global = global_index;
                }
                match record {
                    Ok(bytes) => chunk.push(bytes),
                    Err(e) => return sink.fail(e),
                }
                global_index += 1;
                if chunk.len() == chunk_len {
                    self.flush_chunk(path, &mut chunk, chunk_local, chunk_global, augment, sink)?;
                }
            }
            if !chunk.is_empty() {
                self.flush_chunk(path, &mut chunk, chunk_local, chunk_global, augment, sink)?;
            }
        }
        Ok(())
    }

    fn flush_chunk(
        &self,
        path: &Path,
        chunk: &mut Vec<Vec<u8>>,
        first_local: usize,
        first_global: usize,
        augment: bool,
        sink: &mut BatchSink<'_>,
    ) -> std::result::Result<(), Stop> {
        let records = std::mem::take(chunk);
        let seed = self.options.seed;
        let epoch = self.epoch;
        let decoded: Vec<Result<TrainingPair>> = self.pool.install(|| {
            records
                .par_iter()
                .enumerate()
                .map(|(offset, bytes)| {
                    let pair = decode_pair(bytes, &self.schema, self.side, path, first_local + offset)?;
                    Ok(if augment {
                        random_transform(&pair, seed, epoch, first_global + offset)
                    } else {
                        pair
                    })
                })
                .collect()
        });

        for pair in decoded {
            match pair {
                Ok(pair) => sink.push(pair)?,
                Err(e) => return sink.fail(e),
            }
        }
        Ok(())
    }
}

fn decode_pair(
    bytes: &[u8],
    schema: &FeatureSchema,
    side: usize,
    path: &Path,
    index: usize,
) -> Result<TrainingPair> {
    let features = parse_example(bytes, schema).map_err(|e| LandcoverError::Decode {
        path: path.to_path_buf(),
        index,
        msg: e.to_string(),
    })?;
    to_tuple(&features, schema, side)
}

struct BatchSink<'a> {
    shuffle: ShuffleBuffer<TrainingPair>,
    batch: Vec<TrainingPair>,
    batch_size: usize,
    tx: &'a Sender<BatchResult>,
    sent: usize,
}

impl BatchSink<'_> {
    fn push(&mut self, pair: TrainingPair) -> std::result::Result<(), Stop> {
        if let Some(out) = self.shuffle.push(pair) {
            self.emit(out)?;
        }
        Ok(())
    }

    fn emit(&mut self, pair: TrainingPair) -> std::result::Result<(), Stop> {
        self.batch.push(pair);
        if self.batch.len() == self.batch_size {
            self.send_batch()?;
        }
        Ok(())
    }

    fn send_batch(&mut self) -> std::result::Result<(), Stop> {
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.tx.send(Ok(batch)).map_err(|_| Stop)?;
        self.sent += 1;
        Ok(())
    }

    /// Drain the shuffle buffer and send the final partial batch
    fn finish(&mut self) -> std::result::Result<(), Stop> {
        while let Some(pair) = self.shuffle.pop() {
            self.emit(pair)?;
        }
        if !self.batch.is_empty() {
            self.send_batch()?;
        }
        Ok(())
    }

    fn fail(&mut self, e: LandcoverError) -> std::result::Result<(), Stop> {
        let _ = self.tx.send(Err(e));
        Err(Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::write_shards;
    use crate::dataset::record::RecordWriter;

    const SIDE: usize = 4;

    fn schema() -> FeatureSchema {
        FeatureSchema::square(vec!["R".into(), "G".into(), "B".into(), "label".into()], SIDE)
    }

    fn options(batch_size: usize, buffer_size: usize) -> PipelineOptions {
        PipelineOptions {
            batch_size,
            buffer_size,
            seed: 7,
            num_workers: 2,
            prefetch_batches: 2,
        }
    }

    fn fixture(dir: &Path) -> Vec<PathBuf> {
        write_shards(dir, SIDE)
    }

    #[test]
    fn test_shuffle_buffer_is_permutation() {
        let mut buffer = ShuffleBuffer::new(4, 3);
        let mut out = Vec::new();
        for i in 0..20 {
            if let Some(v) = buffer.push(i) {
                out.push(v);
            }
        }
        assert_eq!(buffer.len(), 4);
        while let Some(v) = buffer.pop() {
            out.push(v);
        }
        assert!(buffer.is_empty());
        let mut sorted = out.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(out, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_resolve_pattern_sorted_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = fixture(dir.path());
        let pattern = format!("{}/*", dir.path().display());
        assert_eq!(resolve_pattern(&pattern).unwrap(), files);

        let missing = format!("{}/nothing-*", dir.path().display());
        assert!(matches!(
            resolve_pattern(&missing),
            Err(LandcoverError::Dataset(_))
        ));
    }

    #[test]
    fn test_epoch_doubles_cardinality_and_keeps_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset =
            SegmentationDataset::new(fixture(dir.path()), schema(), SIDE, options(4, 6)).unwrap();

        let batches: Vec<Vec<TrainingPair>> =
            dataset.epoch(0).collect::<Result<_>>().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        // 11 examples, doubled, in batches of 4
        assert_eq!(sizes, vec![4, 4, 4, 4, 4, 2]);

        let mut seen: Vec<usize> = batches
            .iter()
            .flatten()
            .map(|pair| pair.input.data[0] as usize)
            .collect();
        seen.sort();
        let expected: Vec<usize> = (0..11).flat_map(|v| [v, v]).collect();
        assert_eq!(seen, expected);

        for pair in batches.iter().flatten() {
            assert_eq!(pair.input.channels, 3);
            for pixel in pair.label.data.chunks_exact(2) {
                assert_eq!(pixel[0] + pixel[1], 1.0);
            }
        }
    }

    #[test]
    fn test_epoch_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let dataset =
            SegmentationDataset::new(fixture(dir.path()), schema(), SIDE, options(3, 5)).unwrap();
        let first: Vec<Vec<TrainingPair>> = dataset.epoch(1).collect::<Result<_>>().unwrap();
        let second: Vec<Vec<TrainingPair>> = dataset.epoch(1).collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_error_reaches_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = fixture(dir.path());
        let bad = dir.path().join("part-2.tfrecord");
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_record(b"not an example").unwrap();
        std::fs::write(&bad, writer.into_inner()).unwrap();
        files.push(bad);

        let dataset = SegmentationDataset::new(files, schema(), SIDE, options(2, 4)).unwrap();
        let results: Vec<BatchResult> = dataset.epoch(0).collect();
        assert!(matches!(
            results.last(),
            Some(Err(LandcoverError::Decode { index: 0, .. }))
        ));
    }

    #[test]
    fn test_dropping_stream_stops_producer() {
        let dir = tempfile::tempdir().unwrap();
        let dataset =
            SegmentationDataset::new(fixture(dir.path()), schema(), SIDE, options(1, 2)).unwrap();
        let mut stream = dataset.epoch(0);
        assert!(stream.next().is_some());
        drop(stream);
    }

    #[test]
    fn test_buffer_must_exceed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let err = SegmentationDataset::new(fixture(dir.path()), schema(), SIDE, options(4, 4));
        assert!(err.is_err());
    }
}
