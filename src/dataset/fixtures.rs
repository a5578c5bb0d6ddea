//! Synthetic record files for tests

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;

use super::example::encode_example;
use super::record::RecordWriter;

pub const BANDS: [&str; 3] = ["R", "G", "B"];

/// Gzip record file of `count` `side × side` examples. Example `k` has every
/// band pixel equal to `first + k` and a striped label.
pub fn write_records(path: &Path, side: usize, first: usize, count: usize) {
    let plane = side * side;
    let mut writer = RecordWriter::new(GzEncoder::new(Vec::new(), flate2::Compression::fast()));
    for k in 0..count {
        let band = vec![(first + k) as f32; plane];
        let label: Vec<f32> = (0..plane).map(|p| (p % 2) as f32).collect();
        let bytes = encode_example(&[
            (BANDS[0], band.as_slice()),
            (BANDS[1], band.as_slice()),
            (BANDS[2], band.as_slice()),
            ("label", label.as_slice()),
        ]);
        writer.write_record(&bytes).unwrap();
    }
    let compressed = writer.into_inner().finish().unwrap();
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&compressed).unwrap();
}

/// Two shards in `dir` with 5 and 6 examples
pub fn write_shards(dir: &Path, side: usize) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    let a = dir.join("part-0.tfrecord.gz");
    let b = dir.join("part-1.tfrecord.gz");
    write_records(&a, side, 0, 5);
    write_records(&b, side, 5, 6);
    vec![a, b]
}
