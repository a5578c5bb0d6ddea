//! TensorBoard event files
//!
//! Event files are TFRecord streams of `Event` protos. Only what scalar
//! logging needs is encoded:
//!
//! ```text
//! Event   { double wall_time = 1; int64 step = 2; string file_version = 3; Summary summary = 5; }
//! Summary { repeated Value value = 1; }
//! Value   { string tag = 1; float simple_value = 2; }
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::dataset::record::RecordWriter;
use crate::dataset::wire;
use crate::utils::error::Result;

const FILE_VERSION: &str = "brain.Event:2";

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Serialized `Event` carrying only a file version
pub fn encode_file_version_event(wall_time: f64) -> Vec<u8> {
    let mut event = Vec::with_capacity(32);
    wire::put_f64_field(&mut event, 1, wall_time);
    wire::put_bytes_field(&mut event, 3, FILE_VERSION.as_bytes());
    event
}

/// Serialized `Event` with one summary holding the given scalars
pub fn encode_scalars_event(wall_time: f64, step: i64, scalars: &[(&str, f64)]) -> Vec<u8> {
    let mut summary = Vec::new();
    for (tag, value) in scalars {
        let mut v = Vec::with_capacity(tag.len() + 8);
        wire::put_bytes_field(&mut v, 1, tag.as_bytes());
        wire::put_f32_field(&mut v, 2, *value as f32);
        wire::put_bytes_field(&mut summary, 1, &v);
    }

    let mut event = Vec::with_capacity(summary.len() + 24);
    wire::put_f64_field(&mut event, 1, wall_time);
    wire::put_varint_field(&mut event, 2, step as u64);
    wire::put_bytes_field(&mut event, 5, &summary);
    event
}

/// Appends scalar summaries to one event file
pub struct EventWriter {
    writer: RecordWriter<BufWriter<File>>,
    path: PathBuf,
}

impl EventWriter {
    /// Create `events.out.tfevents.<unix>.<host>` inside `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let now = wall_time();
        let path = dir.join(format!("events.out.tfevents.{}.{}", now as u64, hostname()));
        let file = File::create(&path)?;

        let mut writer = RecordWriter::new(BufWriter::new(file));
        writer.write_record(&encode_file_version_event(now))?;
        writer.flush()?;

        tracing::debug!("TensorBoard events -> {:?}", path);
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all `scalars` at `step` and flush
    pub fn add_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()> {
        let event = encode_scalars_event(wall_time(), step as i64, scalars);
        self.writer.write_record(&event)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::record::RecordReader;
    use crate::dataset::wire::{FieldValue, WireReader};

    fn fields(bytes: &[u8]) -> Vec<(u32, FieldValue<'_>)> {
        let mut reader = WireReader::new(bytes);
        let mut out = Vec::new();
        while let Some(f) = reader.next_field().unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_event_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut writer = EventWriter::create(&dir.path().join("logs/train")).unwrap();
            writer
                .add_scalars(3, &[("epoch_loss", 0.25), ("epoch_f1_m", 0.5)])
                .unwrap();
            writer.path().to_path_buf()
        };

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("events.out.tfevents."));

        let records: Vec<Vec<u8>> = RecordReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);

        let header = fields(&records[0]);
        assert_eq!(header[1], (3, FieldValue::Bytes(FILE_VERSION.as_bytes())));

        let event = fields(&records[1]);
        assert_eq!(event[1], (2, FieldValue::Varint(3)));
        let FieldValue::Bytes(summary) = event[2].1 else {
            panic!("summary is not length-delimited");
        };
        let values = fields(summary);
        assert_eq!(values.len(), 2);
        let FieldValue::Bytes(first) = values[0].1 else {
            panic!("value is not length-delimited");
        };
        let value = fields(first);
        assert_eq!(value[0], (1, FieldValue::Bytes(b"epoch_loss".as_slice())));
        assert_eq!(value[1], (2, FieldValue::Fixed32(0.25f32.to_bits())));
    }
}
