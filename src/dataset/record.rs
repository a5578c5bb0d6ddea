//! TFRecord framing
//!
//! A record file is a flat sequence of frames:
//!
//! ```text
//! u64 LE  length
//! u32 LE  masked_crc32c(length bytes)
//! [u8]    data
//! u32 LE  masked_crc32c(data)
//! ```
//!
//! Files may be GZIP compressed (possibly as several concatenated members);
//! compression is detected from the magic bytes.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::utils::error::{LandcoverError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MASK_DELTA: u32 = 0xa282_ead8;
const READ_BUF_BYTES: usize = 1 << 20;

// CRC-32C (Castagnoli), reflected polynomial.
const CRC32C_POLY: u32 = 0x82f6_3b78;

const CRC32C_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = CRC32C_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

/// CRC as stored in TFRecord frames
pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
}

/// Detect compression from the first bytes of the file
pub fn sniff_compression(path: &Path) -> io::Result<Compression> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut n = 0;
    while n < magic.len() {
        let read = f.read(&mut magic[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }
    if n == magic.len() && magic == GZIP_MAGIC {
        Ok(Compression::Gzip)
    } else {
        Ok(Compression::Plain)
    }
}

/// Sequential reader over the frames of one record stream
pub struct RecordReader<R> {
    inner: R,
    path: PathBuf,
    index: usize,
    finished: bool,
}

impl RecordReader<Box<dyn Read + Send>> {
    /// Open a record file, transparently decompressing GZIP input
    pub fn open(path: &Path) -> Result<Self> {
        let compression = sniff_compression(path)?;
        let file = File::open(path)?;
        let inner: Box<dyn Read + Send> = match compression {
            Compression::Plain => Box::new(BufReader::with_capacity(READ_BUF_BYTES, file)),
            Compression::Gzip => Box::new(BufReader::with_capacity(
                READ_BUF_BYTES,
                MultiGzDecoder::new(file),
            )),
        };
        tracing::debug!("Opened record file {:?} ({:?})", path, compression);
        Ok(Self::new(inner, path))
    }
}

impl<R: Read> RecordReader<R> {
    /// Wrap an already-decompressed byte stream; `path` is used in errors
    pub fn new(inner: R, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
            index: 0,
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode_error(&self, msg: impl Into<String>) -> LandcoverError {
        LandcoverError::Decode {
            path: self.path.clone(),
            index: self.index,
            msg: msg.into(),
        }
    }

    /// Read the next frame; `Ok(None)` on a clean end of stream
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let mut header = [0u8; 12];
        let got = fill(&mut self.inner, &mut header).map_err(|e| self.decode_error(e.to_string()))?;
        if got == 0 {
            self.finished = true;
            return Ok(None);
        }
        if got < header.len() {
            return Err(self.decode_error("truncated frame header"));
        }

        let len_bytes = &header[..8];
        let len_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if masked_crc32c(len_bytes) != len_crc {
            return Err(self.decode_error("length crc mismatch"));
        }

        let mut raw_len = [0u8; 8];
        raw_len.copy_from_slice(len_bytes);
        let len = u64::from_le_bytes(raw_len);

        // Grow with the bytes actually present; the header alone is not trusted.
        let mut data = Vec::new();
        let read = (&mut self.inner).take(len).read_to_end(&mut data);
        let got = read.map_err(|e| self.decode_error(e.to_string()))?;
        if (got as u64) < len {
            return Err(self.decode_error(format!(
                "truncated record: expected {} bytes, got {}",
                len, got
            )));
        }

        let mut footer = [0u8; 4];
        let got = fill(&mut self.inner, &mut footer).map_err(|e| self.decode_error(e.to_string()))?;
        if got < footer.len() {
            return Err(self.decode_error("truncated data crc"));
        }
        if masked_crc32c(&data) != u32::from_le_bytes(footer) {
            return Err(self.decode_error("data crc mismatch"));
        }

        self.index += 1;
        Ok(Some(data))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Frame writer
pub struct RecordWriter<W: Write> {
    inner: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_record(&mut self, data: &[u8]) -> io::Result<()> {
        let len = (data.len() as u64).to_le_bytes();
        self.inner.write_all(&len)?;
        self.inner.write_all(&masked_crc32c(&len).to_le_bytes())?;
        self.inner.write_all(data)?;
        self.inner.write_all(&masked_crc32c(data).to_le_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
