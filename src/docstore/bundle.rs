//! Physical bundle formats behind [`BundledDocstore`](super::BundledDocstore).

use crate::constants;
use crate::gzseek::{build_checkpoints, CheckpointedGzip};
use anyhow::Result;
use std::path::Path;

/// Sequential reader over the records of one bundle that can jump to any
/// record index.
pub trait BundleReader: Send {
    /// Index of the record the next call to `next_record` returns.
    fn position(&self) -> u64;

    fn seek_to_record(&mut self, n: u64) -> Result<()>;

    /// Raw bytes of the next record; `None` past the last one.
    fn next_record(&mut self) -> Result<Option<Vec<u8>>>;
}

/// How records are laid out in a bundle file.
pub trait BundleFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read every record of `path` once, in order, writing whatever seek
    /// aids the format keeps next to the bundle. Returns the record count.
    fn scan(&self, path: &Path, on_record: &mut dyn FnMut(u64, &[u8]) -> Result<()>)
        -> Result<u64>;

    fn open(&self, path: &Path) -> Result<Box<dyn BundleReader>>;
}

/// Gzip-compressed JSON lines, one record per non-empty line. Scanning
/// writes `<bundle>.chk` so later seeks resume from a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct GzipLinesBundle {
    frequency: u64,
}

impl GzipLinesBundle {
    pub fn new() -> Self {
        Self {
            frequency: constants::DEFAULT_CHECKPOINT_FREQ,
        }
    }

    /// Records between checkpoints.
    pub fn frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency.max(1);
        self
    }
}

impl Default for GzipLinesBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleFormat for GzipLinesBundle {
    fn name(&self) -> &'static str {
        "gzip-lines"
    }

    fn scan(
        &self,
        path: &Path,
        on_record: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<u64> {
        build_checkpoints(path, self.frequency, on_record)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn BundleReader>> {
        Ok(Box::new(CheckpointedGzip::open(path)?))
    }
}

impl BundleReader for CheckpointedGzip {
    fn position(&self) -> u64 {
        CheckpointedGzip::position(self)
    }

    fn seek_to_record(&mut self, n: u64) -> Result<()> {
        CheckpointedGzip::seek_to_record(self, n)
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        CheckpointedGzip::next_record(self)
    }
}
