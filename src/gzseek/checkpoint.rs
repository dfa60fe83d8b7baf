//! Checkpoint files: saved inflater states at regular record intervals.
//!
//! File layout (zstd-compressed as a whole):
//!
//! ```text
//! "GZCK" | u32 version | u64 frequency | u64 count
//! count × ( u64 record | u64 bit_pos | u64 out_pos | u64 skip
//!           | u32 window_len | window bytes )
//! ```
//!
//! All integers are little-endian. `bit_pos`/`out_pos`/window describe the
//! deflate block boundary at or before the record; `skip` is the number of
//! uncompressed bytes between that boundary and the record's first byte.

use super::inflate::{Boundary, WINDOW_SIZE};
use crate::atomic;
use crate::constants;
use crate::error::Error;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"GZCK";
const VERSION: u32 = 1;

/// Resumable decoder state positioned at the start of record `record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub record: u64,
    pub boundary: Boundary,
    pub skip: u64,
}

impl Checkpoint {
    /// Uncompressed offset of the record's first byte.
    pub fn record_start(&self) -> u64 {
        self.boundary.out_pos + self.skip
    }
}

/// Checkpoints of one compressed file, ordered by record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    pub frequency: u64,
    pub entries: Vec<Checkpoint>,
}

impl CheckpointSet {
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency,
            entries: Vec::new(),
        }
    }

    /// Latest checkpoint at or before `record`.
    pub fn nearest(&self, record: u64) -> Option<&Checkpoint> {
        let idx = self.entries.partition_point(|c| c.record <= record);
        idx.checked_sub(1).map(|i| &self.entries[i])
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_atomic(path, |file| {
            let mut encoder = zstd::Encoder::new(file, constants::ZSTD_COMPRESSION_LEVEL)?;
            encoder.write_all(MAGIC)?;
            encoder.write_all(&VERSION.to_le_bytes())?;
            encoder.write_all(&self.frequency.to_le_bytes())?;
            encoder.write_all(&(self.entries.len() as u64).to_le_bytes())?;
            for entry in &self.entries {
                encoder.write_all(&entry.record.to_le_bytes())?;
                encoder.write_all(&entry.boundary.bit_pos.to_le_bytes())?;
                encoder.write_all(&entry.boundary.out_pos.to_le_bytes())?;
                encoder.write_all(&entry.skip.to_le_bytes())?;
                encoder.write_all(&(entry.boundary.window.len() as u32).to_le_bytes())?;
                encoder.write_all(&entry.boundary.window)?;
            }
            encoder.finish()?;
            Ok(())
        })
        .with_context(|| format!("Failed to write checkpoints {}", path.display()))?;
        log::debug!(
            "[Checkpoint] Wrote {} checkpoints to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a checkpoint file; a malformed file raises [`Error::IndexCorrupt`].
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut decoder = zstd::Decoder::new(file)?;
        Self::read_from(&mut decoder).map_err(|e| {
            Error::IndexCorrupt {
                path: path.to_path_buf(),
                reason: format!("{:#}", e),
            }
            .into()
        })
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            anyhow::bail!("bad magic {:?}", magic);
        }
        let version = read_u32(reader)?;
        if version != VERSION {
            anyhow::bail!("unsupported version {}", version);
        }
        let frequency = read_u64(reader)?;
        let count = read_u64(reader)?;

        let mut entries = Vec::new();
        for _ in 0..count {
            let record = read_u64(reader)?;
            let bit_pos = read_u64(reader)?;
            let out_pos = read_u64(reader)?;
            let skip = read_u64(reader)?;
            let window_len = read_u32(reader)? as usize;
            if window_len > WINDOW_SIZE {
                anyhow::bail!("window of {} bytes exceeds 32 KiB", window_len);
            }
            let mut window = vec![0u8; window_len];
            reader.read_exact(&mut window)?;
            if entries.last().is_some_and(|prev: &Checkpoint| prev.record >= record) {
                anyhow::bail!("checkpoints out of order at record {}", record);
            }
            entries.push(Checkpoint {
                record,
                boundary: Boundary {
                    bit_pos,
                    out_pos,
                    window,
                },
                skip,
            });
        }
        Ok(Self { frequency, entries })
    }
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
