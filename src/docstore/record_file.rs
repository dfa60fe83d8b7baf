//! Length-prefixed record file and its position table.
//!
//! `records.bin` is a sequence of `[u32 LE length][lz4 block]` entries where
//! each block is a size-prefixed lz4 compression of one JSON record.
//! `records.pos` lists the byte offset of every entry, in storage order, as
//! little-endian u64s.

use crate::error::Error;
use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Hard cap on one compressed entry; anything larger means a bad offset.
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(record)?;
    Ok(lz4::block::compress(&json, None, true)?)
}

pub fn decode<T: DeserializeOwned>(block: &[u8]) -> Result<T> {
    let json = lz4::block::decompress(block, None).context("Corrupt lz4 record block")?;
    serde_json::from_slice(&json).context("Malformed record JSON")
}

/// Appends records and their offsets.
pub struct RecordWriter {
    records: BufWriter<File>,
    positions: BufWriter<File>,
    offset: u64,
    count: u64,
}

impl RecordWriter {
    pub fn create(records: &Path, positions: &Path) -> Result<Self> {
        let open = |path: &Path| {
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))
        };
        Ok(Self {
            records: BufWriter::new(open(records)?),
            positions: BufWriter::new(open(positions)?),
            offset: 0,
            count: 0,
        })
    }

    /// Write one record; returns its byte offset.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<u64> {
        let offset = self.offset;
        let written = write_entry(&mut self.records, record)?;
        self.positions.write_all(&offset.to_le_bytes())?;
        self.offset += written;
        self.count += 1;
        Ok(offset)
    }

    pub fn finish(mut self) -> Result<u64> {
        self.records.flush()?;
        self.positions.flush()?;
        self.records.get_ref().sync_all()?;
        self.positions.get_ref().sync_all()?;
        Ok(self.count)
    }
}

/// Write one `[length][lz4 block]` entry; returns the bytes written.
pub fn write_entry<T: Serialize, W: Write>(writer: &mut W, record: &T) -> Result<u64> {
    let block = encode(record)?;
    writer.write_all(&(block.len() as u32).to_le_bytes())?;
    writer.write_all(&block)?;
    Ok(4 + block.len() as u64)
}

/// Read the entry starting at the reader's current offset. `None` at a
/// clean end of file.
pub fn read_record<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_SIZE {
        anyhow::bail!("record entry of {} bytes exceeds the size limit", len);
    }
    let mut block = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut block)?;
    if block.len() != len {
        anyhow::bail!("Truncated record entry ({} of {} bytes)", block.len(), len);
    }
    decode(&block).map(Some)
}

/// Memory-mapped `records.pos`.
pub struct PositionTable {
    path: PathBuf,
    mmap: Option<Mmap>,
    count: u64,
}

impl PositionTable {
    pub fn open(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::IndexCorrupt {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let len = file.metadata().map_err(|e| corrupt(e.to_string()))?.len();
        if len % 8 != 0 {
            return Err(corrupt(format!("length {} is not a multiple of 8", len)).into());
        }
        // Mapping an empty file fails on some platforms.
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file) }.map_err(|e| corrupt(e.to_string()))?)
        };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            count: len / 8,
        })
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Byte offset of the record at `position`.
    pub fn offset(&self, position: u64) -> Option<u64> {
        if position >= self.count {
            return None;
        }
        let data = self.mmap.as_deref()?;
        let at = position as usize * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[at..at + 8]);
        Some(u64::from_le_bytes(buf))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
