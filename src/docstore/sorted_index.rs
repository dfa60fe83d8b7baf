//! Sorted identifier index with memory-mapped binary search.
//!
//! Layout:
//!
//! ```text
//! [0..32)      header: "CPIX" | u32 version | u64 entry count | padding
//! [32..1056)   prefix table: 256 × u32 index of the first key starting
//!              with each byte (0xFFFFFFFF = none)
//! [1056..)     offset table: count × u64 byte offset of each entry
//! entries      u16 key length | key bytes | u32 bundle | u64 offset
//! ```
//!
//! Keys are sorted bytewise. All integers are little-endian.

use crate::error::Error;
use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

const INDEX_MAGIC: &[u8; 4] = b"CPIX";
const INDEX_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const OFFSET_TABLE_START: usize = HEADER_SIZE + 256 * 4;
const NO_PREFIX: u32 = 0xFFFF_FFFF;

/// Where a record lives: bundle number plus a bundle-specific offset
/// (a byte offset for single-file stores, a record position for bundles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locator {
    pub bundle: u32,
    pub offset: u64,
}

impl Locator {
    pub fn new(bundle: u32, offset: u64) -> Self {
        Self { bundle, offset }
    }
}

/// Accumulates identifiers before writing. A repeated identifier keeps its
/// last locator.
#[derive(Default)]
pub struct IndexBuilder {
    entries: HashMap<String, Locator>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, locator: Locator) {
        match self.entries.get_mut(key) {
            Some(existing) => *existing = locator,
            None => {
                self.entries.insert(key.to_string(), locator);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let start = Instant::now();
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        for key in &keys {
            if key.len() > u16::MAX as usize {
                anyhow::bail!("identifier of {} bytes is too long to index", key.len());
            }
        }

        let mut prefix_index = [NO_PREFIX; 256];
        for (i, key) in keys.iter().enumerate() {
            if let Some(&first) = key.as_bytes().first() {
                if prefix_index[first as usize] == NO_PREFIX {
                    prefix_index[first as usize] = i as u32;
                }
            }
        }

        let data_start = OFFSET_TABLE_START + keys.len() * 8;
        let mut offsets = Vec::with_capacity(keys.len());
        let mut current = data_start;
        for key in &keys {
            offsets.push(current as u64);
            current += 2 + key.len() + 4 + 8;
        }

        let mut buf = Vec::with_capacity(current);
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(keys.len() as u64).to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
        for idx in prefix_index.iter() {
            buf.extend_from_slice(&idx.to_le_bytes());
        }
        for offset in offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        for key in keys {
            let locator = &self.entries[key];
            buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&locator.bundle.to_le_bytes());
            buf.extend_from_slice(&locator.offset.to_le_bytes());
        }

        fs::write(path, &buf).with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!(
            "[Index] Wrote {} keys, {} bytes to {} in {:.3}ms",
            self.entries.len(),
            buf.len(),
            path.display(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }
}

/// Read-only view of an index file.
pub struct SortedIndex {
    path: PathBuf,
    mmap: Mmap,
    count: usize,
}

impl SortedIndex {
    /// Map and validate `path`; anything unusable is [`Error::IndexCorrupt`].
    pub fn open(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::IndexCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let len = file.metadata().map_err(|e| corrupt(e.to_string()))?.len() as usize;
        if len < OFFSET_TABLE_START {
            return Err(corrupt(format!("file is {} bytes, shorter than the header", len)).into());
        }
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| corrupt(e.to_string()))?;

        if &mmap[0..4] != INDEX_MAGIC {
            return Err(corrupt("bad magic".into()).into());
        }
        let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
        if version != INDEX_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)).into());
        }
        let count = read_u64(&mmap, 8) as usize;
        if OFFSET_TABLE_START + count.saturating_mul(8) > len {
            return Err(corrupt(format!("{} entries do not fit in {} bytes", count, len)).into());
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn corrupt(&self, reason: String) -> anyhow::Error {
        Error::IndexCorrupt {
            path: self.path.clone(),
            reason,
        }
        .into()
    }

    /// Range of entries whose key starts with `key[0]`.
    fn prefix_range(&self, key: &[u8]) -> (usize, usize) {
        let Some(&first) = key.first() else {
            return (0, self.count);
        };
        let data = &self.mmap[..];
        let start = read_u32(data, HEADER_SIZE + first as usize * 4);
        if start == NO_PREFIX {
            return (0, 0);
        }
        let end = ((first as usize + 1)..256)
            .map(|next| read_u32(data, HEADER_SIZE + next * 4))
            .find(|&idx| idx != NO_PREFIX)
            .map(|idx| idx as usize)
            .unwrap_or(self.count);
        (start as usize, end.min(self.count))
    }

    /// Key and locator of entry `i`.
    fn entry(&self, i: usize) -> Result<(&[u8], Locator)> {
        let data = &self.mmap[..];
        let offset = read_u64(data, OFFSET_TABLE_START + i * 8) as usize;
        if offset + 2 > data.len() {
            return Err(self.corrupt(format!("entry {} offset {} out of bounds", i, offset)));
        }
        let key_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        let key_start = offset + 2;
        let loc_start = key_start + key_len;
        if loc_start + 12 > data.len() {
            return Err(self.corrupt(format!("entry {} truncated", i)));
        }
        let bundle = read_u32(data, loc_start);
        let position = read_u64(data, loc_start + 4);
        Ok((&data[key_start..loc_start], Locator::new(bundle, position)))
    }

    pub fn get(&self, key: &str) -> Result<Option<Locator>> {
        let key = key.as_bytes();
        let (mut left, mut right) = self.prefix_range(key);
        while left < right {
            let mid = left + (right - left) / 2;
            let (entry_key, locator) = self.entry(mid)?;
            match key.cmp(entry_key) {
                Ordering::Equal => return Ok(Some(locator)),
                Ordering::Less => right = mid,
                Ordering::Greater => left = mid + 1,
            }
        }
        Ok(None)
    }

    /// Every (key, locator) pair in key order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(String, Locator)>> + '_ {
        (0..self.count).map(move |i| {
            let (key, locator) = self.entry(i)?;
            Ok((String::from_utf8_lossy(key).into_owned(), locator))
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}
