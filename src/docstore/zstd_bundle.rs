//! Zstd frame bundles: a skippable metadata frame followed by independent
//! zstd frames of `FRAME_SIZE` JSON lines each.
//!
//! ```text
//! [magic 0x184D2A50 | u32 size | metadata JSON]   skippable frame
//! [zstd frame 0]  records 0..100
//! [zstd frame 1]  records 100..200
//! ...
//! ```
//!
//! `frame_offsets` in the metadata are relative to the first data frame and
//! hold one extra entry for the end of the last frame, so any record is one
//! seek and one frame decompression away.

use super::bundle::{BundleFormat, BundleReader};
use crate::atomic;
use crate::constants;
use crate::error::Error;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Skippable frame magic number for metadata
pub const SKIPPABLE_MAGIC_METADATA: u32 = 0x184D2A50;

/// Upper bound on one decompressed frame
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on the metadata frame
const MAX_METADATA_BYTES: u32 = 16 * 1024 * 1024;

/// Bundle metadata stored in the leading skippable frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub format: String,

    /// SHA-256 of the uncompressed JSON lines
    pub content_hash: String,

    pub record_count: u64,

    pub frame_count: usize,

    /// Records per frame
    pub frame_size: usize,

    /// Frame byte offsets relative to the first data frame; `frame_count + 1` entries
    pub frame_offsets: Vec<u64>,

    pub created_at: String,

    pub created_by: String,
}

pub fn write_skippable_frame<W: Write>(writer: &mut W, magic: u32, data: &[u8]) -> Result<usize> {
    writer.write_all(&magic.to_le_bytes())?;
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(data)?;
    Ok(8 + data.len())
}

pub fn read_skippable_frame<R: Read>(reader: &mut R) -> Result<(u32, Vec<u8>)> {
    let mut magic_buf = [0u8; 4];
    reader.read_exact(&mut magic_buf)?;
    let magic = u32::from_le_bytes(magic_buf);

    // Skippable frames use 0x184D2A50 - 0x184D2A5F
    if !(0x184D2A50..=0x184D2A5F).contains(&magic) {
        anyhow::bail!("Not a skippable frame: magic=0x{:08X}", magic);
    }

    let mut size_buf = [0u8; 4];
    reader.read_exact(&mut size_buf)?;
    let frame_size = u32::from_le_bytes(size_buf);
    if frame_size > MAX_METADATA_BYTES {
        anyhow::bail!("Skippable frame of {} bytes is too large", frame_size);
    }

    let mut data = vec![0u8; frame_size as usize];
    reader.read_exact(&mut data)?;
    Ok((magic, data))
}

pub fn write_metadata_frame<W: Write>(writer: &mut W, metadata: &BundleMetadata) -> Result<usize> {
    let json = serde_json::to_vec(metadata)?;
    write_skippable_frame(writer, SKIPPABLE_MAGIC_METADATA, &json)
}

pub fn read_metadata_frame<R: Read>(reader: &mut R) -> Result<BundleMetadata> {
    let (magic, data) = read_skippable_frame(reader)?;
    if magic != SKIPPABLE_MAGIC_METADATA {
        anyhow::bail!(
            "Unexpected magic: 0x{:08X} (expected 0x{:08X})",
            magic,
            SKIPPABLE_MAGIC_METADATA
        );
    }
    Ok(serde_json::from_slice(&data)?)
}

/// Metadata of a bundle file without decompressing any record.
pub fn read_metadata(path: &Path) -> Result<BundleMetadata> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    read_metadata_frame(&mut BufReader::new(file))
        .with_context(|| format!("Failed to read bundle metadata of {}", path.display()))
}

/// Write `records` (one non-empty JSON document per entry, without newlines) as a
/// frame bundle at `path`. The file appears only once complete.
pub fn write_bundle<I, B>(path: &Path, records: I) -> Result<BundleMetadata>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let mut frame = Vec::new();
    let mut in_frame = 0usize;
    let mut record_count = 0u64;

    let mut flush = |frame: &mut Vec<u8>, frames: &mut Vec<Vec<u8>>| -> Result<()> {
        hasher.update(&frame[..]);
        frames.push(zstd::bulk::compress(&frame[..], constants::ZSTD_COMPRESSION_LEVEL)?);
        frame.clear();
        Ok(())
    };

    for record in records {
        let record = record.as_ref();
        if record.is_empty() {
            anyhow::bail!("record {} is empty", record_count);
        }
        if record.contains(&b'\n') {
            anyhow::bail!("record {} contains a newline", record_count);
        }
        frame.extend_from_slice(record);
        frame.push(b'\n');
        in_frame += 1;
        record_count += 1;
        if in_frame == constants::FRAME_SIZE {
            flush(&mut frame, &mut frames)?;
            in_frame = 0;
        }
    }
    if in_frame > 0 {
        flush(&mut frame, &mut frames)?;
    }
    drop(flush);

    let mut frame_offsets = Vec::with_capacity(frames.len() + 1);
    let mut offset = 0u64;
    frame_offsets.push(0);
    for frame in &frames {
        offset += frame.len() as u64;
        frame_offsets.push(offset);
    }

    let metadata = BundleMetadata {
        format: constants::BUNDLE_FORMAT.to_string(),
        content_hash: format!("{:x}", hasher.finalize()),
        record_count,
        frame_count: frames.len(),
        frame_size: constants::FRAME_SIZE,
        frame_offsets,
        created_at: Utc::now().to_rfc3339(),
        created_by: constants::created_by(),
    };

    atomic::write_atomic(path, |file| {
        write_metadata_frame(file, &metadata)?;
        for frame in &frames {
            file.write_all(frame)?;
        }
        Ok(())
    })?;
    log::debug!(
        "[Docstore] Wrote bundle {} ({} records, {} frames)",
        path.display(),
        metadata.record_count,
        metadata.frame_count
    );
    Ok(metadata)
}

/// Reader that decompresses one frame at a time.
pub struct ZstdBundleReader {
    path: PathBuf,
    file: File,
    metadata: BundleMetadata,
    data_start: u64,
    frame: Option<(usize, Vec<Vec<u8>>)>,
    record: u64,
}

impl ZstdBundleReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let metadata = read_metadata_frame(&mut file)
            .with_context(|| format!("Failed to read bundle metadata of {}", path.display()))?;
        if metadata.frame_offsets.len() != metadata.frame_count + 1 || metadata.frame_size == 0 {
            anyhow::bail!(
                "{}: {} frame offsets for {} frames",
                path.display(),
                metadata.frame_offsets.len(),
                metadata.frame_count
            );
        }
        let data_start = file.stream_position()?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            metadata,
            data_start,
            frame: None,
            record: 0,
        })
    }

    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    /// Decompressed content of frame `index`.
    fn read_frame(&mut self, index: usize) -> Result<Vec<u8>> {
        if index >= self.metadata.frame_count {
            anyhow::bail!(
                "Frame {} out of bounds ({} frames in {})",
                index,
                self.metadata.frame_count,
                self.path.display()
            );
        }
        let start = self.data_start + self.metadata.frame_offsets[index];
        let end = self.data_start + self.metadata.frame_offsets[index + 1];
        if end <= start {
            anyhow::bail!("Invalid frame length (offsets: {}-{})", start, end);
        }

        self.file.seek(SeekFrom::Start(start))?;
        let mut compressed = Vec::new();
        (&mut self.file).take(end - start).read_to_end(&mut compressed)?;
        if compressed.len() as u64 != end - start {
            anyhow::bail!("Truncated frame {} in {}", index, self.path.display());
        }
        zstd::bulk::decompress(&compressed, MAX_FRAME_BYTES)
            .with_context(|| format!("Failed to decompress frame {} of {}", index, self.path.display()))
    }

    fn load_frame(&mut self, index: usize) -> Result<()> {
        if matches!(&self.frame, Some((loaded, _)) if *loaded == index) {
            return Ok(());
        }
        let data = self.read_frame(index)?;
        let lines = split_lines(&data);
        let expected = self
            .metadata
            .frame_size
            .min(
                self.metadata
                    .record_count
                    .saturating_sub((index * self.metadata.frame_size) as u64) as usize,
            );
        if lines.len() != expected {
            anyhow::bail!(
                "Frame {} of {} holds {} records, expected {}",
                index,
                self.path.display(),
                lines.len(),
                expected
            );
        }
        self.frame = Some((index, lines));
        Ok(())
    }
}

fn split_lines(data: &[u8]) -> Vec<Vec<u8>> {
    data.split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_vec())
        .collect()
}

impl BundleReader for ZstdBundleReader {
    fn position(&self) -> u64 {
        self.record
    }

    fn seek_to_record(&mut self, n: u64) -> Result<()> {
        self.record = n.min(self.metadata.record_count);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.record >= self.metadata.record_count {
            return Ok(None);
        }
        let frame_size = self.metadata.frame_size as u64;
        let index = (self.record / frame_size) as usize;
        self.load_frame(index)?;
        let line = match &self.frame {
            Some((_, lines)) => lines.get((self.record % frame_size) as usize).cloned(),
            None => None,
        };
        self.record += 1;
        Ok(line)
    }
}

/// [`BundleFormat`] for zstd frame bundles. Scanning verifies the content
/// hash recorded in the metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdFrameBundle;

impl BundleFormat for ZstdFrameBundle {
    fn name(&self) -> &'static str {
        "zstd-frames"
    }

    fn scan(
        &self,
        path: &Path,
        on_record: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<u64> {
        let mut reader = ZstdBundleReader::open(path)?;
        let mut hasher = Sha256::new();
        let mut position = 0u64;
        for index in 0..reader.metadata.frame_count {
            let data = reader.read_frame(index)?;
            hasher.update(&data);
            for line in data.split(|&b| b == b'\n').filter(|line| !line.is_empty()) {
                on_record(position, line)?;
                position += 1;
            }
        }

        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(&reader.metadata.content_hash) {
            return Err(Error::IntegrityMismatch {
                algorithm: "sha256".into(),
                expected: reader.metadata.content_hash.clone(),
                actual,
            })
            .with_context(|| format!("Bundle {} is damaged", path.display()));
        }
        if position != reader.metadata.record_count {
            anyhow::bail!(
                "{} holds {} records, metadata says {}",
                path.display(),
                position,
                reader.metadata.record_count
            );
        }
        Ok(position)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn BundleReader>> {
        Ok(Box::new(ZstdBundleReader::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn lines(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{{\"id\":\"op{}\",\"seq\":{}}}", i, i)).collect()
    }

    #[test]
    fn test_skippable_frame_roundtrip() -> Result<()> {
        let mut buffer = Vec::new();
        write_skippable_frame(&mut buffer, SKIPPABLE_MAGIC_METADATA, b"test data")?;
        let (magic, data) = read_skippable_frame(&mut buffer.as_slice())?;
        assert_eq!(magic, SKIPPABLE_MAGIC_METADATA);
        assert_eq!(data, b"test data");

        let mut bad = buffer.clone();
        bad[0] = 0;
        assert!(read_skippable_frame(&mut bad.as_slice()).is_err());
        Ok(())
    }

    #[test]
    fn test_write_and_seek() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.jsonl.zst");
        let metadata = write_bundle(&path, lines(250))?;
        assert_eq!(metadata.record_count, 250);
        assert_eq!(metadata.frame_count, 3);
        assert_eq!(metadata.frame_offsets.len(), 4);
        assert_eq!(read_metadata(&path)?.content_hash, metadata.content_hash);

        let mut reader = ZstdFrameBundle.open(&path)?;
        reader.seek_to_record(199)?;
        assert_eq!(reader.next_record()?, Some(lines(250)[199].clone().into_bytes()));
        assert_eq!(reader.next_record()?, Some(lines(250)[200].clone().into_bytes()));
        reader.seek_to_record(3)?;
        assert_eq!(reader.position(), 3);
        assert_eq!(reader.next_record()?, Some(lines(250)[3].clone().into_bytes()));
        reader.seek_to_record(249)?;
        assert!(reader.next_record()?.is_some());
        assert!(reader.next_record()?.is_none());
        Ok(())
    }

    #[test]
    fn test_truncated_last_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000002.jsonl.zst");
        write_bundle(&path, lines(250))?;
        let len = std::fs::metadata(&path)?.len();
        std::fs::OpenOptions::new().write(true).open(&path)?.set_len(len - 10)?;

        let mut reader = ZstdFrameBundle.open(&path)?;
        assert_eq!(reader.next_record()?, Some(lines(250)[0].clone().into_bytes()));
        reader.seek_to_record(240)?;
        let err = reader.next_record().unwrap_err();
        assert!(err.to_string().contains("Truncated frame 2"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_scan_counts_and_verifies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("b.zst");
        write_bundle(&path, lines(120))?;

        let mut seen = Vec::new();
        let count = ZstdFrameBundle.scan(&path, &mut |i, bytes| {
            seen.push((i, bytes.to_vec()));
            Ok(())
        })?;
        assert_eq!(count, 120);
        assert_eq!(seen[119], (119, lines(120)[119].clone().into_bytes()));
        Ok(())
    }

    #[test]
    fn test_scan_detects_wrong_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("b.zst");
        let mut metadata = write_bundle(&path, lines(10))?;

        // Rewrite the metadata frame with a different hash of the same length.
        let bytes = std::fs::read(&path)?;
        let old_len = 8 + serde_json::to_vec(&metadata)?.len();
        metadata.content_hash = "0".repeat(64);
        let mut rewritten = Vec::new();
        write_metadata_frame(&mut rewritten, &metadata)?;
        rewritten.extend_from_slice(&bytes[old_len..]);
        std::fs::write(&path, rewritten)?;

        let err = ZstdFrameBundle.scan(&path, &mut |_, _| Ok(())).err().expect("mismatch");
        assert!(matches!(classify(&err), Some(Error::IntegrityMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_rejects_newline_in_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("b.zst");
        assert!(write_bundle(&path, ["ok", "not\nok"]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_empty_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("b.zst");
        let err = write_bundle(&path, ["{}", "", "{}"]).unwrap_err();
        assert!(err.to_string().contains("record 1 is empty"), "{}", err);
        assert!(!path.exists());
    }
}
