//! Record-level seeking in gzip JSON-lines files.

use super::checkpoint::{Checkpoint, CheckpointSet};
use super::inflate::Inflater;
use crate::constants;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Next non-empty line without its terminator; returns its uncompressed
/// start offset.
fn read_line<R: Read>(inflater: &mut Inflater<R>, line: &mut Vec<u8>) -> io::Result<Option<u64>> {
    loop {
        let start = inflater.position();
        line.clear();
        if inflater.read_until(b'\n', line)? == 0 {
            return Ok(None);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if !line.is_empty() {
            return Ok(Some(start));
        }
    }
}

/// Decode every record of `path`, handing each to `on_record`, and write a
/// checkpoint every `frequency` records to `<path>.chk`.
///
/// Returns the number of records.
pub fn build_checkpoints(
    path: &Path,
    frequency: u64,
    on_record: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
) -> Result<u64> {
    let frequency = frequency.max(1);
    let start_time = Instant::now();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut inflater = Inflater::new(file).track_boundaries(true);
    let mut set = CheckpointSet::new(frequency);
    let mut line = Vec::new();
    let mut count = 0u64;

    while let Some(start) = read_line(&mut inflater, &mut line)
        .with_context(|| format!("Failed to decompress {}", path.display()))?
    {
        if count > 0 && count % frequency == 0 {
            if let Some(boundary) = inflater.boundary_before(start) {
                set.entries.push(Checkpoint {
                    record: count,
                    skip: start - boundary.out_pos,
                    boundary: boundary.clone(),
                });
            }
        }
        inflater.prune_boundaries(start);
        on_record(count, &line)?;
        count += 1;
    }

    set.save(&constants::checkpoint_path(path))?;
    log::debug!(
        "[Checkpoint] {} records, {} checkpoints for {} in {:?}",
        count,
        set.entries.len(),
        path.display(),
        start_time.elapsed()
    );
    Ok(count)
}

/// Line reader over a gzip file that can jump to any record.
///
/// Short forward seeks read ahead. Longer or backward seeks restart from
/// the nearest checkpoint in `<path>.chk`; without a usable checkpoint file
/// they rescan from the start of the file.
pub struct CheckpointedGzip {
    path: PathBuf,
    inflater: Inflater<File>,
    record: u64,
    line: Vec<u8>,
    checkpoints: Option<CheckpointSet>,
}

impl CheckpointedGzip {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            inflater: Self::open_inflater(path)?,
            record: 0,
            line: Vec::new(),
            checkpoints: None,
        })
    }

    fn open_inflater(path: &Path) -> Result<Inflater<File>> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Inflater::new(file))
    }

    /// Index of the record the next call to [`Self::next_record`] returns.
    pub fn position(&self) -> u64 {
        self.record
    }

    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let found = read_line(&mut self.inflater, &mut self.line)
            .with_context(|| format!("Failed to decompress {}", self.path.display()))?;
        match found {
            Some(_) => {
                self.record += 1;
                Ok(Some(self.line.clone()))
            }
            None => Ok(None),
        }
    }

    pub fn seek_to_record(&mut self, n: u64) -> Result<()> {
        if n == self.record {
            return Ok(());
        }
        if n > self.record && n - self.record <= constants::SMALL_SEEK_RECORDS {
            return self.skip_records(n - self.record);
        }

        let nearest = self.checkpoints().nearest(n).cloned();
        match nearest {
            Some(checkpoint) if n < self.record || checkpoint.record > self.record => {
                if let Err(e) = self.restore(&checkpoint) {
                    log::warn!(
                        "[Checkpoint] Failed to restore {} at record {} ({:#}); rescanning",
                        self.path.display(),
                        checkpoint.record,
                        e
                    );
                    self.checkpoints = Some(CheckpointSet::default());
                    self.rewind()?;
                }
            }
            None if n < self.record => self.rewind()?,
            _ => {}
        }
        self.skip_records(n - self.record)
    }

    fn checkpoints(&mut self) -> &CheckpointSet {
        let path = &self.path;
        self.checkpoints.get_or_insert_with(|| {
            let checkpoint_path = constants::checkpoint_path(path);
            match CheckpointSet::load(&checkpoint_path) {
                Ok(set) => set,
                Err(e) => {
                    log::warn!(
                        "[Checkpoint] {} unusable ({:#}); seeking by scanning",
                        checkpoint_path.display(),
                        e
                    );
                    CheckpointSet::default()
                }
            }
        })
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(checkpoint.boundary.bit_pos / 8))?;
        let mut inflater = Inflater::resume(file, &checkpoint.boundary)?;
        let skipped = io::copy(&mut (&mut inflater).take(checkpoint.skip), &mut io::sink())?;
        if skipped != checkpoint.skip {
            anyhow::bail!("stream ended {} bytes into the checkpoint", skipped);
        }
        self.inflater = inflater;
        self.record = checkpoint.record;
        log::trace!(
            "[Checkpoint] {} restored at record {}",
            self.path.display(),
            checkpoint.record
        );
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.inflater = Self::open_inflater(&self.path)?;
        self.record = 0;
        Ok(())
    }

    fn skip_records(&mut self, count: u64) -> Result<()> {
        for _ in 0..count {
            let found = read_line(&mut self.inflater, &mut self.line)
                .with_context(|| format!("Failed to decompress {}", self.path.display()))?;
            if found.is_none() {
                break;
            }
            self.record += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn line(i: u64) -> String {
        format!(
            "{{\"id\":\"d{}\",\"text\":\"record {} with some padding text {}\"}}",
            i,
            i,
            i.wrapping_mul(2654435761) % 100_000
        )
    }

    /// Two gzip members holding `count` lines in total.
    fn write_bundle(path: &Path, count: u64) -> Result<()> {
        let mut data = Vec::new();
        let half = count / 2;
        for range in [0..half, half..count] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            for i in range {
                writeln!(encoder, "{}", line(i))?;
            }
            data.extend(encoder.finish()?);
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    #[test]
    fn test_build_and_seek() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bundle.jsonl.gz");
        write_bundle(&path, 20_000)?;

        let mut seen = 0u64;
        let count = build_checkpoints(&path, 500, &mut |i, bytes| {
            assert_eq!(bytes, line(i).as_bytes());
            seen += 1;
            Ok(())
        })?;
        assert_eq!(count, 20_000);
        assert_eq!(seen, 20_000);
        let set = CheckpointSet::load(&constants::checkpoint_path(&path))?;
        assert_eq!(set.entries.len(), 39);

        let mut reader = CheckpointedGzip::open(&path)?;
        for target in [0u64, 50, 12_345, 12_345, 700, 19_999, 10_000, 9_999, 3] {
            reader.seek_to_record(target)?;
            assert_eq!(reader.position(), target);
            let record = reader.next_record()?.expect("record present");
            assert_eq!(String::from_utf8(record)?, line(target));
        }
        assert!(reader.next_record()?.is_some());
        reader.seek_to_record(20_000)?;
        assert!(reader.next_record()?.is_none());
        Ok(())
    }

    #[test]
    fn test_seek_without_checkpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.jsonl.gz");
        write_bundle(&path, 1_000)?;

        let mut reader = CheckpointedGzip::open(&path)?;
        reader.seek_to_record(900)?;
        assert_eq!(reader.next_record()?, Some(line(900).into_bytes()));
        reader.seek_to_record(10)?;
        assert_eq!(reader.next_record()?, Some(line(10).into_bytes()));
        Ok(())
    }

    #[test]
    fn test_corrupt_checkpoint_file_falls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bundle.jsonl.gz");
        write_bundle(&path, 2_000)?;
        std::fs::write(constants::checkpoint_path(&path), b"garbage")?;

        let mut reader = CheckpointedGzip::open(&path)?;
        reader.seek_to_record(1_500)?;
        assert_eq!(reader.next_record()?, Some(line(1_500).into_bytes()));
        Ok(())
    }
}
