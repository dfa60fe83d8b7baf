//! Docstore spanning many bundle files.
//!
//! The index directory holds `records.idx`, mapping each identifier to a
//! (bundle number, record position within the bundle) locator, and the
//! `BUILT` marker, which also records how many records each bundle holds so
//! a global position maps to a bundle and a local position.

use super::bundle::{BundleFormat, BundleReader};
use super::sorted_index::{IndexBuilder, Locator, SortedIndex};
use super::{
    is_index_corrupt, Build, BuildMarker, Docstore, Migrator, PositionalSource, Record,
    RecordCursor, RecordIter, Records, SliceSpec, Span, Staging,
};
use crate::constants;
use crate::error::Error;
use crate::fio::FileResource;
use crate::format::format_number;
use crate::progress::ProgressBar;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct Loaded {
    index: SortedIndex,
    format: Arc<dyn BundleFormat>,
    paths: Vec<PathBuf>,
    /// First global position of each bundle
    starts: Vec<u64>,
    total: u64,
}

impl Loaded {
    fn open(dir: &Path, bundles: &[Arc<dyn FileResource>], format: Arc<dyn BundleFormat>) -> Result<Self> {
        let marker = BuildMarker::read(dir).map_err(|e| Error::IndexCorrupt {
            path: dir.join(constants::BUILT_MARKER),
            reason: format!("{:#}", e),
        })?;
        if marker.bundle_counts.len() != bundles.len() {
            return Err(Error::IndexCorrupt {
                path: dir.join(constants::BUILT_MARKER),
                reason: format!(
                    "built over {} bundles, {} configured",
                    marker.bundle_counts.len(),
                    bundles.len()
                ),
            }
            .into());
        }
        let index = SortedIndex::open(&dir.join(constants::INDEX_FILE))?;

        let mut starts = Vec::with_capacity(bundles.len());
        let mut total = 0u64;
        for count in &marker.bundle_counts {
            starts.push(total);
            total += count;
        }
        let paths = bundles
            .iter()
            .map(|bundle| bundle.path(true))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            index,
            format,
            paths,
            starts,
            total,
        })
    }

    /// Bundle number and local position of a global position.
    fn locate(&self, position: u64) -> Option<(usize, u64)> {
        if position >= self.total {
            return None;
        }
        let bundle = self.starts.partition_point(|&start| start <= position).checked_sub(1)?;
        Some((bundle, position - self.starts[bundle]))
    }

    fn open_bundle(&self, bundle: usize) -> Result<Box<dyn BundleReader>> {
        let path = self.paths.get(bundle).ok_or_else(|| Error::IndexCorrupt {
            path: PathBuf::from(constants::INDEX_FILE),
            reason: format!("locator names bundle {} of {}", bundle, self.paths.len()),
        })?;
        self.format.open(path)
    }

    /// Record at `local` in an open bundle. A missing record means the
    /// bundle no longer matches the index.
    fn read<T: Record>(&self, bundle: usize, reader: &mut dyn BundleReader, local: u64) -> Result<T> {
        let path = &self.paths[bundle];
        reader.seek_to_record(local)?;
        let Some(bytes) = reader.next_record()? else {
            return Err(Error::IndexCorrupt {
                path: path.clone(),
                reason: format!("record {} is past the end of the bundle", local),
            }
            .into());
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed record {} in {}", local, path.display()))
    }
}

struct BundledPositions {
    loaded: Arc<Loaded>,
}

struct BundledCursor {
    loaded: Arc<Loaded>,
    current: Option<(usize, Box<dyn BundleReader>)>,
}

impl BundledCursor {
    fn reader(&mut self, bundle: usize) -> Result<&mut dyn BundleReader> {
        if !matches!(&self.current, Some((open, _)) if *open == bundle) {
            self.current = Some((bundle, self.loaded.open_bundle(bundle)?));
        }
        match self.current.as_mut() {
            Some((_, reader)) => Ok(reader.as_mut()),
            None => anyhow::bail!("bundle {} not open", bundle),
        }
    }
}

impl<T: Record> PositionalSource<T> for BundledPositions {
    fn open_cursor(&self) -> Result<Box<dyn RecordCursor<T>>> {
        Ok(Box::new(BundledCursor {
            loaded: Arc::clone(&self.loaded),
            current: None,
        }))
    }
}

impl<T: Record> RecordCursor<T> for BundledCursor {
    fn read_at(&mut self, position: u64) -> Result<Option<T>> {
        let Some((bundle, local)) = self.loaded.locate(position) else {
            return Ok(None);
        };
        let loaded = Arc::clone(&self.loaded);
        let reader = self.reader(bundle)?;
        loaded.read(bundle, reader, local).map(Some)
    }
}

/// Requested positions grouped by bundle; each bundle is opened once and
/// read forward.
struct GroupedIter<T> {
    cursor: BundledCursor,
    groups: std::vec::IntoIter<(usize, u64)>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Iterator for GroupedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let (bundle, local) = self.groups.next()?;
        let loaded = Arc::clone(&self.cursor.loaded);
        Some(
            self.cursor
                .reader(bundle)
                .and_then(|reader| loaded.read(bundle, reader, local)),
        )
    }
}

/// One logical docstore over many physical bundles.
///
/// Bundles are file handles, so they may be downloads or archive members
/// that are only materialized when the index is built.
pub struct BundledDocstore<T: Record> {
    dir: PathBuf,
    bundles: Vec<Arc<dyn FileResource>>,
    format: Arc<dyn BundleFormat>,
    migrator: Option<Migrator>,
    progress: bool,
    loaded: Mutex<Option<Arc<Loaded>>>,
    migrated: Mutex<bool>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> BundledDocstore<T> {
    pub fn new<P, F>(dir: P, bundles: Vec<Arc<dyn FileResource>>, format: F) -> Self
    where
        P: Into<PathBuf>,
        F: BundleFormat + 'static,
    {
        Self {
            dir: dir.into(),
            bundles,
            format: Arc::new(format),
            migrator: None,
            progress: false,
            loaded: Mutex::new(None),
            migrated: Mutex::new(false),
            _record: PhantomData,
        }
    }

    pub fn migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    fn migrate(&self) -> Result<()> {
        let Some(migrator) = &self.migrator else {
            return Ok(());
        };
        let mut migrated = self.migrated.lock().unwrap_or_else(|e| e.into_inner());
        if !*migrated {
            if migrator.apply()? {
                *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = None;
            }
            *migrated = true;
        }
        Ok(())
    }

    fn build_into_staging(&self) -> Result<()> {
        let start = Instant::now();
        log::info!(
            "[Docstore] Indexing {} {} bundles into {}",
            self.bundles.len(),
            self.format.name(),
            self.dir.display()
        );
        let staging = Staging::create(&self.dir)?;
        let mut index = IndexBuilder::new();
        let mut counts = Vec::with_capacity(self.bundles.len());
        let pb = ProgressBar::items(
            Some(self.bundles.len() as u64),
            &format!("Indexing {}", self.name()),
            self.progress,
        );

        for (number, bundle) in self.bundles.iter().enumerate() {
            let bundle_start = Instant::now();
            let path = bundle.path(true)?;
            let count = self.format.scan(&path, &mut |position, bytes| {
                let record: T = serde_json::from_slice(bytes).with_context(|| {
                    format!("Malformed record {} in {}", position, path.display())
                })?;
                index.insert(record.id(), Locator::new(number as u32, position));
                Ok(())
            })?;
            log::debug!(
                "[Docstore] Bundle {} ({}): {} records in {:.3}s",
                number,
                path.display(),
                count,
                bundle_start.elapsed().as_secs_f64()
            );
            counts.push(count);
            pb.inc(1);
        }
        pb.finish();

        let total: u64 = counts.iter().sum();
        index.write(&staging.path().join(constants::INDEX_FILE))?;
        BuildMarker::new(total, counts).write(staging.path())?;
        staging.commit(&self.dir)?;

        log::info!(
            "[Docstore] Indexed {} records ({} ids) in {:.1}s",
            format_number(total),
            format_number(index.len()),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn loaded(&self) -> Result<Arc<Loaded>> {
        self.migrate()?;
        let mut guard = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(loaded) = guard.as_ref() {
            return Ok(Arc::clone(loaded));
        }
        if !self.built() {
            self.build_into_staging()?;
        }
        let loaded = Arc::new(Loaded::open(&self.dir, &self.bundles, Arc::clone(&self.format))?);
        *guard = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn with_store<R>(&self, op: impl Fn(&Arc<Loaded>) -> Result<R>) -> Result<R> {
        match self.loaded().and_then(|loaded| op(&loaded)) {
            Err(e) if is_index_corrupt(&e) => {
                log::warn!(
                    "[Docstore] {} is corrupt ({:#}); rebuilding",
                    self.dir.display(),
                    e
                );
                self.clear()?;
                let loaded = self.loaded()?;
                op(&loaded)
            }
            other => other,
        }
    }
}

impl<T: Record> Build for BundledDocstore<T> {
    fn build(&self) -> Result<()> {
        self.with_store(|_| Ok(()))
    }

    fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }
}

impl<T: Record> Docstore<T> for BundledDocstore<T> {
    fn built(&self) -> bool {
        self.dir.join(constants::BUILT_MARKER).is_file()
    }

    /// Removes the index; bundles and their checkpoint files are kept.
    fn clear(&self) -> Result<()> {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = None;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear {}", self.dir.display())),
        }
    }

    fn count(&self) -> Result<u64> {
        self.with_store(|loaded| Ok(loaded.total))
    }

    fn get(&self, id: &str) -> Result<Option<T>> {
        self.with_store(|loaded| {
            let Some(locator) = loaded.index.get(id)? else {
                return Ok(None);
            };
            let bundle = locator.bundle as usize;
            let mut reader = loaded.open_bundle(bundle)?;
            loaded.read(bundle, reader.as_mut(), locator.offset).map(Some)
        })
    }

    fn get_many_iter(&self, ids: &[&str]) -> Result<RecordIter<T>> {
        let (loaded, groups) = self.with_store(|loaded| {
            let mut groups: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
            for id in ids {
                if let Some(locator) = loaded.index.get(id)? {
                    groups.entry(locator.bundle).or_default().push(locator.offset);
                }
            }
            Ok((Arc::clone(loaded), groups))
        })?;

        let mut ordered = Vec::new();
        for (bundle, mut positions) in groups {
            positions.sort_unstable();
            positions.dedup();
            ordered.extend(positions.into_iter().map(|p| (bundle as usize, p)));
        }
        Ok(Box::new(GroupedIter {
            cursor: BundledCursor {
                loaded,
                current: None,
            },
            groups: ordered.into_iter(),
            _record: PhantomData::<fn() -> T>,
        }))
    }

    fn slice(&self, spec: &SliceSpec) -> Result<Records<T>> {
        let loaded = self.with_store(|loaded| Ok(Arc::clone(loaded)))?;
        let span = Span::all(loaded.total).sub(spec)?;
        Ok(Records::new(Arc::new(BundledPositions { loaded }), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::{GzipLinesBundle, ZstdFrameBundle};
    use crate::fio::File as FileHandle;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde::{Deserialize, Serialize};
    use std::io::Write;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Op {
        id: String,
        seq: u64,
    }

    impl Record for Op {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn line(seq: u64) -> String {
        format!("{{\"id\":\"op{}\",\"seq\":{}}}", seq, seq)
    }

    /// `sizes[i]` records per bundle, numbered globally.
    fn gzip_bundles(dir: &Path, sizes: &[u64]) -> Result<Vec<Arc<dyn FileResource>>> {
        let mut bundles: Vec<Arc<dyn FileResource>> = Vec::new();
        let mut seq = 0;
        for (i, size) in sizes.iter().enumerate() {
            let path = dir.join(format!("part-{:03}.jsonl.gz", i));
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            for _ in 0..*size {
                writeln!(encoder, "{}", line(seq))?;
                seq += 1;
            }
            fs::write(&path, encoder.finish()?)?;
            bundles.push(Arc::new(FileHandle::new(path)));
        }
        Ok(bundles)
    }

    #[test]
    fn test_gzip_bundles() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bundles = gzip_bundles(dir.path(), &[400, 0, 250, 350])?;
        let store: BundledDocstore<Op> = BundledDocstore::new(
            dir.path().join("ops.index"),
            bundles,
            GzipLinesBundle::new().frequency(50),
        );

        assert_eq!(store.count()?, 1000);
        assert_eq!(store.get("op0")?.map(|op| op.seq), Some(0));
        assert_eq!(store.get("op651")?.map(|op| op.seq), Some(651));
        assert_eq!(store.get("op1000")?, None);

        let found = store.get_many(&["op999", "op5", "nope", "op400", "op401"])?;
        let mut seqs: Vec<u64> = found.values().map(|op| op.seq).collect();
        seqs.sort();
        assert_eq!(seqs, vec![5, 400, 401, 999]);

        let window: Vec<u64> = store
            .slice(&SliceSpec::new(390, 420))?
            .slice(&SliceSpec::new(5, 15))?
            .map(|op| op.map(|op| op.seq))
            .collect::<Result<_>>()?;
        assert_eq!(window, (395..405).collect::<Vec<_>>());

        let all: Vec<u64> = store.iter()?.map(|op| op.map(|op| op.seq)).collect::<Result<_>>()?;
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_zstd_bundles() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut bundles: Vec<Arc<dyn FileResource>> = Vec::new();
        for b in 0..3u64 {
            let path = dir.path().join(format!("{:06}.jsonl.zst", b));
            crate::docstore::zstd_bundle::write_bundle(&path, (b * 150..(b + 1) * 150).map(line))?;
            bundles.push(Arc::new(FileHandle::new(path)));
        }
        let store: BundledDocstore<Op> =
            BundledDocstore::new(dir.path().join("index"), bundles, ZstdFrameBundle);

        assert_eq!(store.count()?, 450);
        assert_eq!(store.get("op301")?.map(|op| op.seq), Some(301));
        let tail: Vec<u64> = store
            .slice(&SliceSpec::from(-3))?
            .map(|op| op.map(|op| op.seq))
            .collect::<Result<_>>()?;
        assert_eq!(tail, vec![447, 448, 449]);
        assert_eq!(store.get_many_iter(&["op10", "op449", "op160", "op10"])?.count(), 3);
        Ok(())
    }

    #[test]
    fn test_bundle_set_change_rebuilds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bundles = gzip_bundles(dir.path(), &[10, 10])?;
        let index = dir.path().join("index");
        let first: BundledDocstore<Op> =
            BundledDocstore::new(&index, bundles[..1].to_vec(), GzipLinesBundle::new());
        assert_eq!(first.count()?, 10);

        let second: BundledDocstore<Op> =
            BundledDocstore::new(&index, bundles, GzipLinesBundle::new());
        assert_eq!(second.count()?, 20);
        assert_eq!(second.get("op15")?.map(|op| op.seq), Some(15));
        Ok(())
    }
}
