//! Single-file docstore: lz4-compressed JSON records plus a sorted index.
//!
//! Directory layout after a build:
//!
//! ```text
//! <dir>/records.bin   length-prefixed lz4 records in source order
//! <dir>/records.pos   u64 byte offset of each record, for slicing
//! <dir>/records.idx   sorted identifier index -> byte offset
//! <dir>/BUILT         completion marker (JSON)
//! ```

use super::record_file::{self, PositionTable, RecordWriter};
use super::{
    is_index_corrupt, Build, BuildMarker, Docstore, Migrator, PositionalSource, Record,
    RecordCursor, RecordIter, RecordSource, Records, SliceSpec, Span, Staging,
};
use super::sorted_index::{IndexBuilder, Locator, SortedIndex};
use crate::constants;
use crate::error::Error;
use crate::format::format_number;
use crate::progress::ProgressBar;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Opened artefacts of a completed build.
struct Loaded {
    records_path: PathBuf,
    index: SortedIndex,
    positions: PositionTable,
}

impl Loaded {
    fn open(dir: &Path) -> Result<Self> {
        let marker = BuildMarker::read(dir).map_err(|e| Error::IndexCorrupt {
            path: dir.join(constants::BUILT_MARKER),
            reason: format!("{:#}", e),
        })?;
        let index = SortedIndex::open(&dir.join(constants::INDEX_FILE))?;
        let positions = PositionTable::open(&dir.join(constants::POSITIONS_FILE))?;
        if positions.len() != marker.records {
            return Err(Error::IndexCorrupt {
                path: positions.path().to_path_buf(),
                reason: format!(
                    "{} positions for {} records",
                    positions.len(),
                    marker.records
                ),
            }
            .into());
        }
        let records_path = dir.join(constants::RECORDS_FILE);
        if !records_path.is_file() {
            return Err(Error::IndexCorrupt {
                path: records_path,
                reason: "record file missing".into(),
            }
            .into());
        }
        Ok(Self {
            records_path,
            index,
            positions,
        })
    }
}

/// Lazily opened reader over `records.bin` that only seeks when the next
/// requested offset is not where the previous read ended.
struct RecordFileReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    offset: u64,
}

impl RecordFileReader {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            reader: None,
            offset: 0,
        }
    }

    fn read_at<T: Record>(&mut self, offset: u64) -> Result<T> {
        if self.reader.is_none() {
            let file = File::open(&self.path)
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            self.reader = Some(BufReader::new(file));
            self.offset = 0;
        }
        let Some(reader) = self.reader.as_mut() else {
            anyhow::bail!("record file reader not open");
        };
        if offset != self.offset {
            reader.seek(SeekFrom::Start(offset))?;
        }
        let record = record_file::read_record(reader);
        self.offset = reader.stream_position()?;
        match record {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Error::IndexCorrupt {
                path: self.path.clone(),
                reason: format!("offset {} is past the end of the record file", offset),
            }
            .into()),
            Err(e) => Err(e.context(format!(
                "Failed to read record at offset {} of {}",
                offset,
                self.path.display()
            ))),
        }
    }
}

struct Lz4Positions {
    loaded: Arc<Loaded>,
}

struct Lz4Cursor {
    loaded: Arc<Loaded>,
    file: RecordFileReader,
}

impl<T: Record> PositionalSource<T> for Lz4Positions {
    fn open_cursor(&self) -> Result<Box<dyn RecordCursor<T>>> {
        Ok(Box::new(Lz4Cursor {
            loaded: Arc::clone(&self.loaded),
            file: RecordFileReader::new(self.loaded.records_path.clone()),
        }))
    }
}

impl<T: Record> RecordCursor<T> for Lz4Cursor {
    fn read_at(&mut self, position: u64) -> Result<Option<T>> {
        match self.loaded.positions.offset(position) {
            Some(offset) => self.file.read_at(offset).map(Some),
            None => Ok(None),
        }
    }
}

/// Records at sorted, de-duplicated offsets, read on demand.
struct OffsetIter<T> {
    file: RecordFileReader,
    offsets: std::vec::IntoIter<u64>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Iterator for OffsetIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.next()?;
        Some(self.file.read_at(offset))
    }
}

/// Docstore kept in one directory, built from a [`RecordSource`].
///
/// ```no_run
/// use corpusio::docstore::{Docstore, Lz4Docstore, Record};
/// # #[derive(Clone, serde::Serialize, serde::Deserialize)]
/// # struct Doc { id: String, text: String }
/// # impl Record for Doc { fn id(&self) -> &str { &self.id } }
/// # fn main() -> anyhow::Result<()> {
/// let docs = vec![Doc { id: "d1".into(), text: "hello".into() }];
/// let store = Lz4Docstore::new("/data/docs.store", docs);
/// assert!(store.get("d1")?.is_some());
/// # Ok(())
/// # }
/// ```
pub struct Lz4Docstore<T: Record> {
    dir: PathBuf,
    source: Box<dyn RecordSource<T>>,
    migrator: Option<Migrator>,
    progress: bool,
    loaded: Mutex<Option<Arc<Loaded>>>,
    migrated: Mutex<bool>,
}

impl<T: Record> Lz4Docstore<T> {
    pub fn new<P: Into<PathBuf>, S: RecordSource<T> + 'static>(dir: P, source: S) -> Self {
        Self {
            dir: dir.into(),
            source: Box::new(source),
            migrator: None,
            progress: false,
            loaded: Mutex::new(None),
            migrated: Mutex::new(false),
        }
    }

    /// Applied once, before the store is first built or read.
    pub fn migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
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
        log::info!("[Docstore] Building {}", self.dir.display());
        let staging = Staging::create(&self.dir)?;
        let mut writer = RecordWriter::create(
            &staging.path().join(constants::RECORDS_FILE),
            &staging.path().join(constants::POSITIONS_FILE),
        )?;
        let mut index = IndexBuilder::new();
        let pb = ProgressBar::items(None, &format!("Building {}", self.name()), self.progress);

        for record in self.source.records()? {
            let record = record?;
            let offset = writer.append(&record)?;
            index.insert(record.id(), Locator::new(0, offset));
            pb.inc(1);
        }
        let count = writer.finish()?;
        pb.finish();
        index.write(&staging.path().join(constants::INDEX_FILE))?;
        BuildMarker::new(count, Vec::new()).write(staging.path())?;
        staging.commit(&self.dir)?;

        log::info!(
            "[Docstore] Built {} ({} records, {} ids) in {:.1}s",
            self.dir.display(),
            format_number(count),
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
        let loaded = Arc::new(Loaded::open(&self.dir)?);
        *guard = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Run `op` against the built store, rebuilding once if the artefacts
    /// turn out to be corrupt.
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

impl<T: Record> Build for Lz4Docstore<T> {
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

impl<T: Record> Docstore<T> for Lz4Docstore<T> {
    fn built(&self) -> bool {
        self.dir.join(constants::BUILT_MARKER).is_file()
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                log::debug!("[Docstore] Cleared {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear {}", self.dir.display())),
        }
    }

    fn count(&self) -> Result<u64> {
        self.with_store(|loaded| Ok(loaded.positions.len()))
    }

    fn get(&self, id: &str) -> Result<Option<T>> {
        self.with_store(|loaded| match loaded.index.get(id)? {
            Some(locator) => {
                let mut file = RecordFileReader::new(loaded.records_path.clone());
                file.read_at(locator.offset).map(Some)
            }
            None => Ok(None),
        })
    }

    fn get_many_iter(&self, ids: &[&str]) -> Result<RecordIter<T>> {
        let (path, offsets) = self.with_store(|loaded| {
            let mut offsets = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(locator) = loaded.index.get(id)? {
                    offsets.push(locator.offset);
                }
            }
            Ok((loaded.records_path.clone(), offsets))
        })?;
        let mut offsets = offsets;
        offsets.sort_unstable();
        offsets.dedup();
        Ok(Box::new(OffsetIter {
            file: RecordFileReader::new(path),
            offsets: offsets.into_iter(),
            _record: PhantomData::<fn() -> T>,
        }))
    }

    fn slice(&self, spec: &SliceSpec) -> Result<Records<T>> {
        let loaded = self.with_store(|loaded| Ok(Arc::clone(loaded)))?;
        let span = Span::all(loaded.positions.len()).sub(spec)?;
        Ok(Records::new(Arc::new(Lz4Positions { loaded }), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        text: String,
    }

    impl Record for Doc {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn docs(n: usize) -> Vec<Doc> {
        (0..n)
            .map(|i| Doc {
                id: format!("doc{}", i),
                text: format!("text of document {}", i),
            })
            .collect()
    }

    /// Counts how often the store scans its source.
    struct CountingSource {
        docs: Vec<Doc>,
        scans: Arc<AtomicUsize>,
    }

    impl RecordSource<Doc> for CountingSource {
        fn records(&self) -> Result<RecordIter<Doc>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.docs.records()
        }
    }

    #[test]
    fn test_get_and_count() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Lz4Docstore::new(dir.path().join("docs"), docs(300));
        assert!(!store.built());
        assert_eq!(store.get("doc42")?, Some(docs(43).remove(42)));
        assert!(store.built());
        assert_eq!(store.get("unknown")?, None);
        assert_eq!(store.count()?, 300);
        Ok(())
    }

    #[test]
    fn test_build_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scans = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            docs: docs(10),
            scans: Arc::clone(&scans),
        };
        let store = Lz4Docstore::new(dir.path().join("docs"), source);
        store.build()?;
        store.build()?;
        assert_eq!(scans.load(Ordering::SeqCst), 1);

        // A second handle over the same directory reuses the build.
        let again = Lz4Docstore::new(
            dir.path().join("docs"),
            CountingSource {
                docs: docs(10),
                scans: Arc::clone(&scans),
            },
        );
        assert_eq!(again.count()?, 10);
        assert_eq!(scans.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_get_many_omits_unknown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Lz4Docstore::new(dir.path().join("docs"), docs(100));
        let found = store.get_many(&["doc90", "missing", "doc3", "doc90"])?;
        assert_eq!(found.len(), 2);
        assert_eq!(found["doc3"].text, "text of document 3");
        assert_eq!(store.get_many_iter(&["doc90", "doc90", "doc1"])?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_iteration_and_slices() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Lz4Docstore::new(dir.path().join("docs"), docs(50));

        let all: Vec<Doc> = store.iter()?.collect::<Result<_>>()?;
        assert_eq!(all, docs(50));
        // Iteration restarts from the beginning.
        assert_eq!(store.iter()?.count(), 50);

        let nested: Vec<String> = store
            .slice(&SliceSpec::new(10, 20))?
            .slice(&SliceSpec::new(2, 5))?
            .map(|d| d.map(|d| d.id))
            .collect::<Result<_>>()?;
        assert_eq!(nested, vec!["doc12", "doc13", "doc14"]);

        let tail = store.slice(&SliceSpec::from(-2))?;
        assert_eq!(tail.len(), 2);
        let ids: Vec<String> = tail.map(|d| d.map(|d| d.id)).collect::<Result<_>>()?;
        assert_eq!(ids, vec!["doc48", "doc49"]);

        let half = store.slice(&SliceSpec::from(0.5).step(5))?;
        let ids: Vec<String> = half.map(|d| d.map(|d| d.id)).collect::<Result<_>>()?;
        assert_eq!(ids, vec!["doc25", "doc30", "doc35", "doc40", "doc45"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut records = docs(3);
        records.push(Doc {
            id: "doc1".into(),
            text: "second copy".into(),
        });
        let store = Lz4Docstore::new(dir.path().join("docs"), records);
        assert_eq!(store.count()?, 4);
        assert_eq!(store.iter()?.count(), 4);
        assert_eq!(store.get("doc1")?.map(|d| d.text), Some("second copy".to_string()));
        Ok(())
    }

    #[test]
    fn test_failed_build_leaves_no_marker() -> Result<()> {
        struct Failing;
        impl RecordSource<Doc> for Failing {
            fn records(&self) -> Result<RecordIter<Doc>> {
                let head = docs(5).into_iter().map(Ok);
                let tail = std::iter::once(Err(anyhow::anyhow!("source broke")));
                Ok(Box::new(head.chain(tail)))
            }
        }

        let dir = tempfile::tempdir()?;
        let store = Lz4Docstore::new(dir.path().join("docs"), Failing);
        assert!(store.build().is_err());
        assert!(!store.built());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupt_index_rebuilds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scans = Arc::new(AtomicUsize::new(0));
        let path = dir.path().join("docs");
        Lz4Docstore::new(
            &path,
            CountingSource {
                docs: docs(20),
                scans: Arc::clone(&scans),
            },
        )
        .build()?;
        fs::write(path.join(constants::INDEX_FILE), b"not an index")?;

        let store = Lz4Docstore::new(
            &path,
            CountingSource {
                docs: docs(20),
                scans: Arc::clone(&scans),
            },
        );
        assert_eq!(store.get("doc7")?.map(|d| d.id), Some("doc7".to_string()));
        assert_eq!(scans.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_migration_forces_rebuild() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("docs");
        let version = dir.path().join("docs.version");

        let v1 = Lz4Docstore::new(&path, docs(5))
            .migrator(Migrator::new(&version, "1").affects(&path));
        assert_eq!(v1.count()?, 5);

        let v2 = Lz4Docstore::new(&path, docs(8))
            .migrator(Migrator::new(&version, "2").affects(&path));
        assert_eq!(v2.count()?, 8);

        // Same version again: the existing build is kept.
        let v2_again = Lz4Docstore::new(&path, docs(1))
            .migrator(Migrator::new(&version, "2").affects(&path));
        assert_eq!(v2_again.count()?, 8);
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Lz4Docstore::new(dir.path().join("docs"), docs(5));
        store.build()?;
        store.clear()?;
        assert!(!store.built());
        assert!(!dir.path().join("docs").exists());
        assert_eq!(store.count()?, 5);
        Ok(())
    }
}
