//! Local lookup cache in front of a slow docstore.
//!
//! Records fetched by identifier are appended to `<dir>/records.bin` in the
//! same lz4 entry format the single-file store uses. Later lookups for the
//! same identifiers are served from that file without touching the full
//! store. Iteration, slicing and counting always go to the full store.

use super::record_file::{self, write_entry};
use super::{Build, Docstore, Record, RecordIter, Records, SliceSpec};
use crate::constants;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Identifier -> offset map of the append-only cache file.
struct CacheLog {
    path: PathBuf,
    offsets: HashMap<String, u64>,
    len: u64,
}

impl CacheLog {
    /// Scan the cache file. A torn entry at the tail (interrupted append)
    /// is cut off so later appends stay aligned.
    fn open<T: Record>(path: PathBuf) -> Result<Self> {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    offsets: HashMap::new(),
                    len: 0,
                })
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut offsets = HashMap::new();
        let mut good = 0u64;
        loop {
            match record_file::read_record::<T, _>(&mut reader) {
                Ok(Some(record)) => {
                    offsets.insert(record.id().to_string(), good);
                    good = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!(
                        "[Cache] Dropping damaged tail of {} at byte {}: {:#}",
                        path.display(),
                        good,
                        e
                    );
                    break;
                }
            }
        }
        if good < file_len {
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_len(good))
                .with_context(|| format!("Failed to truncate {}", path.display()))?;
        }
        Ok(Self {
            path,
            offsets,
            len: good,
        })
    }

    fn read_at<T: Record>(&self, reader: &mut Option<BufReader<File>>, offset: u64) -> Result<T> {
        if reader.is_none() {
            let file = File::open(&self.path)
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            *reader = Some(BufReader::new(file));
        }
        let Some(reader) = reader.as_mut() else {
            anyhow::bail!("cache reader unavailable");
        };
        reader.seek(SeekFrom::Start(offset))?;
        record_file::read_record(reader)?
            .with_context(|| format!("Missing entry at byte {} of {}", offset, self.path.display()))
    }

    fn append<T: Record>(&mut self, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        let mut offset = self.len;
        let mut added = Vec::with_capacity(records.len());
        let written = (|| -> Result<()> {
            for record in records {
                added.push((record.id().to_string(), offset));
                offset += write_entry(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
            Ok(())
        })();
        if let Err(e) = written {
            // Drop buffered bytes unflushed and cut the file back.
            let (file, _) = writer.into_parts();
            if let Err(cut) = file.set_len(self.len) {
                log::warn!("[Cache] Failed to roll back {}: {}", self.path.display(), cut);
            }
            return Err(e);
        }
        // Only entries that reached the disk become visible.
        self.offsets.extend(added);
        self.len = offset;
        Ok(())
    }
}

/// A docstore whose lookups are cached in a local lz4 record file.
///
/// ```no_run
/// # use corpusio::docstore::{CachedDocstore, Docstore, Lz4Docstore, Record};
/// # #[derive(serde::Serialize, serde::Deserialize, Clone)]
/// # struct Doc { id: String }
/// # impl Record for Doc { fn id(&self) -> &str { &self.id } }
/// # fn main() -> anyhow::Result<()> {
/// let full = Lz4Docstore::new("/data/slow.store", Vec::<Doc>::new());
/// let store = CachedDocstore::new(full, "/data/slow.cache");
/// let _hit = store.get("d1")?;
/// # Ok(())
/// # }
/// ```
pub struct CachedDocstore<T: Record, D> {
    full: D,
    dir: PathBuf,
    log: Mutex<Option<CacheLog>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record, D: Docstore<T>> CachedDocstore<T, D> {
    pub fn new<P: Into<PathBuf>>(full: D, dir: P) -> Self {
        Self {
            full,
            dir: dir.into(),
            log: Mutex::new(None),
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The store lookups fall back to.
    pub fn full_store(&self) -> &D {
        &self.full
    }

    /// Drop the local cache only; the full store is left alone.
    pub fn clear_cache(&self) -> Result<()> {
        let mut guard = self.log.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                log::debug!("[Cache] Cleared {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear {}", self.dir.display())),
        }
    }

    fn lookup(&self, ids: &[&str]) -> Result<Vec<T>> {
        let start = Instant::now();
        let mut guard = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(CacheLog::open::<T>(self.dir.join(constants::RECORDS_FILE))?);
        }
        let Some(cache) = guard.as_mut() else {
            anyhow::bail!("cache log unavailable");
        };

        let mut seen = HashSet::with_capacity(ids.len());
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        let mut reader = None;
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match cache.offsets.get(id) {
                Some(&offset) => found.push(cache.read_at::<T>(&mut reader, offset)?),
                None => missing.push(id),
            }
        }
        let hits = found.len();

        if !missing.is_empty() {
            let fetched: Vec<T> = self.full.get_many_iter(&missing)?.collect::<Result<_>>()?;
            cache.append(&fetched)?;
            found.extend(fetched);
        }
        log::debug!(
            "[Cache] {} ids: {} cached, {} fetched in {:?}",
            seen.len(),
            hits,
            found.len() - hits,
            start.elapsed()
        );
        Ok(found)
    }
}

impl<T: Record, D: Docstore<T>> Build for CachedDocstore<T, D> {
    fn build(&self) -> Result<()> {
        self.full.build()
    }

    fn name(&self) -> String {
        self.full.name()
    }
}

impl<T: Record, D: Docstore<T>> Docstore<T> for CachedDocstore<T, D> {
    fn built(&self) -> bool {
        self.full.built()
    }

    /// Clears the local cache and the full store.
    fn clear(&self) -> Result<()> {
        self.clear_cache()?;
        self.full.clear()
    }

    fn count(&self) -> Result<u64> {
        self.full.count()
    }

    fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.lookup(&[id])?.into_iter().next())
    }

    fn get_many_iter(&self, ids: &[&str]) -> Result<RecordIter<T>> {
        Ok(Box::new(self.lookup(ids)?.into_iter().map(Ok)))
    }

    fn slice(&self, spec: &SliceSpec) -> Result<Records<T>> {
        self.full.slice(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::Lz4Docstore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

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
                text: format!("body {}", i),
            })
            .collect()
    }

    /// Full store that counts the identifiers it is asked for.
    struct CountingStore {
        inner: Lz4Docstore<Doc>,
        requested: Arc<AtomicUsize>,
    }

    impl Build for CountingStore {
        fn build(&self) -> Result<()> {
            self.inner.build()
        }

        fn name(&self) -> String {
            self.inner.name()
        }
    }

    impl Docstore<Doc> for CountingStore {
        fn built(&self) -> bool {
            self.inner.built()
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }

        fn count(&self) -> Result<u64> {
            self.inner.count()
        }

        fn get(&self, id: &str) -> Result<Option<Doc>> {
            self.requested.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id)
        }

        fn get_many_iter(&self, ids: &[&str]) -> Result<RecordIter<Doc>> {
            self.requested.fetch_add(ids.len(), Ordering::SeqCst);
            self.inner.get_many_iter(ids)
        }

        fn slice(&self, spec: &SliceSpec) -> Result<Records<Doc>> {
            self.inner.slice(spec)
        }
    }

    fn cached(dir: &Path, requested: &Arc<AtomicUsize>) -> CachedDocstore<Doc, CountingStore> {
        let full = CountingStore {
            inner: Lz4Docstore::new(dir.join("full"), docs(200)),
            requested: Arc::clone(requested),
        };
        CachedDocstore::new(full, dir.join("cache"))
    }

    #[test]
    fn test_lookups_fill_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let requested = Arc::new(AtomicUsize::new(0));
        let store = cached(dir.path(), &requested);

        let found = store.get_many(&["doc5", "doc150", "doc5", "nope"])?;
        assert_eq!(found.len(), 2);
        assert_eq!(found["doc150"], docs(151).remove(150));
        assert_eq!(requested.load(Ordering::SeqCst), 3);

        // Cached ids skip the full store; unknown ones are asked again.
        assert_eq!(store.get("doc5")?, Some(docs(6).remove(5)));
        assert_eq!(requested.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_many(&["doc150", "nope"])?.len(), 1);
        assert_eq!(requested.load(Ordering::SeqCst), 4);

        assert_eq!(store.count()?, 200);
        assert_eq!(store.slice(&SliceSpec::new(0, 3))?.count(), 3);
        Ok(())
    }

    #[test]
    fn test_cache_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let requested = Arc::new(AtomicUsize::new(0));
        cached(dir.path(), &requested).get_many(&["doc1", "doc2"])?;
        assert_eq!(requested.load(Ordering::SeqCst), 2);

        let reopened = cached(dir.path(), &requested);
        assert_eq!(reopened.get_many(&["doc1", "doc2"])?.len(), 2);
        assert_eq!(requested.load(Ordering::SeqCst), 2);

        reopened.clear_cache()?;
        assert!(!reopened.dir().exists());
        assert_eq!(reopened.get("doc1")?, Some(docs(2).remove(1)));
        assert_eq!(requested.load(Ordering::SeqCst), 3);
        assert!(reopened.full_store().built());
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_cut_off() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let requested = Arc::new(AtomicUsize::new(0));
        cached(dir.path(), &requested).get_many(&["doc1", "doc2"])?;

        let log_path = dir.path().join("cache").join(constants::RECORDS_FILE);
        let intact = fs::metadata(&log_path)?.len();
        let mut file = OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(&[200, 0, 0, 0, 1, 2, 3])?;
        drop(file);

        let reopened = cached(dir.path(), &requested);
        assert_eq!(reopened.get("doc2")?, Some(docs(3).remove(2)));
        assert_eq!(fs::metadata(&log_path)?.len(), intact);
        assert_eq!(requested.load(Ordering::SeqCst), 2);

        // Appends after the cut stay readable.
        reopened.get("doc7")?;
        let again = cached(dir.path(), &requested);
        assert_eq!(again.get_many(&["doc1", "doc2", "doc7"])?.len(), 3);
        assert_eq!(requested.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
