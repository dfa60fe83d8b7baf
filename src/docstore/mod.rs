//! Indexed record stores.
//!
//! A docstore is built once from a record source and then answers lookups
//! by identifier, bulk lookups, ordered iteration and slicing. A build is
//! written into a staging directory that is renamed into place, and the
//! `BUILT` marker inside it is the only evidence that a build completed.

pub mod bundle;
pub mod bundled;
pub mod cached;
pub mod lz4_store;
pub mod migrate;
pub mod record_file;
pub mod slice;
pub mod sorted_index;
pub mod source;
pub mod zstd_bundle;

use crate::{atomic, constants};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub use bundle::{BundleFormat, BundleReader, GzipLinesBundle};
pub use bundled::BundledDocstore;
pub use cached::CachedDocstore;
pub use lz4_store::Lz4Docstore;
pub use migrate::Migrator;
pub use slice::{Bound, SliceSpec, Span};
pub use sorted_index::{IndexBuilder, Locator, SortedIndex};
pub use source::{JsonLines, RecordSource};
pub use zstd_bundle::ZstdFrameBundle;

/// A record type that can be stored: serializable and identified by a string.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Owned, lazily evaluated stream of records.
pub type RecordIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Operations shared by every docstore. Building comes from [`Build`].
pub trait Docstore<T: Record>: Build {
    fn built(&self) -> bool;

    /// Remove every artefact so the next access rebuilds.
    fn clear(&self) -> Result<()>;

    /// Records in storage order, duplicates included.
    fn count(&self) -> Result<u64>;

    /// Record with this identifier; `Ok(None)` when unknown.
    fn get(&self, id: &str) -> Result<Option<T>>;

    /// Records for the known identifiers among `ids`, in no particular
    /// order. Each storage location is read once.
    fn get_many_iter(&self, ids: &[&str]) -> Result<RecordIter<T>>;

    fn get_many(&self, ids: &[&str]) -> Result<HashMap<String, T>> {
        let mut found = HashMap::with_capacity(ids.len());
        for record in self.get_many_iter(ids)? {
            let record = record?;
            found.insert(record.id().to_string(), record);
        }
        Ok(found)
    }

    fn slice(&self, spec: &SliceSpec) -> Result<Records<T>>;

    fn iter(&self) -> Result<Records<T>> {
        self.slice(&SliceSpec::default())
    }
}

/// Something `build_all` can build.
pub trait Build: Send + Sync {
    /// Build if not built yet; a no-op otherwise.
    fn build(&self) -> Result<()>;

    fn name(&self) -> String;
}

/// Build independent stores on a pool of `threads` workers.
pub fn build_all(stores: &[&dyn Build], threads: usize) -> Result<()> {
    let start = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .context("Failed to start build pool")?;
    pool.install(|| {
        stores
            .par_iter()
            .map(|store| {
                store
                    .build()
                    .with_context(|| format!("Failed to build {}", store.name()))
            })
            .collect::<Result<Vec<()>>>()
    })?;
    log::info!(
        "[Docstore] Built {} stores in {:.1}s",
        stores.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Random access by storage position, used by [`Records`].
pub(crate) trait RecordCursor<T>: Send {
    /// Record at `position`, or `None` past the end. Increasing positions
    /// are read sequentially.
    fn read_at(&mut self, position: u64) -> Result<Option<T>>;
}

pub(crate) trait PositionalSource<T>: Send + Sync {
    fn open_cursor(&self) -> Result<Box<dyn RecordCursor<T>>>;
}

/// Lazy, re-sliceable sequence of records in storage order.
///
/// Nothing is read until the first call to `next`. Slicing a `Records`
/// yields a new sequence relative to its own elements, so
/// `store.slice(10..20).slice(2..5)` is `store.slice(12..15)`.
pub struct Records<T> {
    source: Arc<dyn PositionalSource<T>>,
    span: Span,
    next: u64,
    cursor: Option<Box<dyn RecordCursor<T>>>,
    done: bool,
}

impl<T: Record> Records<T> {
    pub(crate) fn new(source: Arc<dyn PositionalSource<T>>, span: Span) -> Self {
        Self {
            source,
            span,
            next: 0,
            cursor: None,
            done: false,
        }
    }

    /// Number of records the full sequence covers.
    pub fn len(&self) -> u64 {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn slice(&self, spec: &SliceSpec) -> Result<Records<T>> {
        Ok(Records::new(Arc::clone(&self.source), self.span.sub(spec)?))
    }

    fn read_next(&mut self) -> Result<Option<T>> {
        let Some(position) = self.span.position(self.next) else {
            return Ok(None);
        };
        if self.cursor.is_none() {
            self.cursor = Some(self.source.open_cursor()?);
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let record = cursor.read_at(position)?;
        self.next += 1;
        Ok(record)
    }
}

impl<T: Record> Iterator for Records<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Contents of the `BUILT` completion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMarker {
    pub format: String,
    pub records: u64,
    /// Records per bundle, for stores spanning several files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundle_counts: Vec<u64>,
    pub built_at: DateTime<Utc>,
    pub created_by: String,
}

impl BuildMarker {
    pub fn new(records: u64, bundle_counts: Vec<u64>) -> Self {
        Self {
            format: constants::DOCSTORE_FORMAT.to_string(),
            records,
            bundle_counts,
            built_at: Utc::now(),
            created_by: constants::created_by(),
        }
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(constants::BUILT_MARKER);
        let data = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("Malformed {}", path.display()))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic::write_bytes_atomic(&dir.join(constants::BUILT_MARKER), &json)
    }
}

/// Staging directory for a build; removed on drop unless committed.
pub(crate) struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    pub(crate) fn create(target: &Path) -> Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        Ok(Self {
            path: atomic::create_exclusive_dir(target)?,
            committed: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged build onto `target`. A target that another process
    /// already completed wins and the staged copy is discarded.
    pub(crate) fn commit(mut self, target: &Path) -> Result<()> {
        if target.join(constants::BUILT_MARKER).exists() {
            log::debug!(
                "[Docstore] {} was built concurrently; discarding {}",
                target.display(),
                self.path.display()
            );
            return Ok(());
        }
        if target.exists() {
            fs::remove_dir_all(target)
                .with_context(|| format!("Failed to remove incomplete {}", target.display()))?;
        }
        match fs::rename(&self.path, target) {
            Ok(()) => {
                self.committed = true;
                Ok(())
            }
            Err(_) if target.join(constants::BUILT_MARKER).exists() => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to move {} to {}", self.path.display(), target.display())
            }),
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}

pub(crate) fn is_index_corrupt(err: &anyhow::Error) -> bool {
    matches!(
        crate::error::classify(err),
        Some(crate::error::Error::IndexCorrupt { .. })
    )
}
