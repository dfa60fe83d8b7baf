use super::{materialized_or, Availability, ByteStream, PathResolvable, Resource, ResourceKind, Streamable};
use crate::{atomic, error};
use anyhow::{Context, Result};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

/// Materializes a stream to a regular file on first forced resolution.
///
/// The copy goes through a `.tmpN` sibling and is renamed into place only when
/// the whole input was read, so a partial cache file is never visible.
pub struct Cache<S> {
    input: S,
    path: PathBuf,
}

impl<S: Streamable> Cache<S> {
    pub fn new<P: Into<PathBuf>>(input: S, path: P) -> Self {
        Self {
            input,
            path: path.into(),
        }
    }

    fn materialize(&self) -> Result<()> {
        let start = Instant::now();
        log::debug!("[Cache] Materializing {}", self.path.display());
        atomic::write_atomic(&self.path, |file| {
            let mut stream = self.input.open()?;
            let copied = io::copy(&mut stream, file).map_err(error::from_io)?;
            log::debug!(
                "[Cache] Wrote {} to {} in {}",
                crate::format::format_bytes(copied),
                self.path.display(),
                crate::format::format_duration(start.elapsed())
            );
            Ok(())
        })
        .with_context(|| format!("{} failed", self))
    }
}

impl<S: Streamable> fmt::Display for Cache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.cache({:?})", self.input, self.path)
    }
}

impl<S: Streamable> Resource for Cache<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    fn availability(&self) -> Availability {
        materialized_or(&self.path, self.input.availability())
    }
}

impl<S: Streamable> PathResolvable for Cache<S> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.path.exists() {
            self.materialize()?;
        }
        Ok(self.path.clone())
    }
}

impl<S: Streamable> Streamable for Cache<S> {
    fn open(&self) -> Result<ByteStream> {
        let path = self.path(true)?;
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        Some(self)
    }
}
