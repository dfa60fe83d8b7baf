use super::{Availability, ByteStream, DirectoryResource, PathResolvable, Resource, ResourceKind, Streamable};
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;

/// A file inside a directory handle.
pub struct Join<D> {
    dir: D,
    relative: PathBuf,
}

impl<D: DirectoryResource> Join<D> {
    pub fn new<P: Into<PathBuf>>(dir: D, relative: P) -> Self {
        Self {
            dir,
            relative: relative.into(),
        }
    }
}

impl<D: DirectoryResource> fmt::Display for Join<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.join({:?})", self.dir, self.relative)
    }
}

impl<D: DirectoryResource> Resource for Join<D> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    /// A file already on disk is available whatever its directory reports;
    /// a directory that exists without the file means the file never will.
    fn availability(&self) -> Availability {
        if let Ok(dir) = self.dir.path(false) {
            if dir.join(&self.relative).exists() {
                return Availability::Available;
            }
        }
        match self.dir.availability() {
            Availability::Available => Availability::Unavailable,
            other => other,
        }
    }
}

impl<D: DirectoryResource> PathResolvable for Join<D> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        let path = self.dir.path(force)?.join(&self.relative);
        if force && !path.exists() {
            anyhow::bail!("{} not found in {}", self.relative.display(), self.dir);
        }
        Ok(path)
    }
}

impl<D: DirectoryResource> Streamable for Join<D> {
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
