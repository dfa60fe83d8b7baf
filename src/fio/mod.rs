//! Lazily-resolved resource handles.
//!
//! A handle is a recipe: nothing is read, downloaded or extracted until
//! [`Streamable::open`] or [`PathResolvable::path`] is called with `force`.
//! Capabilities are traits, so an operator that needs a stream cannot be
//! built on top of a directory.
//!
//! ```no_run
//! use corpusio::fio::{Bytes, StreamExt, Streamable};
//! use std::io::Read;
//!
//! # fn main() -> anyhow::Result<()> {
//! let handle = Bytes::new(std::fs::read("archive.tar.gz")?)
//!     .cache("/tmp/archive.tar.gz")
//!     .decompress_gzip()
//!     .extract_from_tar("docs/b.txt");
//! let mut text = String::new();
//! handle.open()?.read_to_string(&mut text)?;
//! # Ok(())
//! # }
//! ```

pub mod alternatives;
pub mod archive;
pub mod cache;
pub mod compress;
pub mod hash;
pub mod join;
pub mod sources;

use anyhow::Result;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use alternatives::{Alternatives, DirectoryGroup, FileGroup};
pub use archive::{FilterTar, TarExtractAll, TarMember, ZipExtractAll, ZipMember};
pub use cache::Cache;
pub use compress::{Bunzip2, Gunzip, Lz4Decode, ZstdDecode};
pub use hash::{ExpectedHash, HashAlgorithm, HashingReader, VerifyHash};
pub use join::Join;
pub use sources::{Bytes, Concat, Directory, File};

/// Byte stream produced by resolving a handle; closed on drop.
pub type ByteStream = Box<dyn Read + Send>;

/// How cheaply a handle can be resolved right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Availability {
    /// No way to produce the content
    Unavailable,
    /// On disk, ready to read
    Available,
    /// Producible with work (download, decompression, extraction)
    Procurable,
}

impl Availability {
    /// Availability of a handle that does work on top of an input with this availability.
    pub fn chained(self) -> Self {
        match self {
            Availability::Unavailable => Availability::Unavailable,
            Availability::Available | Availability::Procurable => Availability::Procurable,
        }
    }

    /// Least available of two inputs.
    pub fn worst(self, other: Self) -> Self {
        use Availability::*;
        match (self, other) {
            (Unavailable, _) | (_, Unavailable) => Unavailable,
            (Procurable, _) | (_, Procurable) => Procurable,
            _ => Available,
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Availability::Unavailable => "unavailable",
            Availability::Available => "available",
            Availability::Procurable => "procurable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Stream,
    RegularFile,
    Directory,
}

/// Common surface of every handle. `Display` renders the recipe.
pub trait Resource: fmt::Display + Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn availability(&self) -> Availability;
}

/// Handles that produce bytes.
pub trait Streamable: Resource {
    fn open(&self) -> Result<ByteStream>;

    /// File view of this handle when it also resolves to a regular file.
    fn as_file(&self) -> Option<&dyn PathResolvable> {
        None
    }

    /// A file whose content this handle reproduces only after a hash check.
    fn verified_file(&self) -> Option<(&dyn PathResolvable, &ExpectedHash)> {
        None
    }
}

/// Handles that resolve to a location on disk.
///
/// `path(false)` never does more than compute the location; `path(true)`
/// materializes it and fails when that is impossible.
pub trait PathResolvable: Resource {
    fn path(&self, force: bool) -> Result<PathBuf>;
}

/// Regular-file handles: readable and located on disk.
pub trait FileResource: Streamable + PathResolvable {}

impl<T: Streamable + PathResolvable + ?Sized> FileResource for T {}

/// Marker for handles that resolve to a directory.
pub trait DirectoryResource: PathResolvable {}

impl<T: Resource + ?Sized> Resource for Arc<T> {
    fn kind(&self) -> ResourceKind {
        (**self).kind()
    }

    fn availability(&self) -> Availability {
        (**self).availability()
    }
}

impl<T: Streamable + ?Sized> Streamable for Arc<T> {
    fn open(&self) -> Result<ByteStream> {
        (**self).open()
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        (**self).as_file()
    }

    fn verified_file(&self) -> Option<(&dyn PathResolvable, &ExpectedHash)> {
        (**self).verified_file()
    }
}

impl<T: PathResolvable + ?Sized> PathResolvable for Arc<T> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        (**self).path(force)
    }
}

impl<T: DirectoryResource + ?Sized> DirectoryResource for Arc<T> {}

/// Chainable operators over stream handles.
pub trait StreamExt: Streamable + Sized {
    /// Materialize to `path` on first forced resolution.
    fn cache<P: Into<PathBuf>>(self, path: P) -> Cache<Self> {
        Cache::new(self, path)
    }

    fn decompress_gzip(self) -> Gunzip<Self> {
        Gunzip::new(self)
    }

    fn decompress_bz2(self) -> Bunzip2<Self> {
        Bunzip2::new(self)
    }

    fn decompress_lz4(self) -> Lz4Decode<Self> {
        Lz4Decode::new(self)
    }

    fn decompress_zstd(self) -> ZstdDecode<Self> {
        ZstdDecode::new(self)
    }

    fn verify_hash(self, expected: ExpectedHash) -> VerifyHash<Self> {
        VerifyHash::new(self, expected)
    }

    fn extract_from_tar<S: Into<String>>(self, member: S) -> TarMember<Self> {
        TarMember::new(self, member)
    }

    fn extract_all_tar<P: Into<PathBuf>>(self, dir: P, globs: Option<Vec<String>>) -> TarExtractAll<Self> {
        TarExtractAll::new(self, dir, globs)
    }

    /// Write the members matching `globs` to a new tar file at `output`.
    fn filter_tar<P: Into<PathBuf>>(self, output: P, globs: Vec<String>) -> FilterTar<Self> {
        FilterTar::new(self, output, globs)
    }

    fn extract_from_zip<S: Into<String>>(self, member: S) -> ZipMember<Self> {
        ZipMember::new(self, member)
    }

    fn extract_all_zip<P: Into<PathBuf>>(self, dir: P) -> ZipExtractAll<Self> {
        ZipExtractAll::new(self, dir)
    }
}

impl<T: Streamable + Sized> StreamExt for T {}

/// Chainable operators over directory handles.
pub trait DirectoryExt: DirectoryResource + Sized {
    fn join<P: Into<PathBuf>>(self, relative: P) -> Join<Self> {
        Join::new(self, relative)
    }
}

impl<T: DirectoryResource + Sized> DirectoryExt for T {}

/// Availability of a materializing operator: done if its output exists,
/// otherwise one step of work on top of its input.
pub(crate) fn materialized_or(path: &Path, input: Availability) -> Availability {
    if path.exists() {
        Availability::Available
    } else {
        input.chained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chained_is_monotone() {
        assert_eq!(Availability::Available.chained(), Availability::Procurable);
        assert_eq!(Availability::Procurable.chained(), Availability::Procurable);
        assert_eq!(Availability::Unavailable.chained(), Availability::Unavailable);
    }

    #[test]
    fn test_worst() {
        use Availability::*;
        assert_eq!(Available.worst(Available), Available);
        assert_eq!(Available.worst(Procurable), Procurable);
        assert_eq!(Procurable.worst(Unavailable), Unavailable);
    }

    #[test]
    fn test_recipe_rendering() {
        let handle = Bytes::new(b"abc".to_vec())
            .cache("/tmp/x.gz")
            .decompress_gzip()
            .extract_from_tar("b.txt");
        assert_eq!(
            handle.to_string(),
            "Bytes(3 bytes).cache(\"/tmp/x.gz\").decompress_gzip().extract_from_tar(\"b.txt\")"
        );
        assert_eq!(handle.kind(), ResourceKind::Stream);
    }
}
