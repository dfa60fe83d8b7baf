//! Leaf handles: local files and directories, in-memory bytes, concatenation.

use super::{
    Availability, ByteStream, DirectoryResource, PathResolvable, Resource, ResourceKind,
    Streamable,
};
use anyhow::{Context, Result};
use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// A regular file that already exists (or is expected to) on disk.
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File({:?})", self.path)
    }
}

impl Resource for File {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    fn availability(&self) -> Availability {
        if self.path.is_file() {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

impl Streamable for File {
    fn open(&self) -> Result<ByteStream> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        Ok(Box::new(file))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        Some(self)
    }
}

impl PathResolvable for File {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.path.is_file() {
            anyhow::bail!("{} does not exist", self.path.display());
        }
        Ok(self.path.clone())
    }
}

/// A directory on disk.
#[derive(Debug, Clone)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Directory({:?})", self.path)
    }
}

impl Resource for Directory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Directory
    }

    fn availability(&self) -> Availability {
        if self.path.is_dir() {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

impl PathResolvable for Directory {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.path.is_dir() {
            anyhow::bail!("directory {} does not exist", self.path.display());
        }
        Ok(self.path.clone())
    }
}

impl DirectoryResource for Directory {}

/// In-memory content, always available.
#[derive(Debug, Clone)]
pub struct Bytes {
    data: Arc<[u8]>,
}

impl Bytes {
    pub fn new<B: Into<Vec<u8>>>(data: B) -> Self {
        Self {
            data: Arc::from(data.into()),
        }
    }
}

impl From<&str> for Bytes {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({} bytes)", self.data.len())
    }
}

impl Resource for Bytes {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        Availability::Available
    }
}

/// `Cursor` over a shared buffer, so opening never copies.
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Streamable for Bytes {
    fn open(&self) -> Result<ByteStream> {
        Ok(Box::new(Cursor::new(SharedBytes(Arc::clone(&self.data)))))
    }
}

/// Streams its inputs one after another.
pub struct Concat {
    inputs: Vec<Arc<dyn Streamable>>,
}

impl Concat {
    pub fn new(inputs: Vec<Arc<dyn Streamable>>) -> Self {
        Self { inputs }
    }
}

impl fmt::Display for Concat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Concat([")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", input)?;
        }
        f.write_str("])")
    }
}

impl Resource for Concat {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        self.inputs
            .iter()
            .fold(Availability::Available, |acc, input| acc.worst(input.availability()))
    }
}

impl Streamable for Concat {
    fn open(&self) -> Result<ByteStream> {
        Ok(Box::new(ConcatReader {
            inputs: self.inputs.clone(),
            next: 0,
            current: None,
        }))
    }
}

/// Opens each input only when the previous one is exhausted.
struct ConcatReader {
    inputs: Vec<Arc<dyn Streamable>>,
    next: usize,
    current: Option<ByteStream>,
}

impl Read for ConcatReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                let Some(input) = self.inputs.get(self.next) else {
                    return Ok(0);
                };
                self.next += 1;
                let stream = input.open().map_err(crate::error::into_io)?;
                self.current = Some(stream);
            }
            if let Some(stream) = self.current.as_mut() {
                let n = stream.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
        }
    }
}
