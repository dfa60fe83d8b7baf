//! Downloads: ordered mirrors, hash verification and resumable HTTP.

pub mod config;
pub mod resume;
pub mod transport;

use crate::atomic;
use crate::context::Context;
use crate::error::{self, Error};
use crate::fio::{
    Availability, ByteStream, ExpectedHash, HashAlgorithm, HashingReader, PathResolvable,
    Resource, ResourceKind, Streamable,
};
use anyhow::{Context as _, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use config::{DownloadConfig, DownloadEntry};
pub use resume::{HttpDownload, ResumableReader};
pub use transport::{Credentials, HttpTransport, Transport, TransportRequest, TransportResponse};

/// A file the user may have placed on disk by hand.
///
/// When the file is missing, forcing it logs `message` (typically how to
/// obtain or link the file) and fails.
pub struct LocalMirror {
    path: PathBuf,
    message: Option<String>,
}

impl LocalMirror {
    pub fn new<P: Into<PathBuf>>(path: P, message: Option<String>) -> Self {
        Self {
            path: path.into(),
            message,
        }
    }

    pub fn location(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for LocalMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Local({:?})", self.path)
    }
}

impl Resource for LocalMirror {
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

impl PathResolvable for LocalMirror {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.path.exists() {
            if let Some(message) = &self.message {
                log::info!("{}", message);
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", self.path.display()),
            )
            .into());
        }
        Ok(self.path.clone())
    }
}

impl Streamable for LocalMirror {
    fn open(&self) -> Result<ByteStream> {
        let path = self.path(true)?;
        let file =
            fs::File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        Some(self)
    }
}

/// One candidate source of a download.
pub enum Mirror {
    Local(LocalMirror),
    Remote(Arc<dyn Streamable>),
}

impl Mirror {
    pub fn local<P: Into<PathBuf>>(path: P, message: Option<String>) -> Self {
        Mirror::Local(LocalMirror::new(path, message))
    }

    pub fn remote<S: Streamable + 'static>(source: S) -> Self {
        Mirror::Remote(Arc::new(source))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Mirror::Local(_))
    }

    fn availability(&self) -> Availability {
        match self {
            Mirror::Local(local) => local.availability(),
            Mirror::Remote(remote) => remote.availability(),
        }
    }

    fn open(&self) -> Result<ByteStream> {
        match self {
            Mirror::Local(local) => local.open(),
            Mirror::Remote(remote) => remote.open(),
        }
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mirror::Local(local) => write!(f, "{}", local),
            Mirror::Remote(remote) => write!(f, "{}", remote),
        }
    }
}

/// A file obtainable from an ordered list of mirrors.
///
/// The first forced resolution copies the first mirror that succeeds into
/// the cache path through a temp file, hashing as it goes; an integrity
/// mismatch discards the temp file and moves on to the next mirror.
pub struct Download {
    ctx: Arc<Context>,
    mirrors: Vec<Mirror>,
    expected: Option<ExpectedHash>,
    cache_path: Option<PathBuf>,
    agreement: Option<String>,
    stream_mode: bool,
    resolved: Mutex<Option<PathBuf>>,
}

impl Download {
    pub fn new(ctx: &Arc<Context>, mirrors: Vec<Mirror>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            mirrors,
            expected: None,
            cache_path: None,
            agreement: None,
            stream_mode: false,
            resolved: Mutex::new(None),
        }
    }

    pub fn expected(mut self, expected: Option<ExpectedHash>) -> Self {
        self.expected = expected;
        self
    }

    /// Where the file is kept. Without one it lands on a context temp path.
    pub fn cache_path<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.cache_path = path.map(Into::into);
        self
    }

    /// Usage-agreement notice logged once per context before fetching.
    pub fn agreement(mut self, notice: Option<String>) -> Self {
        self.agreement = notice;
        self
    }

    /// Stream straight from the single mirror instead of caching to disk.
    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    pub fn expected_hash(&self) -> Option<&ExpectedHash> {
        self.expected.as_ref()
    }

    fn target(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = resolved.as_ref() {
            return Ok(path.clone());
        }
        let path = self.ctx.temp_path()?;
        *resolved = Some(path.clone());
        Ok(path)
    }

    fn show_agreement(&self) {
        if let Some(notice) = &self.agreement {
            self.ctx.show_agreement(notice, notice);
        }
    }

    fn hashing(&self, stream: ByteStream, mirror: &Mirror) -> ByteStream {
        match &self.expected {
            Some(expected) => Box::new(HashingReader::new(stream, expected.clone(), mirror.to_string())),
            None => Box::new(HashingReader::unverified(stream, HashAlgorithm::Md5, mirror.to_string())),
        }
    }

    fn fetch(&self, target: &Path) -> Result<()> {
        self.show_agreement();
        let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

        for mirror in &self.mirrors {
            let outcome = atomic::write_atomic(target, |out| {
                let mut input = self.hashing(mirror.open()?, mirror);
                io::copy(&mut input, out).map_err(error::from_io)?;
                Ok(())
            });
            match outcome {
                Ok(()) => {
                    log::debug!("[Download] {} -> {}", mirror, target.display());
                    return Ok(());
                }
                Err(e) => {
                    if !mirror.is_local() {
                        log::warn!("[Download] {} failed: {:#}", mirror, e);
                    }
                    failures.push((mirror.to_string(), e));
                }
            }
        }

        let remote_after_local = self.mirrors.len() == 2 && self.mirrors[0].is_local();
        if self.mirrors.len() == 1 || remote_after_local {
            if let Some((_, last)) = failures.pop() {
                return Err(last);
            }
        }
        let attempts = failures
            .iter()
            .rev()
            .map(|(mirror, e)| format!("{} failed: {:#}", mirror, e))
            .collect();
        Err(Error::SourceUnavailable { attempts }.into())
    }
}

impl fmt::Display for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Download([")?;
        for (i, mirror) in self.mirrors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", mirror)?;
        }
        f.write_str("])")
    }
}

impl Resource for Download {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    fn availability(&self) -> Availability {
        if let Some(path) = &self.cache_path {
            if path.is_file() {
                return Availability::Available;
            }
        }
        let procurable = self
            .mirrors
            .iter()
            .any(|m| m.availability() != Availability::Unavailable);
        if procurable {
            Availability::Procurable
        } else {
            Availability::Unavailable
        }
    }
}

impl PathResolvable for Download {
    fn path(&self, force: bool) -> Result<PathBuf> {
        let target = self.target()?;
        if !force || target.exists() {
            return Ok(target);
        }
        self.fetch(&target)
            .with_context(|| format!("{} failed", self))?;
        Ok(target)
    }
}

impl Streamable for Download {
    fn open(&self) -> Result<ByteStream> {
        if self.stream_mode {
            let [mirror] = self.mirrors.as_slice() else {
                anyhow::bail!(
                    "{} cannot stream from {} mirrors",
                    self,
                    self.mirrors.len()
                );
            };
            self.show_agreement();
            return Ok(self.hashing(mirror.open()?, mirror));
        }
        let path = self.path(true)?;
        let file =
            fs::File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        if self.stream_mode {
            None
        } else {
            Some(self)
        }
    }
}
