//! Equivalent sources with automatic fallback.

use super::{
    Availability, ByteStream, DirectoryResource, FileResource, HashingReader, PathResolvable,
    Resource, ResourceKind, Streamable,
};
use crate::context::Context;
use crate::error::{self, Error};
use crate::progress::ProgressBar;
use crate::{atomic, constants};
use anyhow::{Context as _, Result};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Group whose winner is materialized as a regular file.
pub struct FileGroup;

/// Group whose winner is linked as a directory.
pub struct DirectoryGroup;

enum Source {
    Stream(Arc<dyn Streamable>),
    File(Arc<dyn FileResource>),
    Directory(Arc<dyn DirectoryResource>),
}

impl Source {
    fn availability(&self) -> Availability {
        match self {
            Source::Stream(s) => s.availability(),
            Source::File(f) => f.availability(),
            Source::Directory(d) => d.availability(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Stream(s) => write!(f, "{}", s),
            Source::File(s) => write!(f, "{}", s),
            Source::Directory(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered equivalent sources resolved onto one stable path.
///
/// Resolution tries every Available source in order, then every Procurable
/// one, and stops at the first success. Files and directories are symlinked;
/// streams are copied through a temp file, except a hash-verified stream over
/// a local file, which is checked and then linked relative to the target.
pub struct Alternatives<G> {
    ctx: Arc<Context>,
    sources: Vec<Source>,
    target: Mutex<Option<PathBuf>>,
    _group: PhantomData<G>,
}

impl Alternatives<FileGroup> {
    /// File group materialized at `path`, or at a context temp path when `None`.
    pub fn files(ctx: &Arc<Context>, path: Option<PathBuf>) -> Self {
        Self::with_target(ctx, path)
    }

    pub fn stream<S: Streamable + 'static>(mut self, source: S) -> Self {
        self.sources.push(Source::Stream(Arc::new(source)));
        self
    }

    pub fn file<F: FileResource + 'static>(mut self, source: F) -> Self {
        self.sources.push(Source::File(Arc::new(source)));
        self
    }
}

impl Alternatives<DirectoryGroup> {
    pub fn directories(ctx: &Arc<Context>, path: Option<PathBuf>) -> Self {
        Self::with_target(ctx, path)
    }

    pub fn directory<D: DirectoryResource + 'static>(mut self, source: D) -> Self {
        self.sources.push(Source::Directory(Arc::new(source)));
        self
    }
}

impl<G> Alternatives<G> {
    fn with_target(ctx: &Arc<Context>, path: Option<PathBuf>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            sources: Vec::new(),
            target: Mutex::new(path),
            _group: PhantomData,
        }
    }

    fn target(&self) -> Result<PathBuf> {
        let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = target.as_ref() {
            return Ok(path.clone());
        }
        let path = self.ctx.temp_path()?;
        *target = Some(path.clone());
        Ok(path)
    }

    fn resolve(&self) -> Result<PathBuf> {
        let target = self.target()?;
        if target.exists() {
            return Ok(target);
        }

        let availability: Vec<Availability> =
            self.sources.iter().map(Source::availability).collect();
        let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

        for pass in [Availability::Available, Availability::Procurable] {
            for (source, _) in self
                .sources
                .iter()
                .zip(&availability)
                .filter(|(_, av)| **av == pass)
            {
                log::debug!("[Alternatives] Trying {} ({})", source, pass);
                match self.apply(source, &target) {
                    Ok(()) => return Ok(target),
                    Err(e) => {
                        log::debug!("[Alternatives] {} failed: {:#}", source, e);
                        failures.push((source.to_string(), e));
                    }
                }
            }
        }

        if failures.len() == 1 {
            if let Some((_, only)) = failures.pop() {
                return Err(only);
            }
        }

        let attempts = if failures.is_empty() {
            self.sources
                .iter()
                .zip(&availability)
                .map(|(source, av)| format!("{} is {}", source, av))
                .collect()
        } else {
            failures
                .iter()
                .rev()
                .map(|(source, e)| format!("{} failed: {:#}", source, e))
                .collect()
        };
        Err(Error::SourceUnavailable { attempts }.into())
    }

    fn apply(&self, source: &Source, target: &Path) -> Result<()> {
        if target.is_symlink() {
            fs::remove_file(target)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match source {
            Source::Stream(stream) => match stream.verified_file() {
                Some((file, expected)) => {
                    let local = file.path(true)?;
                    if self.ctx.options().verify_local_links {
                        self.verify_local(&local, HashingReader::new(
                            open_file(&local)?,
                            expected.clone(),
                            local.display().to_string(),
                        ))?;
                    } else {
                        log::info!("Skipping hash verification of {}", local.display());
                    }
                    symlink(&relative_target(target, &local)?, target, false)
                }
                None => atomic::write_atomic(target, |out| {
                    let mut input = stream.open()?;
                    io::copy(&mut input, out).map_err(error::from_io)?;
                    Ok(())
                }),
            },
            Source::File(file) => symlink(&std::path::absolute(file.path(true)?)?, target, false),
            Source::Directory(dir) => symlink(&std::path::absolute(dir.path(true)?)?, target, true),
        }
    }

    fn verify_local<R: Read>(&self, local: &Path, mut reader: R) -> Result<()> {
        let size = fs::metadata(local).map(|m| m.len()).ok();
        let pb = ProgressBar::bytes(size, "verifying hash", self.ctx.options().progress);
        let mut buf = vec![0u8; constants::COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(error::from_io)?;
            if n == 0 {
                break;
            }
            pb.inc(n as u64);
        }
        pb.finish();
        Ok(())
    }

    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Alternatives([")?;
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", source)?;
        }
        f.write_str("])")
    }

    fn group_availability(&self) -> Availability {
        let materialized = self
            .target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false);
        if materialized {
            return Availability::Available;
        }
        if self
            .sources
            .iter()
            .any(|s| s.availability() != Availability::Unavailable)
        {
            Availability::Procurable
        } else {
            Availability::Unavailable
        }
    }
}

fn open_file(path: &Path) -> Result<fs::File> {
    fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Path to `target` as seen from the directory that will hold `link`.
fn relative_target(link: &Path, target: &Path) -> Result<PathBuf> {
    let link = std::path::absolute(link)?;
    let target = std::path::absolute(target)?;
    let link_dir: Vec<Component> = link
        .parent()
        .map(|p| p.components().collect())
        .unwrap_or_default();
    let target_parts: Vec<Component> = target.components().collect();

    let common = link_dir
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return Ok(target);
    }

    let mut relative = PathBuf::new();
    for _ in common..link_dir.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    Ok(relative)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path, _is_dir: bool) -> Result<()> {
    std::os::unix::fs::symlink(original, link)
        .with_context(|| format!("Failed to link {} -> {}", link.display(), original.display()))
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path, is_dir: bool) -> Result<()> {
    let result = if is_dir {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    };
    result.with_context(|| format!("Failed to link {} -> {}", link.display(), original.display()))
}

impl fmt::Display for Alternatives<FileGroup> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl fmt::Display for Alternatives<DirectoryGroup> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl Resource for Alternatives<FileGroup> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    fn availability(&self) -> Availability {
        self.group_availability()
    }
}

impl Resource for Alternatives<DirectoryGroup> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Directory
    }

    fn availability(&self) -> Availability {
        self.group_availability()
    }
}

impl PathResolvable for Alternatives<FileGroup> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force {
            self.resolve()
        } else {
            self.target()
        }
    }
}

impl PathResolvable for Alternatives<DirectoryGroup> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force {
            self.resolve()
        } else {
            self.target()
        }
    }
}

impl Streamable for Alternatives<FileGroup> {
    fn open(&self) -> Result<ByteStream> {
        let path = self.resolve()?;
        Ok(Box::new(open_file(&path)?))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        Some(self)
    }
}

impl DirectoryResource for Alternatives<DirectoryGroup> {}
