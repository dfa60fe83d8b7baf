//! Archive member extraction (tar and zip).

use super::{
    materialized_or, Availability, ByteStream, DirectoryResource, PathResolvable, Resource,
    ResourceKind, Streamable,
};
use crate::atomic;
use crate::error::{self, Error};
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

const BLOCK: u64 = 512;

/// One member of a tar stream, found in a single forward pass.
pub struct TarMember<S> {
    input: S,
    member: String,
}

impl<S: Streamable> TarMember<S> {
    pub fn new<M: Into<String>>(input: S, member: M) -> Self {
        Self {
            input,
            member: member.into(),
        }
    }
}

impl<S: Streamable> fmt::Display for TarMember<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.extract_from_tar({:?})", self.input, self.member)
    }
}

impl<S: Streamable> Resource for TarMember<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        self.input.availability().chained()
    }
}

impl<S: Streamable> Streamable for TarMember<S> {
    fn open(&self) -> Result<ByteStream> {
        let stream = self.input.open()?;
        seek_tar_member(stream, &self.member).with_context(|| format!("{} failed", self))
    }
}

/// Advance `stream` to the data of `member` and return a reader bounded to it.
fn seek_tar_member(mut stream: ByteStream, member: &str) -> Result<ByteStream> {
    let wanted = normalize_member(member);
    let mut header = [0u8; BLOCK as usize];
    let mut long_name: Option<String> = None;

    while read_block(&mut stream, &mut header)? {
        if header.iter().all(|&b| b == 0) {
            break;
        }
        let parsed = tar::Header::from_byte_slice(&header);
        let size = parsed.entry_size()?;
        let padding = size.div_ceil(BLOCK) * BLOCK - size;
        let entry_type = parsed.entry_type();

        if entry_type.is_gnu_longname() || entry_type.is_pax_local_extensions() {
            let mut data = Vec::new();
            (&mut stream).take(size).read_to_end(&mut data)?;
            if data.len() as u64 != size {
                anyhow::bail!("truncated tar extension header");
            }
            skip(&mut stream, padding)?;
            long_name = if entry_type.is_gnu_longname() {
                Some(String::from_utf8_lossy(trim_nul(&data)).into_owned())
            } else {
                pax_path(&data).or(long_name)
            };
            continue;
        }
        if entry_type.is_gnu_longlink() || entry_type.is_pax_global_extensions() {
            skip(&mut stream, size + padding)?;
            continue;
        }

        let name = long_name
            .take()
            .unwrap_or_else(|| String::from_utf8_lossy(&parsed.path_bytes()).into_owned());
        if entry_type.is_file() && normalize_member(&name) == wanted {
            log::debug!("[Tar] Found {} ({} bytes)", member, size);
            return Ok(Box::new(MemberReader::new(stream, size)));
        }
        skip(&mut stream, size + padding)?;
    }

    Err(Error::ArchiveMemberNotFound {
        member: member.to_string(),
    }
    .into())
}

/// Member data; the archive ending before `remaining` bytes is an error.
struct MemberReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> MemberReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for MemberReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("tar member truncated with {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Fill one header block; false on a clean end of stream.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => anyhow::bail!("truncated tar header"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(error::from_io(e)),
        }
    }
    Ok(true)
}

fn skip<R: Read>(reader: &mut R, bytes: u64) -> Result<()> {
    let skipped = io::copy(&mut reader.take(bytes), &mut io::sink()).map_err(error::from_io)?;
    if skipped != bytes {
        anyhow::bail!("truncated tar entry");
    }
    Ok(())
}

fn trim_nul(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..end]
}

/// `path` value of a PAX extended header (`"<len> path=<value>\n"` records).
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            return None;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }
    None
}

fn normalize_member(name: &str) -> &str {
    name.trim_start_matches("./").trim_end_matches('/')
}

/// Whole tar stream unpacked into a directory, optionally filtered by globs.
///
/// Unpacking happens in a `.tmpN` sibling that is renamed into place; on
/// failure the partial tree is removed.
pub struct TarExtractAll<S> {
    input: S,
    dir: PathBuf,
    globs: Option<Vec<String>>,
}

impl<S: Streamable> TarExtractAll<S> {
    pub fn new<P: Into<PathBuf>>(input: S, dir: P, globs: Option<Vec<String>>) -> Self {
        Self {
            input,
            dir: dir.into(),
            globs,
        }
    }

    fn unpack_into(&self, staging: &Path) -> Result<usize> {
        let patterns = match &self.globs {
            Some(globs) => Some(compile_globs(globs)?),
            None => None,
        };

        let mut archive = tar::Archive::new(self.input.open()?);
        let mut unpacked = 0;
        for entry in archive.entries().map_err(error::from_io)? {
            let mut entry = entry.map_err(error::from_io)?;
            let name = entry.path().map_err(error::from_io)?.to_string_lossy().into_owned();
            let wanted = match &patterns {
                Some(patterns) => patterns.iter().any(|p| p.matches(normalize_member(&name))),
                None => true,
            };
            if wanted {
                entry.unpack_in(staging).map_err(error::from_io)?;
                unpacked += 1;
            }
        }
        Ok(unpacked)
    }
}

impl<S: Streamable> fmt::Display for TarExtractAll<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.globs {
            Some(globs) => write!(f, "{}.extract_all_tar({:?}, {:?})", self.input, self.dir, globs),
            None => write!(f, "{}.extract_all_tar({:?})", self.input, self.dir),
        }
    }
}

impl<S: Streamable> Resource for TarExtractAll<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Directory
    }

    fn availability(&self) -> Availability {
        materialized_or(&self.dir, self.input.availability())
    }
}

impl<S: Streamable> PathResolvable for TarExtractAll<S> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.dir.exists() {
            let start = Instant::now();
            let unpacked = extract_atomically(&self.dir, |staging| self.unpack_into(staging))
                .with_context(|| format!("{} failed", self))?;
            log::info!(
                "[Tar] Extracted {} entries into {} in {}",
                unpacked,
                self.dir.display(),
                crate::format::format_duration(start.elapsed())
            );
        }
        Ok(self.dir.clone())
    }
}

impl<S: Streamable> DirectoryResource for TarExtractAll<S> {}

fn compile_globs(globs: &[String]) -> Result<Vec<glob::Pattern>> {
    globs
        .iter()
        .map(|g| glob::Pattern::new(g).with_context(|| format!("Invalid glob {:?}", g)))
        .collect()
}

/// A new tar file holding only the members of the input that match `globs`.
///
/// The input is read as a stream; the output is gzip-compressed unless
/// `gzip(false)` is set and appears at its path only once complete.
pub struct FilterTar<S> {
    input: S,
    output: PathBuf,
    globs: Vec<String>,
    gzip: bool,
}

impl<S: Streamable> FilterTar<S> {
    pub fn new<P: Into<PathBuf>>(input: S, output: P, globs: Vec<String>) -> Self {
        Self {
            input,
            output: output.into(),
            globs,
            gzip: true,
        }
    }

    pub fn gzip(mut self, enabled: bool) -> Self {
        self.gzip = enabled;
        self
    }

    fn filter_into<W: Write>(&self, out: W, patterns: &[glob::Pattern]) -> Result<(usize, W)> {
        let mut builder = tar::Builder::new(out);
        let mut archive = tar::Archive::new(self.input.open()?);
        let mut kept = 0;
        for entry in archive.entries().map_err(error::from_io)? {
            let mut entry = entry.map_err(error::from_io)?;
            let name = entry.path().map_err(error::from_io)?.to_string_lossy().into_owned();
            if !patterns.iter().any(|p| p.matches(normalize_member(&name))) {
                continue;
            }
            let mut header = entry.header().clone();
            let link = entry
                .link_name()
                .map_err(error::from_io)?
                .map(|target| target.into_owned());
            let appended = match link {
                Some(target) => builder.append_link(&mut header, &name, target),
                None => builder.append_data(&mut header, &name, &mut entry),
            };
            appended.map_err(error::from_io)?;
            log::debug!("[Tar] Kept {}", name);
            kept += 1;
        }
        let out = builder.into_inner().map_err(error::from_io)?;
        Ok((kept, out))
    }

    fn materialize(&self) -> Result<()> {
        let start = Instant::now();
        let patterns = compile_globs(&self.globs)?;
        let mut kept = 0;
        atomic::write_atomic(&self.output, |file| {
            if self.gzip {
                let encoder = GzEncoder::new(file, Compression::default());
                let (count, encoder) = self.filter_into(encoder, &patterns)?;
                encoder.finish()?;
                kept = count;
            } else {
                kept = self.filter_into(file, &patterns)?.0;
            }
            Ok(())
        })?;
        log::info!(
            "[Tar] Filtered {} entries into {} in {}",
            kept,
            self.output.display(),
            crate::format::format_duration(start.elapsed())
        );
        Ok(())
    }
}

impl<S: Streamable> fmt::Display for FilterTar<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.filter_tar({:?}, {:?})", self.input, self.output, self.globs)
    }
}

impl<S: Streamable> Resource for FilterTar<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegularFile
    }

    fn availability(&self) -> Availability {
        materialized_or(&self.output, self.input.availability())
    }
}

impl<S: Streamable> PathResolvable for FilterTar<S> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.output.exists() {
            self.materialize().with_context(|| format!("{} failed", self))?;
        }
        Ok(self.output.clone())
    }
}

impl<S: Streamable> Streamable for FilterTar<S> {
    fn open(&self) -> Result<ByteStream> {
        let path = self.path(true)?;
        let file = fs::File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn as_file(&self) -> Option<&dyn PathResolvable> {
        Some(self)
    }
}

/// Run `extract` against a fresh staging directory, then rename it to `dir`.
fn extract_atomically<F>(dir: &Path, extract: F) -> Result<usize>
where
    F: FnOnce(&Path) -> Result<usize>,
{
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = atomic::create_exclusive_dir(dir)?;
    let outcome = extract(&staging).and_then(|count| {
        fs::rename(&staging, dir)
            .with_context(|| format!("Failed to move extraction into {}", dir.display()))?;
        Ok(count)
    });
    if outcome.is_err() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            log::warn!("Failed to remove partial extraction {}: {}", staging.display(), e);
        }
    }
    outcome
}

/// Open the zip container: files directly, other streams spooled to disk first.
fn open_zip_container<S: Streamable>(input: &S) -> Result<zip::ZipArchive<fs::File>> {
    let file = match input.as_file() {
        Some(file) => {
            let path = file.path(true)?;
            fs::File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?
        }
        None => {
            let mut spool = tempfile::tempfile()?;
            io::copy(&mut input.open()?, &mut spool).map_err(error::from_io)?;
            spool.seek(SeekFrom::Start(0))?;
            spool
        }
    };
    Ok(zip::ZipArchive::new(file)?)
}

/// One member of a zip archive.
pub struct ZipMember<S> {
    input: S,
    member: String,
}

impl<S: Streamable> ZipMember<S> {
    pub fn new<M: Into<String>>(input: S, member: M) -> Self {
        Self {
            input,
            member: member.into(),
        }
    }
}

impl<S: Streamable> fmt::Display for ZipMember<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.extract_from_zip({:?})", self.input, self.member)
    }
}

impl<S: Streamable> Resource for ZipMember<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        self.input.availability().chained()
    }
}

impl<S: Streamable> Streamable for ZipMember<S> {
    fn open(&self) -> Result<ByteStream> {
        let mut archive = open_zip_container(&self.input)?;
        let mut entry = match archive.by_name(&self.member) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(Error::ArchiveMemberNotFound {
                    member: self.member.clone(),
                }
                .into())
            }
            Err(e) => return Err(e).with_context(|| format!("{} failed", self)),
        };
        // Members borrow the archive, so decode into an anonymous temp file.
        let mut out = tempfile::tempfile()?;
        io::copy(&mut entry, &mut out).map_err(error::from_io)?;
        drop(entry);
        out.seek(SeekFrom::Start(0))?;
        Ok(Box::new(out))
    }
}

/// Whole zip archive unpacked into a directory.
pub struct ZipExtractAll<S> {
    input: S,
    dir: PathBuf,
}

impl<S: Streamable> ZipExtractAll<S> {
    pub fn new<P: Into<PathBuf>>(input: S, dir: P) -> Self {
        Self {
            input,
            dir: dir.into(),
        }
    }
}

impl<S: Streamable> fmt::Display for ZipExtractAll<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.extract_all_zip({:?})", self.input, self.dir)
    }
}

impl<S: Streamable> Resource for ZipExtractAll<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Directory
    }

    fn availability(&self) -> Availability {
        materialized_or(&self.dir, self.input.availability())
    }
}

impl<S: Streamable> PathResolvable for ZipExtractAll<S> {
    fn path(&self, force: bool) -> Result<PathBuf> {
        if force && !self.dir.exists() {
            extract_atomically(&self.dir, |staging| {
                let mut archive = open_zip_container(&self.input)?;
                let count = archive.len();
                archive.extract(staging)?;
                Ok(count)
            })
            .with_context(|| format!("{} failed", self))?;
        }
        Ok(self.dir.clone())
    }
}

impl<S: Streamable> DirectoryResource for ZipExtractAll<S> {}
