//! Error kinds surfaced to callers.
//!
//! Fallible operations return `anyhow::Result`; the kinds below travel inside
//! the `anyhow::Error` (or inside an `io::Error` when raised from a `Read`
//! implementation). Use [`classify`] to find the kind anywhere in the chain.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No source in an alternatives group (or mirror list) could be resolved.
    #[error("all sources unavailable or failed{}", render_attempts(.attempts))]
    SourceUnavailable { attempts: Vec<String> },

    /// Computed content hash differs from the expected one.
    #[error("{algorithm} mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Retries exhausted while fetching a remote resource.
    #[error("download of {url} failed after {attempts} attempt(s): {reason}")]
    NetworkFailure {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("{member} not found in archive")]
    ArchiveMemberNotFound { member: String },

    #[error("index {} is corrupt: {reason}", .path.display())]
    IndexCorrupt { path: PathBuf, reason: String },
}

fn render_attempts(attempts: &[String]) -> String {
    if attempts.is_empty() {
        return String::new();
    }
    let mut out = String::from(":");
    for attempt in attempts {
        out.push_str("\n  - ");
        out.push_str(attempt);
    }
    out
}

impl Error {
    /// Wrap this kind in an `io::Error` so it can cross a `Read` boundary.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::IntegrityMismatch { .. } | Error::IndexCorrupt { .. } => {
                io::ErrorKind::InvalidData
            }
            Error::ArchiveMemberNotFound { .. } => io::ErrorKind::NotFound,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

/// Find the error kind anywhere in the cause chain of `err`, looking through
/// `io::Error` wrappers.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| {
        cause.downcast_ref::<Error>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<Error>())
        })
    })
}

/// Convert an `io::Error` into `anyhow::Error`, unwrapping an embedded
/// [`Error`] kind so it can be downcast directly.
pub fn from_io(err: io::Error) -> anyhow::Error {
    let carries_kind = err
        .get_ref()
        .map(|inner| inner.is::<Error>())
        .unwrap_or(false);
    if carries_kind {
        if let Some(inner) = err.into_inner() {
            if let Ok(kind) = inner.downcast::<Error>() {
                return anyhow::Error::new(*kind);
            }
        }
        return anyhow::anyhow!("i/o error carrying an unreadable error kind");
    }
    anyhow::Error::new(err)
}

/// Carry an `anyhow::Error` across a `Read` boundary, keeping its kind.
pub(crate) fn into_io(err: anyhow::Error) -> io::Error {
    let err = match err.downcast::<Error>() {
        Ok(kind) => return kind.into_io(),
        Err(err) => err,
    };
    match err.downcast::<io::Error>() {
        Ok(io) => io,
        Err(err) => io::Error::new(io::ErrorKind::Other, format!("{:#}", err)),
    }
}
