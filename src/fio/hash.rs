//! Streaming content hashing and hash verification.

use super::{Availability, ByteStream, PathResolvable, Resource, ResourceKind, Streamable};
use crate::error::Error;
use anyhow::Result;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher over one of the supported algorithms.
#[derive(Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Algorithm-tagged expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ExpectedHash {
    pub fn md5<S: Into<String>>(hex: S) -> Self {
        Self {
            algorithm: HashAlgorithm::Md5,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    pub fn sha256<S: Into<String>>(hex: S) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Compare a computed digest, producing the mismatch error kind.
    pub fn check(&self, actual: &str) -> std::result::Result<(), Error> {
        if actual.eq_ignore_ascii_case(&self.hex) {
            Ok(())
        } else {
            Err(Error::IntegrityMismatch {
                algorithm: self.algorithm.name().to_string(),
                expected: self.hex.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for ExpectedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Hashes everything read through it and checks the digest at end of stream.
///
/// A mismatch surfaces as an `io::Error` carrying [`Error::IntegrityMismatch`]
/// from the read that hits EOF, so nothing downstream can mistake the stream
/// for complete. Without an expected digest the computed one is only logged.
pub struct HashingReader<R> {
    inner: R,
    hasher: Option<Hasher>,
    algorithm: HashAlgorithm,
    expected: Option<ExpectedHash>,
    label: String,
    digest: Option<String>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, expected: ExpectedHash, label: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Some(expected.algorithm.hasher()),
            algorithm: expected.algorithm,
            expected: Some(expected),
            label: label.into(),
            digest: None,
        }
    }

    /// Hash without verifying; the digest is logged as a suggestion.
    pub fn unverified(inner: R, algorithm: HashAlgorithm, label: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Some(algorithm.hasher()),
            algorithm,
            expected: None,
            label: label.into(),
            digest: None,
        }
    }

    /// Digest of the full stream, once EOF has been reached.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(hasher) = self.hasher.take() else {
            return Ok(());
        };
        let actual = hasher.finalize_hex();
        let outcome = match &self.expected {
            Some(expected) => expected.check(&actual),
            None => {
                log::warn!(
                    "No expected {} for {}; computed {} (consider adding it)",
                    self.algorithm,
                    self.label,
                    actual
                );
                Ok(())
            }
        };
        self.digest = Some(actual);
        outcome.map_err(Error::into_io)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        } else if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

/// Stream handle whose content must match an expected digest.
pub struct VerifyHash<S> {
    input: S,
    expected: ExpectedHash,
}

impl<S: Streamable> VerifyHash<S> {
    pub fn new(input: S, expected: ExpectedHash) -> Self {
        Self { input, expected }
    }

    pub fn expected(&self) -> &ExpectedHash {
        &self.expected
    }
}

impl<S: Streamable> fmt::Display for VerifyHash<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.verify_hash({})", self.input, self.expected)
    }
}

impl<S: Streamable> Resource for VerifyHash<S> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        self.input.availability().chained()
    }
}

impl<S: Streamable> Streamable for VerifyHash<S> {
    fn open(&self) -> Result<ByteStream> {
        let stream = self.input.open()?;
        Ok(Box::new(HashingReader::new(
            stream,
            self.expected.clone(),
            self.input.to_string(),
        )))
    }

    fn verified_file(&self) -> Option<(&dyn PathResolvable, &ExpectedHash)> {
        self.input.as_file().map(|file| (file, &self.expected))
    }
}
