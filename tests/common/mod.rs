#![allow(dead_code)]

use anyhow::Result;
use corpusio::download::{Transport, TransportRequest, TransportResponse};
use corpusio::{Context, OptionsBuilder};
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn setup_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(anyhow::Error::from)
}

fn options(dir: &Path) -> corpusio::Options {
    OptionsBuilder::new()
        .home(dir.join("home"))
        .tmp_dir(dir.join("tmp"))
        .progress(false)
        .retry_backoff(Duration::ZERO)
        .download_tries(3)
        .build()
}

/// Context rooted in `dir` with progress bars off and no retry delay.
pub fn test_context(dir: &Path) -> Arc<Context> {
    Context::new(options(dir))
}

/// `test_context` whose HTTP requests go to `transport`.
pub fn http_context(dir: &Path, transport: Arc<dyn Transport>) -> Arc<Context> {
    Context::with_transport(options(dir), transport)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Uncompressed tar holding `members` in order.
pub fn tar(members: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data)?;
    }
    Ok(builder.into_inner()?)
}

/// Deterministic payload that does not compress to nothing.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % 251) as u8
        })
        .collect()
}

/// Body that fails with a connection reset after `cut` bytes.
struct FlakyBody {
    data: Cursor<Vec<u8>>,
    cut: Option<usize>,
    served: usize,
}

impl Read for FlakyBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let allowed = match self.cut {
            Some(cut) if self.served >= cut => {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
            }
            Some(cut) => buf.len().min(cut - self.served),
            None => buf.len(),
        };
        let n = self.data.read(&mut buf[..allowed])?;
        self.served += n;
        Ok(n)
    }
}

/// In-memory HTTP server with scripted connection drops.
///
/// The n-th response body breaks after `cuts[n]` bytes; responses beyond
/// the script run to completion. With `accept_ranges` the server honours
/// `Range` requests with a 206, otherwise it always sends the full body.
pub struct ScriptedTransport {
    data: Vec<u8>,
    accept_ranges: bool,
    status: u16,
    cuts: Mutex<VecDeque<usize>>,
    ranges: Mutex<Vec<Option<u64>>>,
    usernames: Mutex<Vec<Option<String>>>,
}

impl ScriptedTransport {
    pub fn new(data: Vec<u8>, accept_ranges: bool, cuts: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            data,
            accept_ranges,
            status: 200,
            cuts: Mutex::new(cuts.iter().copied().collect()),
            ranges: Mutex::new(Vec::new()),
            usernames: Mutex::new(Vec::new()),
        })
    }

    /// Server answering every request with `status` and an empty body.
    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            data: Vec::new(),
            accept_ranges: false,
            status,
            cuts: Mutex::new(VecDeque::new()),
            ranges: Mutex::new(Vec::new()),
            usernames: Mutex::new(Vec::new()),
        })
    }

    /// `Range` start of every request received, in order.
    pub fn ranges(&self) -> Vec<Option<u64>> {
        self.ranges.lock().unwrap().clone()
    }

    /// Basic-auth username of every request received, in order.
    pub fn usernames(&self) -> Vec<Option<String>> {
        self.usernames.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, request: &TransportRequest<'_>) -> Result<TransportResponse> {
        self.ranges.lock().unwrap().push(request.range_start);
        self.usernames
            .lock()
            .unwrap()
            .push(request.credentials.map(|c| c.username.clone()));
        if self.status != 200 {
            return Ok(TransportResponse {
                status: self.status,
                accept_ranges: false,
                content_length: Some(0),
                body: Box::new(io::empty()),
            });
        }

        let (status, start) = match request.range_start {
            Some(start) if self.accept_ranges => (206, start as usize),
            _ => (200, 0),
        };
        let body = self.data[start.min(self.data.len())..].to_vec();
        let cut = self.cuts.lock().unwrap().pop_front();
        Ok(TransportResponse {
            status,
            accept_ranges: self.accept_ranges,
            content_length: Some(body.len() as u64),
            body: Box::new(FlakyBody {
                data: Cursor::new(body),
                cut,
                served: 0,
            }),
        })
    }
}
