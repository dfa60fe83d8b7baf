//! Resumable HTTP streams.
//!
//! A [`ResumableReader`] hides connection failures from its consumer: after a
//! failure it reissues the request and continues exactly where the consumer
//! left off. Servers that advertise `Accept-Ranges: bytes` are resumed with a
//! `Range` header; other servers are re-read from the start and the already
//! delivered prefix is discarded.

use super::transport::{Credentials, Transport, TransportRequest, TransportResponse};
use crate::context::Context;
use crate::error::Error;
use crate::fio::{Availability, ByteStream, Resource, ResourceKind, Streamable};
use crate::progress::ProgressBar;
use anyhow::Result;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum Auth {
    Basic(Credentials),
    /// Read when the download starts
    File(PathBuf),
}

/// Remote stream handle fetched over HTTP(S).
pub struct HttpDownload {
    ctx: Arc<Context>,
    url: String,
    headers: Vec<(String, String)>,
    size_hint: Option<u64>,
    auth: Option<Auth>,
}

impl HttpDownload {
    pub fn new<S: Into<String>>(ctx: &Arc<Context>, url: S) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            url: url.into(),
            headers: Vec::new(),
            size_hint: None,
            auth: None,
        }
    }

    pub fn basic_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(Auth::Basic(credentials));
        self
    }

    /// Basic-auth credentials kept in a file (see [`Credentials::from_file`]).
    /// A missing file only fails once the download is attempted.
    pub fn auth_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.auth = Some(Auth::File(path.into()));
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Expected size, used for progress until the server reports one.
    pub fn size_hint(mut self, bytes: Option<u64>) -> Self {
        self.size_hint = bytes;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for HttpDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Http({:?})", self.url)
    }
}

impl Resource for HttpDownload {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stream
    }

    fn availability(&self) -> Availability {
        Availability::Procurable
    }
}

impl Streamable for HttpDownload {
    fn open(&self) -> Result<ByteStream> {
        let options = self.ctx.options();
        let credentials = match &self.auth {
            Some(Auth::Basic(credentials)) => Some(credentials.clone()),
            Some(Auth::File(path)) => Some(Credentials::from_file(path)?),
            None => None,
        };
        let progress = ProgressBar::bytes(self.size_hint, "download", options.progress);
        log::info!("[Download] {}", self.url);
        let reader = ResumableReader::new(
            self.ctx.transport()?,
            self.url.clone(),
            self.headers.clone(),
            options.download_tries,
            options.retry_backoff,
            progress,
        )
        .credentials(credentials);
        Ok(Box::new(reader))
    }
}

/// Byte-accurate stream over a flaky connection.
pub struct ResumableReader {
    transport: Arc<dyn Transport>,
    url: String,
    headers: Vec<(String, String)>,
    credentials: Option<Credentials>,
    body: Option<Box<dyn Read + Send>>,
    /// Last response advertised byte-range support
    ranged: bool,
    range_start: Option<u64>,
    /// Bytes still to discard from the current body
    skip: u64,
    /// Bytes handed to the consumer so far
    received: u64,
    body_expected: Option<u64>,
    body_read: u64,
    max_tries: u32,
    tries_left: u32,
    requests: u32,
    consecutive_failures: u32,
    backoff: Duration,
    progress: ProgressBar,
    done: bool,
}

impl ResumableReader {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: String,
        headers: Vec<(String, String)>,
        tries: u32,
        backoff: Duration,
        progress: ProgressBar,
    ) -> Self {
        let tries = tries.max(1);
        Self {
            transport,
            url,
            headers,
            credentials: None,
            body: None,
            ranged: false,
            range_start: None,
            skip: 0,
            received: 0,
            body_expected: None,
            body_read: 0,
            max_tries: tries,
            tries_left: tries,
            requests: 0,
            consecutive_failures: 0,
            backoff,
            progress,
            done: false,
        }
    }

    /// Sent with every request, including retries.
    pub fn credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Bytes delivered to the consumer so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Requests issued so far, including the first one.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    fn request(&mut self) -> Result<()> {
        self.requests += 1;
        let request = TransportRequest {
            url: &self.url,
            range_start: self.range_start,
            headers: &self.headers,
            credentials: self.credentials.as_ref(),
        };
        let response = self.transport.get(&request)?;
        if !response.is_success() {
            anyhow::bail!("HTTP status {}", response.status);
        }
        self.start_body(response);
        Ok(())
    }

    fn start_body(&mut self, response: TransportResponse) {
        if let Some(start) = self.range_start {
            if !response.is_partial() {
                log::debug!(
                    "[Download] {} ignored Range from byte {}; discarding the prefix",
                    self.url,
                    start
                );
                self.skip = start;
            }
        }
        if self.requests == 1 {
            if let Some(len) = response.content_length {
                self.progress.set_length(len);
            }
        }
        self.ranged = response.accept_ranges;
        self.body_expected = response.content_length;
        self.body_read = 0;
        self.body = Some(response.body);
    }

    /// Record a failed attempt and prepare the next request.
    fn fail(&mut self, reason: String) -> io::Result<()> {
        self.body = None;
        self.tries_left = self.tries_left.saturating_sub(1);
        if self.tries_left == 0 {
            self.progress.finish();
            return Err(Error::NetworkFailure {
                url: self.url.clone(),
                attempts: self.requests,
                reason,
            }
            .into_io());
        }

        if self.ranged && self.received > 0 {
            self.range_start = Some(self.received);
            self.skip = 0;
        } else if self.received > 0 {
            self.range_start = None;
            self.skip = self.received;
        } else {
            self.range_start = None;
            self.skip = 0;
        }
        log::warn!(
            "[Download] {} interrupted after {} bytes ({}); retrying with {} ({} tries left)",
            self.url,
            self.received,
            reason,
            match self.range_start {
                Some(start) => format!("Range: bytes={}-", start),
                None => "a full request".to_string(),
            },
            self.tries_left
        );

        self.consecutive_failures += 1;
        if !self.backoff.is_zero() {
            let factor = 1u32 << (self.consecutive_failures - 1).min(10);
            std::thread::sleep(self.backoff.saturating_mul(factor).min(MAX_BACKOFF));
        }
        Ok(())
    }

    fn record_progress(&mut self, n: usize) {
        self.received += n as u64;
        self.progress.inc(n as u64);
        self.consecutive_failures = 0;
        if self.ranged {
            self.tries_left = self.max_tries;
        }
    }
}

impl Read for ResumableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.body.is_none() {
                if let Err(e) = self.request() {
                    self.fail(format!("{:#}", e))?;
                    continue;
                }
            }
            let Some(body) = self.body.as_mut() else {
                continue;
            };

            match body.read(buf) {
                Ok(0) => {
                    if let Some(expected) = self.body_expected {
                        if self.body_read < expected {
                            let reason = format!(
                                "connection closed after {} of {} bytes",
                                self.body_read, expected
                            );
                            self.fail(reason)?;
                            continue;
                        }
                    }
                    self.body = None;
                    self.done = true;
                    self.progress.finish();
                    log::debug!("[Download] {} complete ({} bytes)", self.url, self.received);
                    return Ok(0);
                }
                Ok(mut n) => {
                    self.body_read += n as u64;
                    if self.skip > 0 {
                        let dropped = self.skip.min(n as u64) as usize;
                        self.skip -= dropped as u64;
                        if dropped == n {
                            continue;
                        }
                        buf.copy_within(dropped..n, 0);
                        n -= dropped;
                    }
                    self.record_progress(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(e.to_string())?;
                    continue;
                }
            }
        }
    }
}
