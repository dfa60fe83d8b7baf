//! HTTP GET abstraction used by resumable downloads.

use crate::constants;
use crate::options::Options;
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT_RANGES, RANGE};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// HTTP basic-auth username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reads a credentials file: the username on the first line and the
    /// password on the second.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Missing credentials file {}; write the username on the first line and the password on the second",
                path.display()
            )
        })?;
        let mut lines = contents.lines();
        match (lines.next(), lines.next()) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Ok(Self::new(username, password))
            }
            _ => anyhow::bail!(
                "Malformed credentials file {}; expected the username on the first line and the password on the second",
                path.display()
            ),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One GET request, optionally starting at a byte offset.
#[derive(Debug, Clone)]
pub struct TransportRequest<'a> {
    pub url: &'a str,
    pub range_start: Option<u64>,
    pub headers: &'a [(String, String)],
    pub credentials: Option<&'a Credentials>,
}

/// Response head plus a streaming body.
pub struct TransportResponse {
    pub status: u16,
    /// `Accept-Ranges: bytes` was present
    pub accept_ranges: bool,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A range request was answered with the range (206), not the full body.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, request: &TransportRequest<'_>) -> Result<TransportResponse>;
}

/// Blocking reqwest client. Bodies are passed through without content
/// decoding, so a gzip file served with `Content-Encoding: gzip` arrives
/// exactly as stored.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(options: &Options) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(constants::user_agent())
            .timeout(options.download_timeout)
            .danger_accept_invalid_certs(options.skip_tls_verify)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn prepare(&self, request: &TransportRequest<'_>) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.get(request.url);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if let Some(start) = request.range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn get(&self, request: &TransportRequest<'_>) -> Result<TransportResponse> {
        let response = self
            .prepare(request)
            .send()
            .with_context(|| format!("GET {} failed", request.url))?;
        let accept_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(TransportResponse {
            status: response.status().as_u16(),
            accept_ranges,
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}
