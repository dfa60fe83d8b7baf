//! Application context created once at startup and shared by handles.

use crate::download::transport::{HttpTransport, Transport};
use crate::options::Options;
use anyhow::{Context as _, Result};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempPath;

/// Owns the configuration and the process-wide state the handles share: the
/// HTTP transport (built on first use), the usage-agreement notices already
/// shown, and the temp files to remove when the context is dropped.
pub struct Context {
    options: Options,
    transport: OnceLock<Arc<dyn Transport>>,
    agreements_shown: Mutex<HashSet<String>>,
    temp_paths: Mutex<Vec<TempPath>>,
}

impl Context {
    pub fn new(options: Options) -> Arc<Self> {
        Arc::new(Self {
            options,
            transport: OnceLock::new(),
            agreements_shown: Mutex::new(HashSet::new()),
            temp_paths: Mutex::new(Vec::new()),
        })
    }

    /// Context configured from `CORPUSIO_*` environment variables.
    pub fn from_env() -> Arc<Self> {
        Self::new(Options::from_env())
    }

    /// Context with a caller-supplied transport instead of the HTTP client.
    pub fn with_transport(options: Options, transport: Arc<dyn Transport>) -> Arc<Self> {
        let ctx = Self::new(options);
        let _ = ctx.transport.set(transport);
        ctx
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Shared transport, created on first call.
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.transport.get() {
            return Ok(Arc::clone(transport));
        }
        let built: Arc<dyn Transport> = Arc::new(HttpTransport::new(&self.options)?);
        Ok(Arc::clone(self.transport.get_or_init(|| built)))
    }

    /// Log a usage-agreement notice the first time `key` is seen.
    ///
    /// Returns true when the notice was shown by this call.
    pub fn show_agreement(&self, key: &str, notice: &str) -> bool {
        let mut shown = self
            .agreements_shown
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !shown.insert(key.to_string()) {
            return false;
        }
        log::info!("{}", notice);
        true
    }

    /// Fresh path under the temp directory that does not exist yet.
    ///
    /// Whatever ends up at this path is deleted when the context is dropped.
    pub fn temp_path(&self) -> Result<PathBuf> {
        let dir = &self.options.tmp_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create temp dir {}", dir.display()))?;
        let temp = tempfile::Builder::new()
            .prefix("corpusio-")
            .tempfile_in(dir)?
            .into_temp_path();
        let path = temp.to_path_buf();
        fs::remove_file(&path)?;
        self.temp_paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(temp);
        Ok(path)
    }
}
