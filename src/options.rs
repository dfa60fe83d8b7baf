use crate::constants;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by every component created from a [`crate::Context`]
#[derive(Debug, Clone)]
pub struct Options {
    /// Root for hash-addressed downloads and dataset files
    pub home: PathBuf,
    /// Directory for process temp files
    pub tmp_dir: PathBuf,
    /// Download attempts allowed without forward progress
    pub download_tries: u32,
    /// Per-read network timeout
    pub download_timeout: Duration,
    /// Delay before the first retry (doubles per consecutive failure)
    pub retry_backoff: Duration,
    /// Accept invalid TLS certificates
    pub skip_tls_verify: bool,
    /// Show progress bars for downloads and builds
    pub progress: bool,
    /// Artefacts below this size never get a local hash-addressed mirror
    pub small_file_size: u64,
    /// Base URL of the public hash-addressed mirror
    pub mirror_url: String,
    /// Hash local files again before linking them into place
    pub verify_local_links: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            home: default_home(),
            tmp_dir: std::env::temp_dir().join(constants::BINARY_NAME),
            download_tries: constants::DEFAULT_DL_TRIES,
            download_timeout: Duration::from_secs(constants::DEFAULT_DL_TIMEOUT_SECS),
            retry_backoff: Duration::from_millis(constants::DEFAULT_RETRY_BACKOFF_MS),
            skip_tls_verify: false,
            progress: true,
            small_file_size: constants::DEFAULT_SMALL_FILE_SIZE,
            mirror_url: constants::DEFAULT_MIRROR_URL.to_string(),
            verify_local_links: true,
        }
    }
}

impl Options {
    /// Defaults overridden by `CORPUSIO_*` environment variables.
    ///
    /// Malformed numeric values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(home) = env_value(constants::ENV_HOME) {
            options.home = PathBuf::from(home);
        }
        if let Some(tmp) = env_value(constants::ENV_TMP) {
            options.tmp_dir = PathBuf::from(tmp);
        }
        if let Some(tries) = env_parsed::<u32>(constants::ENV_DL_TRIES) {
            options.download_tries = tries.max(1);
        }
        if let Some(secs) = env_parsed::<u64>(constants::ENV_DL_TIMEOUT) {
            options.download_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env_parsed::<u64>(constants::ENV_SMALL_FILE_SIZE) {
            options.small_file_size = size;
        }
        if env_flag(constants::ENV_DL_SKIP_SSL) {
            options.skip_tls_verify = true;
        }
        if env_flag(constants::ENV_DL_DISABLE_PBAR) {
            options.progress = false;
        }
        options
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.home.join(constants::DOWNLOADS_DIR)
    }
}

fn default_home() -> PathBuf {
    if let Some(home) = env_value(constants::ENV_HOME) {
        return PathBuf::from(home);
    }
    match env_value("HOME") {
        Some(home) => PathBuf::from(home).join(constants::DEFAULT_HOME_DIR),
        None => PathBuf::from(constants::DEFAULT_HOME_DIR),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_value(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> bool {
    env_value(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Builder for Options
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// Start from the environment instead of plain defaults.
    pub fn from_env() -> Self {
        Self {
            options: Options::from_env(),
        }
    }

    pub fn home<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.home = dir.into();
        self
    }

    pub fn tmp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.tmp_dir = dir.into();
        self
    }

    pub fn download_tries(mut self, tries: u32) -> Self {
        self.options.download_tries = tries.max(1);
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.options.download_timeout = timeout;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.options.retry_backoff = backoff;
        self
    }

    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.options.skip_tls_verify = skip;
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.options.progress = enabled;
        self
    }

    pub fn small_file_size(mut self, size: u64) -> Self {
        self.options.small_file_size = size;
        self
    }

    pub fn mirror_url<S: Into<String>>(mut self, url: S) -> Self {
        self.options.mirror_url = url.into();
        self
    }

    pub fn verify_local_links(mut self, verify: bool) -> Self {
        self.options.verify_local_links = verify;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
