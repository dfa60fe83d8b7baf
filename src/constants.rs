//! Global constants: identification, file names, download defaults, docstore
//! and checkpoint tuning, and on-disk magic numbers
use std::path::{Path, PathBuf};

/// Crate name used in user agents and metadata
pub const BINARY_NAME: &str = "corpusio";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the user agent string for HTTP requests
pub fn user_agent() -> String {
    format!("{}/{}", BINARY_NAME, VERSION)
}

/// Returns the created_by string for on-disk metadata
pub fn created_by() -> String {
    format!("{}/{}", BINARY_NAME, VERSION)
}

/// Hash-addressed location of a downloaded artefact under the home directory
pub fn download_path(home: impl AsRef<Path>, hash: &str) -> PathBuf {
    home.as_ref().join(DOWNLOADS_DIR).join(hash)
}

/// Basic-auth credentials file for a named service under the home directory
pub fn auth_path(home: impl AsRef<Path>, name: &str) -> PathBuf {
    home.as_ref().join(AUTH_DIR).join(name)
}

/// Checkpoint file that sits next to a compressed bundle
pub fn checkpoint_path(bundle: impl AsRef<Path>) -> PathBuf {
    let mut name = bundle.as_ref().as_os_str().to_owned();
    name.push(CHECKPOINT_SUFFIX);
    PathBuf::from(name)
}

// ============================================================================
// Environment
// ============================================================================

pub const ENV_HOME: &str = "CORPUSIO_HOME";
pub const ENV_TMP: &str = "CORPUSIO_TMP";
pub const ENV_DL_TRIES: &str = "CORPUSIO_DL_TRIES";
pub const ENV_DL_TIMEOUT: &str = "CORPUSIO_DL_TIMEOUT";
pub const ENV_DL_SKIP_SSL: &str = "CORPUSIO_DL_SKIP_SSL";
pub const ENV_DL_DISABLE_PBAR: &str = "CORPUSIO_DL_DISABLE_PBAR";
pub const ENV_SMALL_FILE_SIZE: &str = "CORPUSIO_SMALL_FILE_SIZE";

/// Home directory name used when `CORPUSIO_HOME` is unset
pub const DEFAULT_HOME_DIR: &str = ".corpusio";

// ============================================================================
// Download Constants
// ============================================================================

/// Attempts without forward progress before a download fails
pub const DEFAULT_DL_TRIES: u32 = 3;

/// Per-read HTTP timeout
pub const DEFAULT_DL_TIMEOUT_SECS: u64 = 15;

/// Delay before the first retry; doubles on each consecutive failure
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Files smaller than this never get a hash-addressed local mirror
pub const DEFAULT_SMALL_FILE_SIZE: u64 = 5_000_000;

/// Public mirror serving artefacts by their md5
pub const DEFAULT_MIRROR_URL: &str = "https://mirror.ir-datasets.com";

/// Subdirectory of the home directory holding hash-addressed downloads
pub const DOWNLOADS_DIR: &str = "downloads";

/// Subdirectory of the home directory holding credentials files
pub const AUTH_DIR: &str = "auth";

/// Read buffer used when copying and hashing streams
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Temp File Constants
// ============================================================================

/// Number of `.tmpN` suffixes tried before giving up on an exclusive create
pub const MAX_TMP_ATTEMPTS: u32 = 100;

// ============================================================================
// Docstore Constants
// ============================================================================

pub const RECORDS_FILE: &str = "records.bin";
pub const POSITIONS_FILE: &str = "records.pos";
pub const INDEX_FILE: &str = "records.idx";
pub const BUILT_MARKER: &str = "BUILT";

/// Format tag written into docstore completion markers
pub const DOCSTORE_FORMAT: &str = "corpusio-docstore-v1";

/// Format tag written into zstd bundle metadata
pub const BUNDLE_FORMAT: &str = "corpusio-bundle-v1";

/// Records per zstd frame in frame bundles
pub const FRAME_SIZE: usize = 100;

/// Zstd compression level (1 = fast, 3 = balanced, 19 = maximum)
pub const ZSTD_COMPRESSION_LEVEL: i32 = 3;

// ============================================================================
// Checkpoint Constants
// ============================================================================

/// Records between two checkpoints of a gzip bundle
pub const DEFAULT_CHECKPOINT_FREQ: u64 = 1500;

/// Forward seeks up to this many records read ahead without consulting checkpoints
pub const SMALL_SEEK_RECORDS: u64 = 100;

pub const CHECKPOINT_SUFFIX: &str = ".chk";
