//! Dataset plumbing: lazily resolved resource handles, resumable verified
//! downloads, indexed docstores and checkpointed gzip seeking.
//!
//! ```no_run
//! use corpusio::docstore::{Docstore, JsonLines, Lz4Docstore, Record};
//! use corpusio::download::{Download, HttpDownload, Mirror};
//! use corpusio::fio::{ExpectedHash, StreamExt};
//! use corpusio::Context;
//! use std::sync::Arc;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Doc { id: String, text: String }
//!
//! impl Record for Doc {
//!     fn id(&self) -> &str { &self.id }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let ctx = Context::from_env();
//! let remote = HttpDownload::new(&ctx, "https://example.org/docs.jsonl.gz");
//! let download = Download::new(&ctx, vec![Mirror::remote(remote)])
//!     .expected(Some(ExpectedHash::md5("0123456789abcdef0123456789abcdef")))
//!     .cache_path(Some("/data/docs.jsonl.gz"));
//! let source = JsonLines::<Doc>::new(Arc::new(download.decompress_gzip()));
//! let store = Lz4Docstore::new("/data/docs.store", source);
//! let doc = store.get("doc-17")?;
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod constants;
pub mod context;
pub mod docstore;
pub mod download;
pub mod error;
pub mod fio;
pub mod format;
pub mod gzseek;
pub mod logger;
pub mod options;
pub mod progress;

pub use context::Context;
pub use error::{classify, Error};
pub use options::{Options, OptionsBuilder};
