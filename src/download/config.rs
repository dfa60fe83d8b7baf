//! JSON catalog of downloadable artefacts.
//!
//! Each entry names where a file comes from and how to check it:
//!
//! ```json
//! {
//!   "collection": {
//!     "url": "https://example.org/collection.tar.gz",
//!     "expected_md5": "5d41402abc4b2a76b9719d911017c592",
//!     "cache_path": "collection.tar.gz",
//!     "irds_mirror": true,
//!     "size_hint": 1073741824
//!   },
//!   "restricted": {
//!     "url": "https://example.org/restricted.jsonl",
//!     "auth": "example-org"
//!   },
//!   "topics": {
//!     "instructions": "Request access, then place the file at {path}",
//!     "cache_path": "topics.xml"
//!   }
//! }
//! ```

use super::{Download, HttpDownload, Mirror};
use crate::constants;
use crate::context::Context;
use crate::fio::ExpectedHash;
use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One catalog entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DownloadEntry {
    pub url: Option<String>,
    pub expected_md5: Option<String>,
    pub expected_sha256: Option<String>,
    /// Relative to the configuration's base path
    pub cache_path: Option<PathBuf>,
    /// The public hash-addressed mirror carries this file
    pub irds_mirror: bool,
    /// Shown when the file must be obtained by hand; `{path}` is replaced
    /// with the expected location
    pub instructions: Option<String>,
    pub skip_local: bool,
    pub size_hint: Option<u64>,
    pub stream: bool,
    pub headers: BTreeMap<String, String>,
    /// Name of a credentials file under `<home>/auth` used for HTTP basic auth
    /// on the entry's URL
    pub auth: Option<String>,
}

impl DownloadEntry {
    fn expected_hash(&self) -> Option<ExpectedHash> {
        if let Some(sha256) = &self.expected_sha256 {
            return Some(ExpectedHash::sha256(sha256.as_str()));
        }
        self.expected_md5.as_deref().map(ExpectedHash::md5)
    }
}

/// Catalog scoped to one dataset: entries, base path and usage agreement.
pub struct DownloadConfig {
    ctx: Arc<Context>,
    contents: serde_json::Value,
    base_path: Option<PathBuf>,
    agreement: Option<String>,
}

impl DownloadConfig {
    pub fn from_value(ctx: &Arc<Context>, contents: serde_json::Value) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            contents,
            base_path: None,
            agreement: None,
        }
    }

    pub fn from_json_str(ctx: &Arc<Context>, json: &str) -> Result<Self> {
        let contents =
            serde_json::from_str(json).context("Failed to parse download configuration")?;
        Ok(Self::from_value(ctx, contents))
    }

    pub fn from_file(ctx: &Arc<Context>, path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(ctx, &json)
            .with_context(|| format!("Invalid download configuration {}", path.display()))
    }

    pub fn base_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn agreement<S: Into<String>>(mut self, notice: S) -> Self {
        self.agreement = Some(notice.into());
        self
    }

    /// Sub-catalog under `key`, inheriting anything not overridden.
    pub fn context(
        &self,
        key: &str,
        base_path: Option<PathBuf>,
        agreement: Option<String>,
    ) -> Result<Self> {
        let contents = self
            .contents
            .get(key)
            .cloned()
            .with_context(|| format!("No download configuration for {:?}", key))?;
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            contents,
            base_path: base_path.or_else(|| self.base_path.clone()),
            agreement: agreement.or_else(|| self.agreement.clone()),
        })
    }

    pub fn keys(&self) -> Vec<String> {
        self.contents
            .as_object()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, key: &str) -> Result<DownloadEntry> {
        let raw = self
            .contents
            .get(key)
            .with_context(|| format!("No download entry {:?}", key))?;
        serde_json::from_value(raw.clone())
            .with_context(|| format!("Malformed download entry {:?}", key))
    }

    /// Download descriptor for `key`.
    ///
    /// With a URL the mirrors are, in order: the hash-addressed local copy
    /// under `<home>/downloads` (unless skipped or known to be small), the
    /// URL itself, then the public mirror when the entry is flagged for it.
    /// Without a URL the entry must carry instructions and becomes a single
    /// local mirror.
    pub fn get(&self, key: &str) -> Result<Download> {
        let entry = self.entry(key)?;
        let options = self.ctx.options();
        let cache_path = entry.cache_path.as_ref().map(|p| match &self.base_path {
            Some(base) => base.join(p),
            None => p.clone(),
        });

        let mut mirrors = Vec::new();
        if let Some(url) = &entry.url {
            let small = entry.size_hint.unwrap_or(options.small_file_size) < options.small_file_size;
            if let Some(md5) = entry.expected_md5.as_deref() {
                if !entry.skip_local && !small {
                    let local = constants::download_path(&options.home, md5);
                    let message = format!(
                        "If you have a local copy of {}, you can symlink it here to avoid downloading it again: {}",
                        url,
                        local.display()
                    );
                    mirrors.push(Mirror::local(local, Some(message)));
                }
            }

            let mut remote = HttpDownload::new(&self.ctx, url.as_str()).size_hint(entry.size_hint);
            for (name, value) in &entry.headers {
                remote = remote.header(name.as_str(), value.as_str());
            }
            if let Some(name) = &entry.auth {
                remote = remote.auth_file(constants::auth_path(&options.home, name));
            }
            mirrors.push(Mirror::remote(remote));

            if let Some(md5) = entry.expected_md5.as_deref() {
                if entry.irds_mirror {
                    let mirror_url = format!("{}/{}", options.mirror_url.trim_end_matches('/'), md5);
                    mirrors.push(Mirror::remote(
                        HttpDownload::new(&self.ctx, mirror_url).size_hint(entry.size_hint),
                    ));
                }
            }
        } else if let Some(instructions) = &entry.instructions {
            let local = match (&cache_path, entry.expected_md5.as_deref()) {
                (Some(path), _) => path.clone(),
                (None, Some(md5)) => constants::download_path(&options.home, md5),
                (None, None) => anyhow::bail!(
                    "Download entry {:?} has instructions but neither cache_path nor expected_md5",
                    key
                ),
            };
            let message = instructions.replace("{path}", &local.display().to_string());
            mirrors.push(Mirror::local(local, Some(message)));
        } else {
            anyhow::bail!("Download entry {:?} must either provide url or instructions", key);
        }

        Ok(Download::new(&self.ctx, mirrors)
            .expected(entry.expected_hash())
            .cache_path(cache_path)
            .agreement(self.agreement.clone())
            .stream_mode(entry.stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::PathResolvable;
    use crate::options::OptionsBuilder;

    const MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn config(dir: &Path) -> Result<DownloadConfig> {
        let ctx = Context::new(
            OptionsBuilder::new()
                .home(dir.join("home"))
                .tmp_dir(dir.join("tmp"))
                .small_file_size(1000)
                .mirror_url("https://mirror.example.org/")
                .build(),
        );
        let json = serde_json::json!({
            "dataset": {
                "big": {
                    "url": "https://example.org/big.tar.gz",
                    "expected_md5": MD5,
                    "cache_path": "big.tar.gz",
                    "irds_mirror": true,
                    "size_hint": 5000
                },
                "small": {
                    "url": "https://example.org/small.txt",
                    "expected_md5": MD5,
                    "size_hint": 10
                },
                "manual": {
                    "instructions": "Put the file at {path}",
                    "cache_path": "manual.xml"
                },
                "broken": { "expected_md5": MD5 }
            }
        });
        Ok(DownloadConfig::from_value(&ctx, json)
            .context("dataset", Some(dir.join("datasets/dataset")), Some("Agree first".into()))?)
    }

    #[test]
    fn test_url_entry_mirror_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let download = config(dir.path())?.get("big")?;
        let rendered: Vec<String> = download.mirrors().iter().map(|m| m.to_string()).collect();
        assert_eq!(rendered.len(), 3);
        assert_eq!(
            rendered[0],
            format!("Local({:?})", dir.path().join("home/downloads").join(MD5))
        );
        assert_eq!(rendered[1], "Http(\"https://example.org/big.tar.gz\")");
        assert_eq!(rendered[2], format!("Http(\"https://mirror.example.org/{}\")", MD5));
        assert_eq!(
            download.path(false)?,
            dir.path().join("datasets/dataset/big.tar.gz")
        );
        assert_eq!(download.expected_hash(), Some(&ExpectedHash::md5(MD5)));
        Ok(())
    }

    #[test]
    fn test_small_entry_has_no_local_mirror() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let download = config(dir.path())?.get("small")?;
        assert_eq!(download.mirrors().len(), 1);
        assert!(!download.mirrors()[0].is_local());
        Ok(())
    }

    #[test]
    fn test_instructions_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let download = config(dir.path())?.get("manual")?;
        assert_eq!(download.mirrors().len(), 1);
        assert!(download.mirrors()[0].is_local());
        assert_eq!(
            download.mirrors()[0].to_string(),
            format!("Local({:?})", dir.path().join("datasets/dataset/manual.xml"))
        );
        Ok(())
    }

    #[test]
    fn test_entry_without_source_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config(dir.path())?;
        let err = cfg.get("broken").err().unwrap();
        assert!(err.to_string().contains("must either provide url or instructions"));
        assert!(cfg.get("unknown").is_err());
        Ok(())
    }
}
