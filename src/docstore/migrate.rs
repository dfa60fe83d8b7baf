//! Version markers that invalidate derived artefacts.

use crate::atomic;
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Deletes a set of artefacts when the version recorded in `version_file`
/// differs from the expected one, then records the new version.
#[derive(Debug, Clone)]
pub struct Migrator {
    version_file: PathBuf,
    version: String,
    affected: Vec<PathBuf>,
    message: Option<String>,
}

impl Migrator {
    pub fn new<P: Into<PathBuf>, V: Into<String>>(version_file: P, version: V) -> Self {
        Self {
            version_file: version_file.into(),
            version: version.into(),
            affected: Vec::new(),
            message: None,
        }
    }

    /// File or directory removed on a version change.
    pub fn affects<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.affected.push(path.into());
        self
    }

    pub fn message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn current(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.version_file) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read {}", self.version_file.display())),
        }
    }

    /// Bring artefacts up to date. Returns true when anything was migrated.
    pub fn apply(&self) -> Result<bool> {
        if self.current()?.as_deref() == Some(self.version.as_str()) {
            return Ok(false);
        }

        let existing: Vec<&PathBuf> = self.affected.iter().filter(|p| p.exists()).collect();
        if !existing.is_empty() {
            match &self.message {
                Some(message) => log::info!("{}", message),
                None => log::info!(
                    "[Docstore] Migrating {} to version {}",
                    self.version_file.display(),
                    self.version
                ),
            }
            for path in existing {
                remove_path(path)?;
                log::debug!("[Docstore] Removed {}", path.display());
            }
        }

        atomic::write_bytes_atomic(&self.version_file, format!("{}\n", self.version).as_bytes())?;
        Ok(true)
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
