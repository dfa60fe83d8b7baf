//! Write-to-temp-then-rename helpers.
//!
//! Temp names are `<target>.tmpN`, claimed with an exclusive create so two
//! processes never share an in-progress file. Only a complete file is ever
//! renamed onto the target name.

use crate::constants::MAX_TMP_ATTEMPTS;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn tmp_name(path: &Path, attempt: u32) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".tmp{}", attempt));
    PathBuf::from(name)
}

/// Claim a fresh `<path>.tmpN` file.
pub fn create_exclusive_tmp(path: &Path) -> Result<(PathBuf, File)> {
    for attempt in 0..MAX_TMP_ATTEMPTS {
        let candidate = tmp_name(path, attempt);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", candidate.display()))
            }
        }
    }
    anyhow::bail!(
        "No free temp name for {} after {} attempts",
        path.display(),
        MAX_TMP_ATTEMPTS
    )
}

/// Claim a fresh `<path>.tmpN` directory.
pub fn create_exclusive_dir(path: &Path) -> Result<PathBuf> {
    for attempt in 0..MAX_TMP_ATTEMPTS {
        let candidate = tmp_name(path, attempt);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", candidate.display()))
            }
        }
    }
    anyhow::bail!(
        "No free temp directory for {} after {} attempts",
        path.display(),
        MAX_TMP_ATTEMPTS
    )
}

/// Produce `path` through `write`, renaming into place only on success.
///
/// On failure the temp file is removed and the error propagates unchanged.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let (tmp_path, mut file) = create_exclusive_tmp(path)?;
    let result = write(&mut file).and_then(|()| {
        file.flush()?;
        file.sync_all()?;
        Ok(())
    });
    drop(file);

    if let Err(e) = result {
        remove_quietly(&tmp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        remove_quietly(&tmp_path);
        return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
    }
    Ok(())
}

/// `write_atomic` for an in-memory payload.
pub fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic(path, |file| {
        file.write_all(data)?;
        Ok(())
    })
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_success() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("nested/out.txt");
        write_bytes_atomic(&target, b"hello")?;
        assert_eq!(fs::read(&target)?, b"hello");
        assert!(!tmp_name(&target, 0).exists());
        Ok(())
    }

    #[test]
    fn test_write_atomic_failure_leaves_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("out.txt");
        let result = write_atomic(&target, |file| {
            file.write_all(b"partial")?;
            anyhow::bail!("stream broke")
        });
        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_exclusive_tmp_skips_taken_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("f");
        let (first, _a) = create_exclusive_tmp(&target)?;
        let (second, _b) = create_exclusive_tmp(&target)?;
        assert_eq!(first, dir.path().join("f.tmp0"));
        assert_eq!(second, dir.path().join("f.tmp1"));

        let staging = create_exclusive_dir(&dir.path().join("store"))?;
        assert!(staging.is_dir());
        Ok(())
    }
}
