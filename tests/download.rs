mod common;

use anyhow::Result;
use common::ScriptedTransport;
use corpusio::download::{Download, DownloadConfig, HttpDownload, Mirror};
use corpusio::error::from_io;
use corpusio::fio::{ExpectedHash, PathResolvable, Streamable};
use corpusio::{classify, constants, Error};
use std::fs;
use std::io::Read;

const URL: &str = "https://data.example.org/corpus/docs.jsonl.gz";

fn download_to(
    ctx: &std::sync::Arc<corpusio::Context>,
    expected: &str,
    cache: &std::path::Path,
) -> Download {
    Download::new(ctx, vec![Mirror::remote(HttpDownload::new(ctx, URL))])
        .expected(Some(ExpectedHash::md5(expected)))
        .cache_path(Some(cache))
}

#[test]
fn test_ranged_resume_is_byte_exact() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(200_000);
    let transport = ScriptedTransport::new(data.clone(), true, &[50_000, 70_000]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let cache = dir.path().join("docs.jsonl.gz");
    let path = download_to(&ctx, &common::md5_hex(&data), &cache).path(true)?;
    assert_eq!(fs::read(path)?, data);
    assert_eq!(transport.ranges(), vec![None, Some(50_000), Some(120_000)]);
    Ok(())
}

#[test]
fn test_unranged_resume_discards_prefix() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(200_000);
    let transport = ScriptedTransport::new(data.clone(), false, &[50_000, 70_000]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let cache = dir.path().join("docs.jsonl.gz");
    let path = download_to(&ctx, &common::md5_hex(&data), &cache).path(true)?;
    assert_eq!(fs::read(path)?, data);
    assert_eq!(transport.ranges(), vec![None, None, None]);
    Ok(())
}

#[test]
fn test_progress_resets_tries_on_ranged_server() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(100_000);
    // Five interruptions, each after some progress; only three tries.
    let cuts = [10_000, 10_000, 10_000, 10_000, 10_000];
    let transport = ScriptedTransport::new(data.clone(), true, &cuts);
    let ctx = common::http_context(dir.path(), transport.clone());

    let mut stream = HttpDownload::new(&ctx, URL).open()?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    assert_eq!(out, data);
    assert_eq!(transport.ranges().len(), 6);
    Ok(())
}

#[test]
fn test_no_progress_exhausts_tries() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let transport = ScriptedTransport::new(common::payload(1_000), true, &[0, 0, 0]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let mut stream = HttpDownload::new(&ctx, URL).open()?;
    let err = stream.read_to_end(&mut Vec::new()).err().expect("download fails");
    let err = from_io(err);
    assert!(matches!(
        classify(&err),
        Some(Error::NetworkFailure { attempts: 3, url, .. }) if url == URL
    ));
    assert_eq!(transport.ranges().len(), 3);
    Ok(())
}

#[test]
fn test_http_error_status_is_network_failure() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let transport = ScriptedTransport::failing(404);
    let ctx = common::http_context(dir.path(), transport.clone());

    let cache = dir.path().join("missing.bin");
    let err = download_to(&ctx, &common::md5_hex(b""), &cache)
        .path(true)
        .err()
        .expect("404 fails");
    assert!(matches!(classify(&err), Some(Error::NetworkFailure { .. })));
    assert!(!cache.exists());
    Ok(())
}

#[test]
fn test_integrity_mismatch_leaves_no_file() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(10_000);
    let transport = ScriptedTransport::new(data, true, &[]);
    let ctx = common::http_context(dir.path(), transport);

    let cache_dir = dir.path().join("cache");
    let cache = cache_dir.join("docs.jsonl.gz");
    let err = download_to(&ctx, &common::md5_hex(b"something else"), &cache)
        .path(true)
        .err()
        .expect("hash mismatch");
    assert!(matches!(
        classify(&err),
        Some(Error::IntegrityMismatch { algorithm, .. }) if algorithm == "md5"
    ));
    assert!(!cache.exists());
    let leftovers = match fs::read_dir(&cache_dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    };
    assert_eq!(leftovers, 0);
    Ok(())
}

#[test]
fn test_config_entry_downloads_to_base_path() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(5_000);
    let transport = ScriptedTransport::new(data.clone(), true, &[1_000]);
    let ctx = common::http_context(dir.path(), transport);

    let json = format!(
        r#"{{"docs": {{"url": "{}", "expected_md5": "{}", "cache_path": "docs.jsonl.gz", "size_hint": 5000}}}}"#,
        URL,
        common::md5_hex(&data)
    );
    let config = DownloadConfig::from_json_str(&ctx, &json)?.base_path(dir.path().join("dataset"));
    let download = config.get("docs")?;
    // Small entries get no hash-addressed local mirror.
    assert_eq!(download.mirrors().len(), 1);
    let path = download.path(true)?;
    assert_eq!(path, dir.path().join("dataset/docs.jsonl.gz"));
    assert_eq!(fs::read(path)?, data);
    Ok(())
}

#[test]
fn test_hash_addressed_local_copy_skips_network() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(5_000);
    let md5 = common::md5_hex(&data);
    let transport = ScriptedTransport::new(Vec::new(), true, &[]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let local = constants::download_path(dir.path().join("home"), &md5);
    fs::create_dir_all(local.parent().expect("parent"))?;
    fs::write(&local, &data)?;

    let json = format!(
        r#"{{"docs": {{"url": "{}", "expected_md5": "{}", "cache_path": "docs.bin"}}}}"#,
        URL, md5
    );
    let config = DownloadConfig::from_json_str(&ctx, &json)?.base_path(dir.path());
    let path = config.get("docs")?.path(true)?;
    assert_eq!(fs::read(path)?, data);
    assert!(transport.ranges().is_empty());
    Ok(())
}

#[test]
fn test_config_auth_sent_on_every_request() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(5_000);
    let transport = ScriptedTransport::new(data.clone(), true, &[1_000, 2_000]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let json = format!(
        r#"{{"docs": {{"url": "{}", "expected_md5": "{}", "cache_path": "docs.bin", "size_hint": 5000, "auth": "example"}}}}"#,
        URL,
        common::md5_hex(&data)
    );
    let config = DownloadConfig::from_json_str(&ctx, &json)?.base_path(dir.path());
    let download = config.get("docs")?;

    // The descriptor builds without credentials; only the transfer needs them.
    let err = download.path(true).unwrap_err();
    assert!(format!("{:#}", err).contains("Missing credentials file"));
    assert!(transport.usernames().is_empty());
    assert!(!dir.path().join("docs.bin").exists());

    let auth = constants::auth_path(dir.path().join("home"), "example");
    fs::create_dir_all(auth.parent().expect("parent"))?;
    fs::write(&auth, "reader\nhunter2\n")?;
    let path = download.path(true)?;
    assert_eq!(fs::read(path)?, data);

    let usernames = transport.usernames();
    assert_eq!(usernames.len(), 3);
    assert!(usernames.iter().all(|u| u.as_deref() == Some("reader")));
    Ok(())
}

#[test]
fn test_entry_without_auth_sends_no_credentials() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let data = common::payload(1_000);
    let transport = ScriptedTransport::new(data.clone(), true, &[]);
    let ctx = common::http_context(dir.path(), transport.clone());

    let mut stream = HttpDownload::new(&ctx, URL).open()?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    assert_eq!(out, data);
    assert_eq!(transport.usernames(), vec![None]);
    Ok(())
}
