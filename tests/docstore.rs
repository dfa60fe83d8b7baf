mod common;

use anyhow::Result;
use corpusio::docstore::{
    build_all, Build, BundledDocstore, Docstore, GzipLinesBundle, JsonLines, Lz4Docstore, Record,
    SliceSpec,
};
use corpusio::fio::{File, FileResource, StreamExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Passage {
    doc_id: String,
    title: String,
    body: String,
}

impl Record for Passage {
    fn id(&self) -> &str {
        &self.doc_id
    }
}

fn passage(i: usize) -> Passage {
    Passage {
        doc_id: format!("MARCO_{:05}", i),
        title: format!("Title {}", i),
        body: format!("Body of passage {} ", i).repeat(1 + i % 7),
    }
}

/// Gzipped JSON lines for passages `range`.
fn write_jsonl_gz(path: &Path, range: std::ops::Range<usize>) -> Result<()> {
    let mut text = String::new();
    for i in range {
        text.push_str(&serde_json::to_string(&passage(i))?);
        text.push('\n');
    }
    fs::write(path, common::gzip(text.as_bytes())?)?;
    Ok(())
}

/// Passages `range` split across `members` concatenated gzip members.
fn write_multi_member_gz(path: &Path, range: std::ops::Range<usize>, members: usize) -> Result<()> {
    let ids: Vec<usize> = range.collect();
    let mut data = Vec::new();
    for chunk in ids.chunks(ids.len().div_ceil(members.max(1)).max(1)) {
        let mut text = String::new();
        for i in chunk {
            text.push_str(&serde_json::to_string(&passage(*i))?);
            text.push('\n');
        }
        data.extend(common::gzip(text.as_bytes())?);
    }
    fs::write(path, data)?;
    Ok(())
}

fn ids<I: Iterator<Item = Result<Passage>>>(records: I) -> Result<Vec<String>> {
    records.map(|r| r.map(|p| p.doc_id)).collect()
}

#[test]
fn test_store_from_compressed_source() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let source_path = dir.path().join("collection.jsonl.gz");
    write_jsonl_gz(&source_path, 0..1000)?;

    let source = JsonLines::<Passage>::new(Arc::new(File::new(&source_path).decompress_gzip()));
    let store = Lz4Docstore::new(dir.path().join("collection.store"), source);

    for i in [0, 1, 499, 999] {
        assert_eq!(store.get(&format!("MARCO_{:05}", i))?, Some(passage(i)));
    }
    assert_eq!(store.get("unknown")?, None);
    assert_eq!(store.count()?, 1000);

    let found = store.get_many(&["MARCO_00010", "MARCO_00900", "nope"])?;
    assert_eq!(found.len(), 2);
    assert_eq!(found["MARCO_00900"], passage(900));

    let nested = store.slice(&SliceSpec::new(10, 20))?.slice(&SliceSpec::new(2, 5))?;
    let direct = store.slice(&SliceSpec::new(12, 15))?;
    assert_eq!(ids(nested)?, ids(direct)?);

    let last_tenth = store.slice(&SliceSpec::from(0.9))?;
    assert_eq!(last_tenth.len(), 100);
    assert_eq!(ids(last_tenth)?.first().map(String::as_str), Some("MARCO_00900"));
    Ok(())
}

#[test]
fn test_build_all_runs_independent_stores() -> Result<()> {
    let dir = common::setup_temp_dir()?;

    let single_path = dir.path().join("single.jsonl.gz");
    write_jsonl_gz(&single_path, 0..300)?;
    let single = Lz4Docstore::new(
        dir.path().join("single.store"),
        JsonLines::<Passage>::new(Arc::new(File::new(&single_path).decompress_gzip())),
    );

    let mut bundles: Vec<Arc<dyn FileResource>> = Vec::new();
    for b in 0..3 {
        let path = dir.path().join(format!("part-{}.jsonl.gz", b));
        write_jsonl_gz(&path, b * 200..(b + 1) * 200)?;
        bundles.push(Arc::new(File::new(path)));
    }
    let bundled: BundledDocstore<Passage> = BundledDocstore::new(
        dir.path().join("bundled.index"),
        bundles,
        GzipLinesBundle::new().frequency(64),
    );

    let stores: [&dyn Build; 2] = [&single, &bundled];
    build_all(&stores, 2)?;
    assert!(single.built());
    assert!(bundled.built());

    assert_eq!(single.count()?, 300);
    assert_eq!(bundled.count()?, 600);
    assert_eq!(bundled.get("MARCO_00433")?, Some(passage(433)));
    let ids_across = ids(bundled.slice(&SliceSpec::new(195, 205))?)?;
    assert_eq!(ids_across.len(), 10);
    assert_eq!(ids_across[5], "MARCO_00200");
    Ok(())
}

#[test]
fn test_failed_build_is_reported_by_name() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let missing = JsonLines::<Passage>::new(Arc::new(File::new(dir.path().join("absent.jsonl"))));
    let store = Lz4Docstore::new(dir.path().join("broken.store"), missing);

    let stores: [&dyn Build; 1] = [&store];
    let err = build_all(&stores, 1).err().expect("source is missing");
    assert!(format!("{:#}", err).contains("broken.store"));
    assert!(!store.built());
    Ok(())
}

#[test]
fn test_gzip_bundles_random_access_matches_iteration() -> Result<()> {
    let dir = common::setup_temp_dir()?;
    let mut bundles: Vec<Arc<dyn FileResource>> = Vec::new();
    let mut start = 0;
    for (b, (size, members)) in [(300, 3), (1, 1), (457, 2), (242, 4)].into_iter().enumerate() {
        let path = dir.path().join(format!("msmarco_{:02}.json.gz", b));
        write_multi_member_gz(&path, start..start + size, members)?;
        bundles.push(Arc::new(File::new(path)));
        start += size;
    }
    let store: BundledDocstore<Passage> = BundledDocstore::new(
        dir.path().join("msmarco.index"),
        bundles,
        GzipLinesBundle::new().frequency(16),
    );

    let sequential: Vec<Passage> = store.iter()?.collect::<Result<_>>()?;
    assert_eq!(sequential.len(), 1000);
    assert_eq!(sequential, (0..1000).map(passage).collect::<Vec<_>>());

    // Every lookup seeks backwards from the previous one, across bundle and
    // member boundaries.
    for expected in sequential.iter().rev() {
        assert_eq!(store.get(&expected.doc_id)?.as_ref(), Some(expected));
    }

    // Forward skips within a bundle, then jumps back.
    for i in [5, 17, 299, 300, 301, 302, 759, 0, 999, 758, 16, 15] {
        assert_eq!(store.get(&format!("MARCO_{:05}", i))?, Some(passage(i)));
    }

    let wanted: Vec<String> = (0..1000).rev().step_by(37).map(|i| format!("MARCO_{:05}", i)).collect();
    let wanted_refs: Vec<&str> = wanted.iter().map(String::as_str).collect();
    let found = store.get_many(&wanted_refs)?;
    assert_eq!(found.len(), wanted.len());
    for id in &wanted {
        let i: usize = id["MARCO_".len()..].parse()?;
        assert_eq!(found[id.as_str()], sequential[i]);
    }
    Ok(())
}
