//! Integration tests for merge and differential export.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use kccp_cache::{CacheConfig, CacheEngine, CacheError, CacheRecord, TransferReport};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, path::Path};
use tempfile::TempDir;

const JAN: &str = "Mon, 01 Jan 2024 00:00:00 GMT";
const FEB: &str = "Thu, 01 Feb 2024 00:00:00 GMT";

fn record(version: &str, lastmodified: &str, length: u64) -> CacheRecord {
    CacheRecord {
        version: version.to_string(),
        lastmodified: Some(lastmodified.to_string()),
        length: Some(length),
        cache: None,
    }
}

/// Lay out a cache directory from (path, record, contents) triples.
fn write_cache(root: &Path, entries: &[(&str, CacheRecord, &str)]) {
    let mut index = BTreeMap::new();
    for (path, record, contents) in entries {
        let file = root.join(path.trim_start_matches('/'));
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, contents).unwrap();
        index.insert((*path).to_string(), record.clone());
    }
    std::fs::write(
        root.join("cached.json"),
        serde_json::to_vec(&index).unwrap(),
    )
    .unwrap();
}

async fn open(root: &Path) -> CacheEngine {
    CacheEngine::open(CacheConfig::new(root)).await.unwrap()
}

#[tokio::test]
async fn test_merge_reconciles_by_lastmodified() {
    let local = TempDir::new().unwrap();
    let foreign = TempDir::new().unwrap();

    write_cache(
        local.path(),
        &[
            ("/kcs2/newer.png", record("?v9", FEB, 5), "local"),
            ("/kcs2/older.png", record("?v1", JAN, 3), "old"),
            ("/kcs2/same.png", record("?v1", JAN, 4), "same"),
            ("/kcs2/retag.png", record("?v1", JAN, 5), "retag"),
        ],
    );
    write_cache(
        foreign.path(),
        &[
            ("/kcs2/newer.png", record("?v1", JAN, 7), "foreign"),
            ("/kcs2/older.png", record("?v2", FEB, 3), "new"),
            ("/kcs2/same.png", record("?v1", JAN, 4), "same"),
            ("/kcs2/retag.png", record("?v2", JAN, 5), "retag"),
            ("/kcs2/fresh.png", record("?v1", FEB, 5), "fresh"),
        ],
    );
    // Listed in the foreign index without a backing file
    let mut foreign_index: BTreeMap<String, CacheRecord> =
        serde_json::from_slice(&std::fs::read(foreign.path().join("cached.json")).unwrap())
            .unwrap();
    foreign_index.insert("/kcs2/lost.png".to_string(), record("?v1", FEB, 1));
    std::fs::write(
        foreign.path().join("cached.json"),
        serde_json::to_vec(&foreign_index).unwrap(),
    )
    .unwrap();

    let engine = open(local.path()).await;
    let report = engine.merge(foreign.path()).await.unwrap();

    assert_eq!(
        report,
        TransferReport {
            skipped: 2,
            copied: 2,
            updated: 1,
            errored: 1,
        }
    );

    let index = engine.index();
    assert_eq!(index.get("/kcs2/newer.png").unwrap().version, "?v9");
    assert_eq!(
        std::fs::read(local.path().join("kcs2/newer.png")).unwrap(),
        b"local"
    );
    assert_eq!(index.get("/kcs2/older.png").unwrap(), record("?v2", FEB, 3));
    assert_eq!(
        std::fs::read(local.path().join("kcs2/older.png")).unwrap(),
        b"new"
    );
    assert_eq!(index.get("/kcs2/retag.png").unwrap().version, "?v2");
    assert!(index.contains("/kcs2/fresh.png"));
    assert!(!index.contains("/kcs2/lost.png"));

    // Merge always ends with a forced save
    let saved: BTreeMap<String, CacheRecord> =
        serde_json::from_slice(&std::fs::read(local.path().join("cached.json")).unwrap()).unwrap();
    assert_eq!(saved.len(), 5);
}

#[tokio::test]
async fn test_merge_requires_index() {
    let local = TempDir::new().unwrap();
    let foreign = TempDir::new().unwrap();
    let engine = open(local.path()).await;

    let err = engine.merge(foreign.path()).await.unwrap_err();
    assert!(matches!(err, CacheError::MissingIndex(_)));
}

#[tokio::test]
async fn test_diff_package_merges_into_baseline() {
    let updated_cache = TempDir::new().unwrap();
    let baseline_cache = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    write_cache(
        updated_cache.path(),
        &[
            ("/kcs2/a.png", record("?v1", JAN, 3), "aaa"),
            ("/kcs2/b.png", record("?v2", FEB, 4), "bbbb"),
            ("/kcs2/c.png", record("?v5", JAN, 3), "ccc"),
            ("/kcs2/d.png", record("?v1", FEB, 2), "dd"),
        ],
    );
    write_cache(
        baseline_cache.path(),
        &[
            ("/kcs2/a.png", record("?v1", JAN, 3), "aaa"),
            ("/kcs2/b.png", record("?v1", JAN, 3), "bb0"),
            ("/kcs2/c.png", record("?v4", JAN, 3), "ccc"),
        ],
    );

    let package = out.path().join("update.tar.gz");
    let engine = open(updated_cache.path()).await;
    let report = engine
        .diff(&baseline_cache.path().join("cached.json"), &package)
        .await
        .unwrap();
    assert_eq!(
        report,
        TransferReport {
            skipped: 1,
            copied: 2,
            updated: 1,
            errored: 0,
        }
    );
    assert!(package.exists());

    let baseline = open(baseline_cache.path()).await;
    let merged = baseline.merge(&package).await.unwrap();
    assert_eq!(
        merged,
        TransferReport {
            skipped: 0,
            copied: 2,
            updated: 1,
            errored: 0,
        }
    );

    assert_eq!(baseline.index().get("/kcs2/b.png").unwrap(), record("?v2", FEB, 4));
    assert_eq!(baseline.index().get("/kcs2/c.png").unwrap().version, "?v5");
    assert_eq!(
        std::fs::read(baseline_cache.path().join("kcs2/b.png")).unwrap(),
        b"bbbb"
    );
    assert_eq!(
        std::fs::read(baseline_cache.path().join("kcs2/d.png")).unwrap(),
        b"dd"
    );
}

#[tokio::test]
async fn test_diff_counts_missing_local_files() {
    let cache = TempDir::new().unwrap();
    let baseline = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    write_cache(cache.path(), &[("/kcs2/a.png", record("?v1", FEB, 3), "aaa")]);
    write_cache(baseline.path(), &[("/kcs2/z.png", record("?v1", JAN, 1), "z")]);
    std::fs::remove_file(cache.path().join("kcs2/a.png")).unwrap();

    let engine = open(cache.path()).await;
    let report = engine
        .diff(&baseline.path().join("cached.json"), &out.path().join("p.tgz"))
        .await
        .unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(report.copied, 0);
}
