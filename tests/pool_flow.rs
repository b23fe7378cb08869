//! Maintenance of an on-disk index through the async connection pool.

mod common;

use std::path::Path;

use common::*;
use strata::index::delete::drop_filesets;
use strata::index::{
    BackupSession, CompactOptions, IndexDatabase, IndexPool, RemoteVolumeState, RemoteVolumeType,
    VerifyOptions, EMPTY_METADATA_ID,
};
use tempfile::TempDir;

/// Two daily backups where the second replaces `/log` with new content
fn seed(path: &Path) -> (i64, i64) {
    let options = options();
    let mut db = IndexDatabase::open(path).unwrap();
    let mut remote = RemoteStore::default();

    let first = {
        let mut session = BackupSession::begin(&mut db, &options).unwrap();
        let b1 = remote.create_volume(session.connection(), "b1", RemoteVolumeType::Blocks);
        let b2 = remote.create_volume(session.connection(), "b2", RemoteVolumeType::Blocks);
        let f1 = remote.create_volume(session.connection(), "f1", RemoteVolumeType::Files);
        let id = session.create_fileset(f1, at(86_400), true).unwrap();

        let (data, _) = remote.store(&mut session, ("b1", b1), &content(1, 200));
        let (log, _) = remote.store(&mut session, ("b2", b2), &content(2, 130));
        session.add_file("/data", data, EMPTY_METADATA_ID, 86_400).unwrap();
        session.add_file("/log", log, EMPTY_METADATA_ID, 86_400).unwrap();
        session.commit().unwrap();
        id
    };

    let second = {
        let mut session = BackupSession::begin(&mut db, &options).unwrap();
        let b3 = remote.create_volume(session.connection(), "b3", RemoteVolumeType::Blocks);
        let f2 = remote.create_volume(session.connection(), "f2", RemoteVolumeType::Files);
        let id = session.create_fileset(f2, at(2 * 86_400), true).unwrap();

        let (log, _) = remote.store(&mut session, ("b3", b3), &content(3, 130));
        session.add_file("/log", log, EMPTY_METADATA_ID, 2 * 86_400).unwrap();
        // The old `/log` is replaced, not carried
        session
            .append_files_from_previous_set_with_predicate(|path, _| path == "/log")
            .unwrap();
        session.commit().unwrap();
        id
    };

    (first, second)
}

#[tokio::test]
async fn test_retention_frees_replaced_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.sqlite");
    let (first, second) = seed(&path);

    let pool = IndexPool::new(&path).unwrap();
    pool.verify(VerifyOptions::new(&options()).verify_filelists(true))
        .await
        .unwrap();

    let before = pool.compact_report(CompactOptions::default()).await.unwrap();
    assert!(!before.should_reclaim());

    let dropped = pool
        .execute_transaction(move |tx| drop_filesets(tx, &[first]))
        .await
        .unwrap();
    assert_eq!(dropped, vec![("f1".to_string(), 4096)]);

    let sets = pool.filesets().await.unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].id, second);
    assert_eq!(pool.fileset_entries(second).await.unwrap().len(), 2);

    // The first `/log` lived alone in b2
    let report = pool.compact_report(CompactOptions::default()).await.unwrap();
    assert!(report.should_reclaim());
    let names: Vec<&str> = report.deletable.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["b2"]);
    assert!(report.reason().contains("1 fully wasted volumes"));

    let volumes = pool.remote_volumes().await.unwrap();
    let f1 = volumes.iter().find(|v| v.name == "f1").unwrap();
    assert_eq!(f1.state, RemoteVolumeState::Deleting);

    pool.verify(VerifyOptions::new(&options())).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_reports() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.sqlite");
    seed(&path);

    let pool = IndexPool::builder().path(&path).max_size(4).build().unwrap();
    let reports = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.wasted_space_report().await })
    };
    let listing = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.fileset_ids(None, vec![0]).await })
    };

    let usage = reports.await.unwrap().unwrap();
    assert_eq!(usage.len(), 3);
    assert!(usage.iter().all(|v| v.wasted_size == 0));

    let newest = listing.await.unwrap().unwrap();
    assert_eq!(newest.len(), 1);
}
