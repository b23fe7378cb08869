use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use strata_index::compact::{compact_report, deletable_volumes};
use strata_index::delete::{drop_filesets, purge_paths};
use strata_index::fileset::{fileset_entries, fileset_ids, filesets};
use strata_index::repair::{fix_duplicate_metahash, repair_index};
use strata_index::volume::{add_index_block_link, register_remote_volume};
use strata_index::{
    BackupSession, CompactOptions, ErrorCode, IndexDatabase, IndexOptions, RemoteVolumeState,
    RemoteVolumeType, VerifyOptions, EMPTY_METADATA_ID,
};

fn options() -> IndexOptions {
    IndexOptions {
        blocksize: 64,
        cache_memory: 1024 * 1024,
        ..IndexOptions::default()
    }
}

fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
}

fn volume(conn: &Connection, name: &str, kind: RemoteVolumeType) -> i64 {
    register_remote_volume(conn, name, kind, RemoteVolumeState::Verified, 4096).unwrap()
}

/// Index one file's content the way a backup would, returning its blockset
fn store(session: &mut BackupSession<'_>, data: &[u8], volume_id: i64) -> i64 {
    let digest = session.options().blockifier().unwrap().digest_bytes(data);
    for block in &digest.blocks {
        session
            .add_block(&block.hash.to_hex(), block.size as i64, volume_id)
            .unwrap();
    }
    for page in &digest.blocklist_pages {
        session
            .add_block(&page.hash.to_hex(), page.data.len() as i64, volume_id)
            .unwrap();
    }
    let (_, id) = session
        .add_blockset(
            &digest.full_hash.to_hex(),
            digest.length as i64,
            &digest.block_hashes_hex(),
            &digest.blocklist_hashes_hex(),
        )
        .unwrap();
    id
}

fn paths(conn: &Connection, fileset_id: i64) -> Vec<String> {
    let mut paths: Vec<String> = fileset_entries(conn, fileset_id)
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect();
    paths.sort();
    paths
}

struct Backups {
    db: IndexDatabase,
    first: i64,
    second: i64,
}

/// Two backups: `/a` unchanged across both, `/b` deleted and `/c` added in
/// the second
fn two_backups() -> Backups {
    let options = options();
    let mut db = IndexDatabase::open_in_memory().unwrap();

    let first = {
        let mut session = BackupSession::begin(&mut db, &options).unwrap();
        let conn = session.connection();
        let b1 = volume(conn, "b1", RemoteVolumeType::Blocks);
        let b2 = volume(conn, "b2", RemoteVolumeType::Blocks);
        let i2 = volume(conn, "i2", RemoteVolumeType::Index);
        add_index_block_link(conn, i2, b2).unwrap();
        let f1 = volume(conn, "f1", RemoteVolumeType::Files);

        let id = session
            .create_fileset(f1, Utc.timestamp_opt(1_000, 0).unwrap(), true)
            .unwrap();
        let meta_hash = "ab".repeat(32);
        session.add_block(&meta_hash, 12, b1).unwrap();
        let (_, meta) = session.add_metadataset(&meta_hash, 12).unwrap();
        let a = store(&mut session, &content(1, 150), b1);
        let b = store(&mut session, &content(2, 100), b2);
        session.add_directory_entry("/", meta, 1_000).unwrap();
        session.add_file("/a", a, meta, 1_000).unwrap();
        session.add_file("/b", b, EMPTY_METADATA_ID, 1_000).unwrap();
        session.commit().unwrap();
        id
    };

    let second = {
        let mut session = BackupSession::begin(&mut db, &options).unwrap();
        let conn = session.connection();
        let b3 = volume(conn, "b3", RemoteVolumeType::Blocks);
        let f2 = volume(conn, "f2", RemoteVolumeType::Files);

        let id = session
            .create_fileset(f2, Utc.timestamp_opt(2_000, 0).unwrap(), false)
            .unwrap();
        let c = store(&mut session, &content(3, 50), b3);
        session.add_file("/c", c, EMPTY_METADATA_ID, 2_000).unwrap();
        session
            .append_files_from_previous_set(&["/b".to_string()])
            .unwrap();
        session.commit().unwrap();
        id
    };

    Backups { db, first, second }
}

#[test]
fn test_incremental_backup_carries_unchanged_files() {
    let backups = two_backups();
    let conn = backups.db.connection();

    assert_eq!(paths(conn, backups.first), vec!["/", "/a", "/b"]);
    assert_eq!(paths(conn, backups.second), vec!["/", "/a", "/c"]);

    // The unchanged file shares one row across both filesets
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM File WHERE Path = '/a'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 1);

    strata_index::verify_consistency(conn, &VerifyOptions::new(&options()).verify_filelists(true))
        .unwrap();
}

#[test]
fn test_restore_point_selection() {
    let backups = two_backups();
    let conn = backups.db.connection();

    assert_eq!(
        fileset_ids(conn, None, &[]).unwrap(),
        vec![backups.second, backups.first]
    );
    assert_eq!(fileset_ids(conn, None, &[1]).unwrap(), vec![backups.first]);
    let at = Utc.timestamp_opt(1_500, 0).unwrap();
    assert_eq!(fileset_ids(conn, Some(at), &[]).unwrap(), vec![backups.first]);

    let empty = IndexDatabase::open_in_memory().unwrap();
    let err = fileset_ids(empty.connection(), None, &[]).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NoBackupAtDate));
}

#[test]
fn test_dropping_a_fileset_frees_its_volume() {
    let backups = two_backups();
    let conn = backups.db.connection();

    let dropped = drop_filesets(conn, &[backups.first]).unwrap();
    assert_eq!(dropped, vec![("f1".to_string(), 4096)]);
    assert_eq!(filesets(conn).unwrap().len(), 1);
    strata_index::verify_consistency(conn, &VerifyOptions::new(&options())).unwrap();

    // Everything in b2 belonged to /b only
    let report = compact_report(conn, &CompactOptions::default()).unwrap();
    assert!(report.should_reclaim());
    let names: Vec<&str> = report.deletable.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["b2"]);

    let mut deletable: Vec<String> = deletable_volumes(conn, &CompactOptions::default())
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    deletable.sort();
    assert_eq!(deletable, vec!["b2", "i2"]);
}

#[test]
fn test_purge_keeps_at_least_one_entry() {
    let backups = two_backups();
    let conn = backups.db.connection();

    let removed = purge_paths(conn, backups.second, &["/c".to_string()]).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(paths(conn, backups.second), vec!["/", "/a"]);

    let everything = vec!["/".to_string(), "/a".to_string()];
    let err = purge_paths(conn, backups.second, &everything).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PurgeRemovesAllFiles));
    assert_eq!(paths(conn, backups.second), vec!["/", "/a"]);
}

#[test]
fn test_repair_is_idempotent() {
    let backups = two_backups();
    let conn = backups.db.connection();

    // A second metadataset row for the same blockset
    conn.execute(
        "INSERT INTO Metadataset (BlocksetID) SELECT BlocksetID FROM Metadataset LIMIT 1",
        [],
    )
    .unwrap();

    fix_duplicate_metahash(conn).unwrap();
    repair_index(conn, &options()).unwrap();
    repair_index(conn, &options()).unwrap();

    let (rows, distinct): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COUNT(DISTINCT BlocksetID) FROM Metadataset",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(rows, distinct);
    strata_index::verify_consistency(conn, &VerifyOptions::new(&options()).verify_filelists(true))
        .unwrap();
}
