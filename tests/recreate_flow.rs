//! Back up into a simulated remote store, then rebuild a fresh index from
//! nothing but what was uploaded.

mod common;

use std::collections::HashMap;

use common::*;
use strata::index::fileset::{create_fileset, fileset_ids};
use strata::index::volume::register_remote_volume;
use strata::index::{
    verify_consistency, BackupSession, ErrorCode, IndexDatabase, RecreateSession,
    RemoteVolumeState, RemoteVolumeType, VerifyOptions, EMPTY_METADATA_ID,
};

struct Backed {
    original: IndexDatabase,
    remote: RemoteStore,
    /// Blocklist page hashes of `/big`
    big_pages: Vec<String>,
}

/// Two backups: the second drops `/small`, adds `/new` and keeps the rest
fn back_up() -> Backed {
    let options = options();
    let mut original = IndexDatabase::open_in_memory().unwrap();
    let mut remote = RemoteStore::default();

    let (first, big_hash) = {
        let mut session = BackupSession::begin(&mut original, &options).unwrap();
        let b1 = remote.create_volume(session.connection(), "b1", RemoteVolumeType::Blocks);
        let b2 = remote.create_volume(session.connection(), "b2", RemoteVolumeType::Blocks);
        let f1 = remote.create_volume(session.connection(), "f1", RemoteVolumeType::Files);
        let id = session.create_fileset(f1, at(1_000), true).unwrap();

        let meta = remote.store_metadata(&mut session, ("b1", b1), &content(9, 20));
        let (big, big_hash) = remote.store(&mut session, ("b1", b1), &content(1, 150));
        let (small, _) = remote.store(&mut session, ("b2", b2), &content(2, 40));
        session.add_directory_entry("/", meta, 1_000).unwrap();
        session.add_file("/big", big, meta, 1_000).unwrap();
        session.add_file("/small", small, EMPTY_METADATA_ID, 1_000).unwrap();
        session.add_symlink_entry("/link", EMPTY_METADATA_ID, 1_000).unwrap();
        session.commit().unwrap();
        (id, big_hash)
    };
    remote.upload_filelist(original.connection(), first, "f1", 1_000, true);

    let second = {
        let mut session = BackupSession::begin(&mut original, &options).unwrap();
        let b3 = remote.create_volume(session.connection(), "b3", RemoteVolumeType::Blocks);
        let f2 = remote.create_volume(session.connection(), "f2", RemoteVolumeType::Files);
        let id = session.create_fileset(f2, at(2_000), false).unwrap();

        let (new, _) = remote.store(&mut session, ("b3", b3), &content(3, 100));
        session.add_file("/new", new, EMPTY_METADATA_ID, 2_000).unwrap();
        session
            .append_files_from_previous_set(&["/small".to_string()])
            .unwrap();
        session.commit().unwrap();
        id
    };
    remote.upload_filelist(original.connection(), second, "f2", 2_000, false);

    let big_pages = remote.blocklists[&big_hash].clone();
    Backed {
        original,
        remote,
        big_pages,
    }
}

fn metadata_id(session: &mut RecreateSession<'_>, remote: &RemoteStore, hash: Option<&str>) -> i64 {
    match hash {
        None => EMPTY_METADATA_ID,
        Some(hash) => {
            let size = remote.metadata_sizes[hash];
            session.add_small_blockset_link(hash, hash, size).unwrap();
            session.add_metadataset(hash, size, &[], 0).unwrap()
        }
    }
}

/// Rebuild an index from the file lists, reading `listed` block volumes
/// first and finding the rest through the recovery passes.
///
/// Returns the blocklist pages still missing at the end.
fn recreate(db: &IndexDatabase, remote: &mut RemoteStore, listed: &[&str]) -> Vec<String> {
    let options = options();
    let mut session = RecreateSession::begin(db, &options).unwrap();

    let mut ids = HashMap::new();
    for (name, kind, size) in &remote.catalog {
        let id = register_remote_volume(
            session.connection(),
            name,
            *kind,
            RemoteVolumeState::Verified,
            *size,
        )
        .unwrap();
        ids.insert(name.clone(), id);
    }

    for list in &remote.filelists {
        let fileset_id = create_fileset(
            session.connection(),
            ids[&list.volume],
            at(list.timestamp),
            list.is_full_backup,
        )
        .unwrap();

        for entry in &list.entries {
            match entry {
                ListedEntry::File {
                    path,
                    full_hash,
                    length,
                    scantime,
                    metadata_hash,
                } => {
                    let meta = metadata_id(&mut session, remote, metadata_hash.as_deref());
                    let pages = &remote.blocklists[full_hash];
                    let blockset = session
                        .add_blockset(full_hash, *length, pages, pages.len())
                        .unwrap();
                    if *length <= options.blocksize as i64 {
                        session
                            .add_small_blockset_link(full_hash, full_hash, *length)
                            .unwrap();
                    }
                    session
                        .add_file_entry(fileset_id, path, *scantime, blockset, meta)
                        .unwrap();
                }
                ListedEntry::Directory {
                    path,
                    scantime,
                    metadata_hash,
                } => {
                    let meta = metadata_id(&mut session, remote, metadata_hash.as_deref());
                    session
                        .add_directory_entry(fileset_id, path, *scantime, meta)
                        .unwrap();
                }
                ListedEntry::Symlink {
                    path,
                    scantime,
                    metadata_hash,
                } => {
                    let meta = metadata_id(&mut session, remote, metadata_hash.as_deref());
                    session
                        .add_symlink_entry(fileset_id, path, *scantime, meta)
                        .unwrap();
                }
            }
        }
    }

    for name in listed {
        let volume = remote.volumes.get_mut(*name).unwrap();
        session.restore_block_volume(ids[*name], volume).unwrap();
    }

    session.find_missing_blocklist_hashes().unwrap();
    for pass in 0..3 {
        for volume in session.missing_blocklist_volumes(pass, false).unwrap() {
            let reader = remote.volumes.get_mut(&volume.name).unwrap();
            session.restore_block_volume(volume.id, reader).unwrap();
        }
    }

    let missing = session.find_missing_blocklist_hashes().unwrap();
    assert_eq!(session.cleanup_missing_volumes().unwrap(), 0);
    session.cleanup_deleted_blocks().unwrap();
    session.commit().unwrap();
    missing
}

#[test]
fn test_recreate_matches_original() {
    let mut backed = back_up();
    let rebuilt = IndexDatabase::open_in_memory().unwrap();

    // Only b1 is known up front; b2 and b3 are found by the passes
    let missing = recreate(&rebuilt, &mut backed.remote, &["b1"]);
    assert!(missing.is_empty());

    let original = backed.original.connection();
    let conn = rebuilt.connection();
    let before = fileset_ids(original, None, &[]).unwrap();
    let after = fileset_ids(conn, None, &[]).unwrap();
    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 2);
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(describe_fileset(original, *old), describe_fileset(conn, *new));
    }

    let unplaced: i64 = conn
        .query_row("SELECT COUNT(*) FROM Block WHERE VolumeID < 0", [], |r| r.get(0))
        .unwrap();
    assert_eq!(unplaced, 0);

    verify_consistency(conn, &VerifyOptions::new(&options()).verify_filelists(true)).unwrap();
}

#[test]
fn test_recreate_reads_every_volume_when_all_are_listed() {
    let mut backed = back_up();
    let rebuilt = IndexDatabase::open_in_memory().unwrap();

    let missing = recreate(&rebuilt, &mut backed.remote, &["b1", "b2", "b3"]);
    assert!(missing.is_empty());

    let conn = rebuilt.connection();
    let blocks: i64 = conn
        .query_row("SELECT COUNT(*) FROM Block", [], |r| r.get(0))
        .unwrap();
    let original: i64 = backed
        .original
        .connection()
        .query_row("SELECT COUNT(*) FROM Block", [], |r| r.get(0))
        .unwrap();
    assert_eq!(blocks, original);
    verify_consistency(conn, &VerifyOptions::new(&options())).unwrap();
}

#[test]
fn test_corrupt_blocklist_page_stays_missing() {
    let mut backed = back_up();
    let page = backed.big_pages[0].clone();
    let stored = backed
        .remote
        .volumes
        .get_mut("b1")
        .unwrap()
        .blocks
        .get_mut(&page)
        .unwrap();
    stored[0] ^= 0xff;

    let rebuilt = IndexDatabase::open_in_memory().unwrap();
    let missing = recreate(&rebuilt, &mut backed.remote, &["b1"]);
    assert_eq!(missing, vec![page]);

    // `/big` only has the entries of its intact second page
    let err = verify_consistency(rebuilt.connection(), &VerifyOptions::new(&options())).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::BlocksetLengthMismatch));
}
