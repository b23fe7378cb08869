//! Removing filesets and paths, and everything only they kept alive.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::errors::{ErrorCode, IndexError, Result};
use crate::query::QueryBuilder;
use crate::temp_table::TempTable;
use crate::transaction::TemporaryTransaction;
use crate::volume::RemoteVolumeState;

/// Delete rows no fileset reaches any more.
///
/// Blocks that lose their last reference are tombstoned in `DeletedBlock`
/// together with their duplicate copies, so compaction can account for the
/// space they still occupy remotely.
fn remove_unreferenced(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DELETE FROM File WHERE ID NOT IN (SELECT DISTINCT FileID FROM FilesetEntry);
        DELETE FROM Metadataset WHERE ID NOT IN (SELECT DISTINCT MetadataID FROM File);
        DELETE FROM Blockset WHERE ID NOT IN (
            SELECT DISTINCT BlocksetID FROM File
            UNION SELECT DISTINCT BlocksetID FROM Metadataset);
        DELETE FROM BlocksetEntry WHERE BlocksetID NOT IN (SELECT ID FROM Blockset);
        DELETE FROM BlocklistHash WHERE BlocksetID NOT IN (SELECT ID FROM Blockset);
        "#,
    )?;

    let orphans = TempTable::create_as(
        conn,
        "OrphanBlocks",
        "SELECT ID, Hash, Size, VolumeID FROM Block
         WHERE ID NOT IN (SELECT DISTINCT BlockID FROM BlocksetEntry)
           AND Hash NOT IN (SELECT DISTINCT Hash FROM BlocklistHash)",
        [],
    )?;

    conn.execute_batch(&format!(
        r#"
        INSERT INTO DeletedBlock (Hash, Size, VolumeID)
            SELECT Hash, Size, VolumeID FROM {o};
        INSERT INTO DeletedBlock (Hash, Size, VolumeID)
            SELECT {o}.Hash, {o}.Size, DuplicateBlock.VolumeID
            FROM DuplicateBlock JOIN {o} ON {o}.ID = DuplicateBlock.BlockID;
        DELETE FROM DuplicateBlock WHERE BlockID IN (SELECT ID FROM {o});
        DELETE FROM Block WHERE ID IN (SELECT ID FROM {o});
        "#,
        o = orphans.quoted()
    ))?;

    debug!("Tombstoned {} unreferenced blocks", orphans.count()?);
    Ok(())
}

/// Drop filesets and the content only they referenced.
///
/// Returns `(name, size)` of the files volumes that materialized the dropped
/// filesets; they are marked `Deleting` for the transfer layer to remove.
pub fn drop_filesets(conn: &Connection, fileset_ids: &[i64]) -> Result<Vec<(String, i64)>> {
    if fileset_ids.is_empty() {
        return Ok(Vec::new());
    }
    let tx = TemporaryTransaction::join(conn)?;

    let dropped = TempTable::create(&tx, "DropFilesetIds", "ID INTEGER PRIMARY KEY")?;
    QueryBuilder::new(format!(
        "INSERT OR IGNORE INTO {} SELECT ID FROM Fileset",
        dropped.quoted()
    ))
    .and_where_in("ID", fileset_ids.iter().copied())
    .execute(&tx)?;

    let volumes = QueryBuilder::new("SELECT Name, Size FROM RemoteVolume")
        .and_where(format!(
            "ID IN (SELECT VolumeID FROM Fileset WHERE ID IN (SELECT ID FROM {}))",
            dropped.quoted()
        ))
        .and_where("Type = 'Files'")
        .then("ORDER BY ID")
        .query_map(&tx, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    QueryBuilder::new("UPDATE RemoteVolume SET State = :deleting")
        .bind(":deleting", RemoteVolumeState::Deleting.as_str().to_string())
        .and_where(format!(
            "ID IN (SELECT VolumeID FROM Fileset WHERE ID IN (SELECT ID FROM {}))",
            dropped.quoted()
        ))
        .and_where("Type = 'Files'")
        .execute(&tx)?;

    tx.execute_batch(&format!(
        "DELETE FROM FilesetEntry WHERE FilesetID IN (SELECT ID FROM {d});
         DELETE FROM Fileset WHERE ID IN (SELECT ID FROM {d});",
        d = dropped.quoted()
    ))?;
    let count = dropped.count()?;
    drop(dropped);

    remove_unreferenced(&tx)?;
    tx.commit()?;

    info!("Dropped {} filesets", count);
    Ok(volumes)
}

/// Remove `paths` from one fileset.
///
/// Refuses when nothing would be left, since an empty fileset cannot be told
/// apart from a failed backup.
pub fn purge_paths(conn: &Connection, fileset_id: i64, paths: &[String]) -> Result<usize> {
    if paths.is_empty() {
        return Ok(0);
    }
    let tx = TemporaryTransaction::join(conn)?;

    let purge = TempTable::create(&tx, "PurgePaths", "Path TEXT PRIMARY KEY")?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR IGNORE INTO {} (Path) VALUES (?1)",
            purge.quoted()
        ))?;
        for path in paths {
            stmt.execute(params![path])?;
        }
    }

    let matching = format!(
        "FileID IN (SELECT ID FROM File WHERE Path IN (SELECT Path FROM {}))",
        purge.quoted()
    );
    let total = QueryBuilder::new("SELECT COUNT(*) FROM FilesetEntry")
        .and_where("FilesetID = :fileset")
        .bind(":fileset", fileset_id)
        .query_scalar(&tx)?;
    let purged = QueryBuilder::new("SELECT COUNT(*) FROM FilesetEntry")
        .and_where("FilesetID = :fileset")
        .bind(":fileset", fileset_id)
        .and_where(matching.clone())
        .query_scalar(&tx)?;

    if purged == 0 {
        debug!("Nothing to purge from fileset {}", fileset_id);
        return Ok(0);
    }
    if purged >= total {
        return Err(IndexError::user(
            ErrorCode::PurgeRemovesAllFiles,
            format!(
                "Purging would remove all {} files from fileset {}",
                total, fileset_id
            ),
        ));
    }

    let removed = QueryBuilder::new("DELETE FROM FilesetEntry")
        .and_where("FilesetID = :fileset")
        .bind(":fileset", fileset_id)
        .and_where(matching)
        .execute(&tx)?;
    drop(purge);

    remove_unreferenced(&tx)?;
    tx.commit()?;

    info!("Purged {} entries from fileset {}", removed, fileset_id);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::IndexDatabase;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO RemoteVolume (ID, Name, Type, State, Size) VALUES
                (1, 'b-1', 'Blocks', 'Verified', 1000),
                (2, 'f-1', 'Files', 'Verified', 10),
                (3, 'f-2', 'Files', 'Verified', 20),
                (4, 'b-2', 'Blocks', 'Verified', 500);
             INSERT INTO Block (ID, Hash, Size, VolumeID) VALUES
                (1, 'shared', 10, 1), (2, 'old', 20, 1), (3, 'meta', 5, 1);
             INSERT INTO DuplicateBlock (BlockID, VolumeID) VALUES (2, 4);
             INSERT INTO Blockset (ID, Length, FullHash) VALUES
                (1, 10, 'shared'), (2, 20, 'old'), (3, 5, 'meta');
             INSERT INTO BlocksetEntry (BlocksetID, \"Index\", BlockID) VALUES
                (1, 0, 1), (2, 0, 2), (3, 0, 3);
             INSERT INTO Metadataset (ID, BlocksetID) VALUES (1, 3);
             INSERT INTO File (ID, Path, BlocksetID, MetadataID) VALUES
                (1, '/shared', 1, -2), (2, '/old', 2, 1), (3, '/new', -100, -2);
             INSERT INTO Fileset (ID, Timestamp, VolumeID) VALUES (1, 100, 2), (2, 200, 3);
             INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES
                (1, 1, 0), (1, 2, 0), (2, 1, 0), (2, 3, 0);",
        )
        .unwrap();
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_drop_fileset_tombstones_only_its_blocks() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);

        let volumes = drop_filesets(conn, &[1]).unwrap();
        assert_eq!(volumes, vec![("f-1".to_string(), 10)]);

        assert_eq!(count(conn, "SELECT COUNT(*) FROM Fileset"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM File"), 2);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM Metadataset"), 0);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM Blockset"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM Block"), 1);
        // 'old' and its duplicate copy, and 'meta'
        assert_eq!(count(conn, "SELECT COUNT(*) FROM DeletedBlock"), 3);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM DuplicateBlock"), 0);
        assert_eq!(
            count(conn, "SELECT COUNT(*) FROM RemoteVolume WHERE State = 'Deleting'"),
            1
        );
    }

    #[test]
    fn test_drop_nothing() {
        let db = IndexDatabase::open_in_memory().unwrap();
        seed(db.connection());
        assert!(drop_filesets(db.connection(), &[]).unwrap().is_empty());
        assert!(drop_filesets(db.connection(), &[99]).unwrap().is_empty());
        assert_eq!(count(db.connection(), "SELECT COUNT(*) FROM Fileset"), 2);
    }

    #[test]
    fn test_purge_paths() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);

        assert_eq!(purge_paths(conn, 1, &["/nope".to_string()]).unwrap(), 0);
        assert_eq!(purge_paths(conn, 1, &["/old".to_string()]).unwrap(), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM FilesetEntry WHERE FilesetID = 1"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM Block WHERE Hash = 'old'"), 0);
    }

    #[test]
    fn test_purge_refuses_to_empty_fileset() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);

        let err = purge_paths(conn, 2, &["/shared".to_string(), "/new".to_string()]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PurgeRemovesAllFiles));
        // Rolled back
        assert_eq!(count(conn, "SELECT COUNT(*) FROM FilesetEntry WHERE FilesetID = 2"), 2);
    }
}
