//! Structural consistency checks over the whole index.
//!
//! Each check turns a class of silent corruption into a tagged user-facing
//! error naming a bounded sample of the offending items.

use rusqlite::{named_params, Connection, ToSql};
use tracing::{debug, info};

use crate::config::IndexOptions;
use crate::errors::{format_examples, ErrorCode, IndexError, Result, MAX_EXAMPLES};
use crate::schema::{EMPTY_METADATA_ID, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    pub hashes_per_blocklist: u64,
    /// Skip the checks tying filesets to remote volumes
    pub lax: bool,
    /// Also rebuild each fileset's file list and compare its size
    pub verify_filelists: bool,
}

impl VerifyOptions {
    pub fn new(options: &IndexOptions) -> Self {
        Self {
            hashes_per_blocklist: options.hashes_per_blocklist(),
            lax: false,
            verify_filelists: false,
        }
    }

    pub fn lax(mut self, lax: bool) -> Self {
        self.lax = lax;
        self
    }

    pub fn verify_filelists(mut self, verify: bool) -> Self {
        self.verify_filelists = verify;
        self
    }
}

/// Total number of rows a `FROM ... WHERE ...` selects, plus the first few
/// values of `column`
fn count_and_sample(
    conn: &Connection,
    column: &str,
    from: &str,
    params: &[(&str, &dyn ToSql)],
) -> Result<(i64, Vec<String>)> {
    let total: i64 = conn.query_row(&format!("SELECT COUNT(*) {}", from), params, |row| {
        row.get(0)
    })?;
    if total == 0 {
        return Ok((0, Vec::new()));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT CAST({} AS TEXT) {} LIMIT {}",
        column, from, MAX_EXAMPLES
    ))?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    Ok((total, rows.collect::<rusqlite::Result<Vec<_>>>()?))
}

fn fail_if_any(
    (total, sample): (i64, Vec<String>),
    code: ErrorCode,
    describe: impl FnOnce(&str) -> String,
) -> Result<()> {
    if total == 0 {
        return Ok(());
    }
    let listed = format_examples(&sample, total as usize);
    Err(IndexError::user(code, describe(&listed)))
}

/// Blocksets whose declared length differs from the sum of their blocks
const LENGTH_MISMATCH: &str = r#"
    FROM Blockset
    LEFT JOIN (
        SELECT BlocksetEntry.BlocksetID AS BlocksetID, SUM(Block.Size) AS Actual
        FROM BlocksetEntry JOIN Block ON Block.ID = BlocksetEntry.BlockID
        GROUP BY BlocksetEntry.BlocksetID
    ) AS Sums ON Sums.BlocksetID = Blockset.ID
    WHERE Blockset.ID IN (SELECT DISTINCT BlocksetID FROM BlocksetEntry)
      AND Blockset.Length != COALESCE(Sums.Actual, 0)
"#;

const DUPLICATE_BLOCKLIST_HASHES: &str = r#"
    FROM (
        SELECT BlocksetID, "Index" FROM BlocklistHash
        GROUP BY BlocksetID, "Index" HAVING COUNT(*) > 1
    )
"#;

const WRONG_BLOCKLIST_COUNT: &str = r#"
    FROM (
        SELECT BlocksetID, COUNT(*) AS BlockCount FROM BlocksetEntry GROUP BY BlocksetID
    ) AS Blocks
    LEFT JOIN (
        SELECT BlocksetID, COUNT(*) AS HashCount FROM BlocklistHash GROUP BY BlocksetID
    ) AS Hashes ON Hashes.BlocksetID = Blocks.BlocksetID
    WHERE Blocks.BlockCount > 1
      AND (Blocks.BlockCount + :hpb - 1) / :hpb != COALESCE(Hashes.HashCount, 0)
"#;

const EMPTY_BLOCKSETS: &str = r#"
    FROM Blockset
    WHERE Length > 0 AND ID NOT IN (SELECT DISTINCT BlocksetID FROM BlocksetEntry)
"#;

/// Verify the structural invariants of the index.
///
/// Checks run in a fixed order and the first violated one is reported.
pub fn verify_consistency(conn: &Connection, options: &VerifyOptions) -> Result<()> {
    debug!("Verifying index consistency (lax: {})", options.lax);

    let mismatched = count_and_sample(conn, "Blockset.ID", LENGTH_MISMATCH, &[])?;
    if mismatched.0 > 0 {
        // Report the files built on those blocksets when there are any
        let files = count_and_sample(
            conn,
            "Path",
            &format!(
                "FROM File WHERE BlocksetID IN (SELECT Blockset.ID {})",
                LENGTH_MISMATCH
            ),
            &[],
        )?;
        let report = if files.0 > 0 { files } else { mismatched };
        return fail_if_any(report, ErrorCode::BlocksetLengthMismatch, |items| {
            format!(
                "Found inconsistency in the following files while validating the index: {}. Run repair to fix it.",
                items
            )
        });
    }

    fail_if_any(
        count_and_sample(conn, "BlocksetID", DUPLICATE_BLOCKLIST_HASHES, &[])?,
        ErrorCode::BlocklistHashCountMismatch,
        |items| {
            format!(
                "Found duplicate blocklist hashes in blocksets {}. Run repair to fix it.",
                items
            )
        },
    )?;

    let hpb = options.hashes_per_blocklist as i64;
    fail_if_any(
        count_and_sample(
            conn,
            "Blocks.BlocksetID",
            WRONG_BLOCKLIST_COUNT,
            named_params! { ":hpb": hpb },
        )?,
        ErrorCode::MissingBlocklistHashes,
        |items| {
            format!(
                "Blocksets {} do not have the expected number of blocklist hashes. Run repair to fix it.",
                items
            )
        },
    )?;

    fail_if_any(
        count_and_sample(conn, "ID", EMPTY_BLOCKSETS, &[])?,
        ErrorCode::EmptyBlockset,
        |items| format!("Found non-empty blocksets with no blocks: {}", items),
    )?;

    fail_if_any(
        count_and_sample(
            conn,
            "Path",
            "FROM File
             WHERE (BlocksetID NOT IN (:folder, :symlink)
                    AND BlocksetID NOT IN (SELECT ID FROM Blockset))
                OR (MetadataID != :empty
                    AND MetadataID NOT IN (SELECT ID FROM Metadataset))",
            named_params! {
                ":folder": FOLDER_BLOCKSET_ID,
                ":symlink": SYMLINK_BLOCKSET_ID,
                ":empty": EMPTY_METADATA_ID,
            },
        )?,
        ErrorCode::MissingBlockset,
        |items| format!("Files refer to content that is not in the index: {}", items),
    )?;

    if !options.lax {
        fail_if_any(
            count_and_sample(
                conn,
                "ID",
                "FROM Fileset WHERE VolumeID NOT IN
                    (SELECT ID FROM RemoteVolume WHERE State != 'Deleted')",
                &[],
            )?,
            ErrorCode::MissingFilesetVolume,
            |items| format!("Filesets {} have no remote files volume", items),
        )?;

        fail_if_any(
            count_and_sample(
                conn,
                "Name",
                "FROM RemoteVolume
                 WHERE Type = 'Files' AND State NOT IN ('Deleting', 'Deleted')
                   AND ID NOT IN (SELECT VolumeID FROM Fileset)",
                &[],
            )?,
            ErrorCode::FilesVolumeWithoutFileset,
            |items| format!("Files volumes without a fileset: {}", items),
        )?;
    }

    fail_if_any(
        count_and_sample(
            conn,
            "FilesetID || ':' || FileID",
            "FROM FilesetEntry WHERE FileID NOT IN (SELECT ID FROM File)",
            &[],
        )?,
        ErrorCode::MissingFileEntries,
        |items| format!("Fileset entries refer to missing files: {}", items),
    )?;

    if options.verify_filelists {
        verify_filelists(conn)?;
    }

    info!("Index consistency verified");
    Ok(())
}

/// Compare the number of distinct paths each fileset lists with the number
/// of entries it stores.
///
/// A path only counts when its content and metadata resolve, so duplicate
/// paths and dangling blocksets both show up as a shortfall.
fn verify_filelists(conn: &Connection) -> Result<()> {
    let filesets: Vec<(i64, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT Fileset.ID, COUNT(FilesetEntry.FileID) FROM Fileset
             LEFT JOIN FilesetEntry ON FilesetEntry.FilesetID = Fileset.ID
             GROUP BY Fileset.ID ORDER BY Fileset.ID",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut listed = conn.prepare(
        "SELECT COUNT(*) FROM (
            SELECT File.Path FROM FilesetEntry
            JOIN File ON File.ID = FilesetEntry.FileID
            JOIN Blockset ON Blockset.ID = File.BlocksetID
            WHERE FilesetEntry.FilesetID = :fileset
              AND (File.MetadataID = :empty OR File.MetadataID IN
                   (SELECT Metadataset.ID FROM Metadataset
                    JOIN Blockset ON Blockset.ID = Metadataset.BlocksetID))
            UNION
            SELECT File.Path FROM FilesetEntry
            JOIN File ON File.ID = FilesetEntry.FileID
            WHERE FilesetEntry.FilesetID = :fileset
              AND File.BlocksetID IN (:folder, :symlink)
              AND (File.MetadataID = :empty OR File.MetadataID IN
                   (SELECT Metadataset.ID FROM Metadataset
                    JOIN Blockset ON Blockset.ID = Metadataset.BlocksetID))
        )",
    )?;

    let mut differing = Vec::new();
    for (id, stored) in filesets {
        let expanded: i64 = listed.query_row(
            named_params! {
                ":fileset": id,
                ":empty": EMPTY_METADATA_ID,
                ":folder": FOLDER_BLOCKSET_ID,
                ":symlink": SYMLINK_BLOCKSET_ID,
            },
            |row| row.get(0),
        )?;
        if expanded != stored {
            differing.push(format!("{} ({} listed, {} stored)", id, expanded, stored));
        }
    }

    if differing.is_empty() {
        return Ok(());
    }
    let total = differing.len();
    Err(IndexError::user(
        ErrorCode::FilesetDifferences,
        format!(
            "File lists differ from fileset entries in filesets {}",
            format_examples(&differing, total)
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::IndexDatabase;

    fn options() -> VerifyOptions {
        VerifyOptions::new(&IndexOptions {
            blocksize: 64,
            ..Default::default()
        })
    }

    /// Two blocks of a 96 byte blockset, with one blocklist page
    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO RemoteVolume (ID, Name, Type, State) VALUES
                (1, 'b-1', 'Blocks', 'Verified'),
                (2, 'f-1', 'Files', 'Verified');
             INSERT INTO Block (ID, Hash, Size, VolumeID) VALUES
                (1, 'h1', 64, 1), (2, 'h2', 32, 1), (3, 'page', 64, 1);
             INSERT INTO Blockset (ID, Length, FullHash) VALUES (1, 96, 'full');
             INSERT INTO BlocksetEntry (BlocksetID, \"Index\", BlockID) VALUES (1, 0, 1), (1, 1, 2);
             INSERT INTO BlocklistHash (BlocksetID, \"Index\", Hash) VALUES (1, 0, 'page');
             INSERT INTO File (ID, Path, BlocksetID, MetadataID) VALUES
                (1, '/f', 1, -2), (2, '/d/', -100, -2);
             INSERT INTO Fileset (ID, Timestamp, VolumeID) VALUES (1, 100, 2);
             INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES (1, 1, 0), (1, 2, 0);",
        )
        .unwrap();
    }

    fn code_of(conn: &Connection, options: &VerifyOptions) -> Option<ErrorCode> {
        verify_consistency(conn, options).err().and_then(|e| e.code())
    }

    #[test]
    fn test_consistent_index_passes() {
        let db = IndexDatabase::open_in_memory().unwrap();
        seed(db.connection());
        verify_consistency(db.connection(), &options().verify_filelists(true)).unwrap();
    }

    #[test]
    fn test_duplicate_path_in_fileset_differs() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);
        conn.execute_batch(
            "INSERT INTO File (ID, Path, BlocksetID, MetadataID) VALUES (3, '/d/', -200, -2);
             INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES (1, 3, 0);",
        )
        .unwrap();

        verify_consistency(conn, &options()).unwrap();
        let err = verify_consistency(conn, &options().verify_filelists(true)).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FilesetDifferences));
        assert!(err.to_string().contains("1 (2 listed, 3 stored)"));
    }

    #[test]
    fn test_unresolved_metadata_differs() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);
        conn.execute_batch(
            "INSERT INTO Metadataset (ID, BlocksetID) VALUES (5, 99);
             UPDATE File SET MetadataID = 5 WHERE ID = 2;",
        )
        .unwrap();

        assert_eq!(
            code_of(conn, &options().verify_filelists(true)),
            Some(ErrorCode::FilesetDifferences)
        );
    }

    #[test]
    fn test_length_mismatch_names_files() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);
        conn.execute("UPDATE Blockset SET Length = 100 WHERE ID = 1", [])
            .unwrap();

        let err = verify_consistency(conn, &options()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BlocksetLengthMismatch));
        assert!(err.to_string().contains("/f"));
    }

    #[test]
    fn test_blocklist_hash_problems() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);

        conn.execute(
            "INSERT INTO BlocklistHash (BlocksetID, \"Index\", Hash) VALUES (1, 0, 'page')",
            [],
        )
        .unwrap();
        assert_eq!(
            code_of(conn, &options()),
            Some(ErrorCode::BlocklistHashCountMismatch)
        );

        conn.execute("DELETE FROM BlocklistHash", []).unwrap();
        assert_eq!(
            code_of(conn, &options()),
            Some(ErrorCode::MissingBlocklistHashes)
        );
    }

    #[test]
    fn test_empty_and_missing_blocksets() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);

        conn.execute("INSERT INTO Blockset (ID, Length, FullHash) VALUES (2, 5, 'x')", [])
            .unwrap();
        assert_eq!(code_of(conn, &options()), Some(ErrorCode::EmptyBlockset));
        conn.execute("DELETE FROM Blockset WHERE ID = 2", []).unwrap();

        conn.execute(
            "INSERT INTO File (ID, Path, BlocksetID, MetadataID) VALUES (3, '/lost', 9, -2)",
            [],
        )
        .unwrap();
        let err = verify_consistency(conn, &options()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingBlockset));
        assert!(err.to_string().contains("/lost"));
    }

    #[test]
    fn test_volume_checks_skipped_when_lax() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);
        conn.execute("UPDATE RemoteVolume SET State = 'Deleted' WHERE ID = 2", [])
            .unwrap();

        assert_eq!(
            code_of(conn, &options()),
            Some(ErrorCode::MissingFilesetVolume)
        );
        verify_consistency(conn, &options().lax(true)).unwrap();

        conn.execute_batch(
            "UPDATE RemoteVolume SET State = 'Verified' WHERE ID = 2;
             INSERT INTO RemoteVolume (ID, Name, Type, State) VALUES (3, 'f-orphan', 'Files', 'Uploaded');",
        )
        .unwrap();
        let err = verify_consistency(conn, &options()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FilesVolumeWithoutFileset));
        assert!(err.to_string().contains("f-orphan"));
    }

    #[test]
    fn test_dangling_fileset_entry() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        seed(conn);
        conn.execute(
            "INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES (1, 42, 0)",
            [],
        )
        .unwrap();
        assert_eq!(
            code_of(conn, &options()),
            Some(ErrorCode::MissingFileEntries)
        );
    }

    #[test]
    fn test_sample_is_bounded() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let conn = db.connection();
        for i in 0..8 {
            conn.execute(
                "INSERT INTO File (Path, BlocksetID, MetadataID) VALUES (?1, 500, -2)",
                [format!("/missing/{}", i)],
            )
            .unwrap();
        }
        let err = verify_consistency(conn, &options()).unwrap_err();
        assert!(err.to_string().contains("... and 3 more"));
    }
}
