//! Filesets: dated snapshots built from FilesetEntry rows.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{expect_one_row, ErrorCode, IndexError, Result};
use crate::query::QueryBuilder;
use crate::schema::{EMPTY_METADATA_ID, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::temp_table::TempTable;
use crate::transaction::TemporaryTransaction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fileset {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub volume_id: i64,
    pub is_full_backup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn from_blockset_id(blockset_id: i64) -> Self {
        match blockset_id {
            FOLDER_BLOCKSET_ID => EntryKind::Directory,
            SYMLINK_BLOCKSET_ID => EntryKind::Symlink,
            _ => EntryKind::File,
        }
    }
}

/// One file of a fileset with its content and metadata identities resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetFileEntry {
    pub file_id: i64,
    pub path: String,
    pub kind: EntryKind,
    pub blockset_id: i64,
    pub scantime: i64,
    /// Content length and hash, for regular files
    pub length: Option<i64>,
    pub full_hash: Option<String>,
    /// Hash of the metadata payload, absent for empty metadata
    pub metadata_hash: Option<String>,
}

/// Receiver of a fileset's materialized form.
///
/// Implemented by whatever writes the remote files-list volume.
pub trait FilesetWriter {
    fn add_file(
        &mut self,
        path: &str,
        full_hash: &str,
        length: i64,
        scantime: i64,
        metadata_hash: Option<&str>,
    ) -> Result<()>;

    fn add_directory(&mut self, path: &str, scantime: i64, metadata_hash: Option<&str>) -> Result<()>;

    fn add_symlink(&mut self, path: &str, scantime: i64, metadata_hash: Option<&str>) -> Result<()>;
}

fn to_datetime(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| IndexError::Serialization(format!("invalid fileset timestamp {}", seconds)))
}

pub fn create_fileset(
    conn: &Connection,
    volume_id: i64,
    timestamp: DateTime<Utc>,
    is_full_backup: bool,
) -> Result<i64> {
    let changed = conn.execute(
        "INSERT INTO Fileset (Timestamp, VolumeID, IsFullBackup) VALUES (?1, ?2, ?3)",
        params![timestamp.timestamp(), volume_id, is_full_backup],
    )?;
    expect_one_row(changed, || "insert fileset".to_string())?;
    let id = conn.last_insert_rowid();
    debug!("Created fileset {} at {}", id, timestamp);
    Ok(id)
}

/// Anchor a fileset to the files volume that materializes it
pub fn link_fileset_to_volume(conn: &Connection, fileset_id: i64, volume_id: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE Fileset SET VolumeID = ?1 WHERE ID = ?2",
        params![volume_id, fileset_id],
    )?;
    expect_one_row(changed, || format!("link fileset {} to volume {}", fileset_id, volume_id))
}

pub fn fileset(conn: &Connection, id: i64) -> Result<Option<Fileset>> {
    let result = conn.query_row(
        "SELECT ID, Timestamp, VolumeID, IsFullBackup FROM Fileset WHERE ID = ?1",
        params![id],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, bool>(3)?,
            ))
        },
    );
    match result {
        Ok((id, ts, volume_id, is_full_backup)) => Ok(Some(Fileset {
            id,
            timestamp: to_datetime(ts)?,
            volume_id,
            is_full_backup,
        })),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All filesets, newest first
pub fn filesets(conn: &Connection) -> Result<Vec<Fileset>> {
    let mut stmt = conn.prepare(
        "SELECT ID, Timestamp, VolumeID, IsFullBackup FROM Fileset
         ORDER BY Timestamp DESC, ID DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, bool>(3)?,
        ))
    })?;

    let mut result = Vec::new();
    for row in rows {
        let (id, ts, volume_id, is_full_backup) = row?;
        result.push(Fileset {
            id,
            timestamp: to_datetime(ts)?,
            volume_id,
            is_full_backup,
        });
    }
    Ok(result)
}

/// `(ID, Timestamp)` of every fileset, newest first
pub fn fileset_times(conn: &Connection) -> Result<Vec<(i64, DateTime<Utc>)>> {
    Ok(filesets(conn)?
        .into_iter()
        .map(|f| (f.id, f.timestamp))
        .collect())
}

/// The fileset immediately before `timestamp`, ignoring `exclude_id`.
///
/// Filesets are ordered by timestamp, then by ID, so one taken in the same
/// second as `exclude_id` but created earlier still counts as previous.
pub fn previous_fileset_id(
    conn: &Connection,
    timestamp: DateTime<Utc>,
    exclude_id: i64,
) -> Result<Option<i64>> {
    let result = conn.query_row(
        "SELECT ID FROM Fileset
         WHERE ID != ?2 AND (Timestamp < ?1 OR (Timestamp = ?1 AND ID < ?2))
         ORDER BY Timestamp DESC, ID DESC
         LIMIT 1",
        params![timestamp.timestamp(), exclude_id],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn previous_of(conn: &Connection, fileset_id: i64) -> Result<Option<i64>> {
    let current = fileset(conn, fileset_id)?.ok_or_else(|| {
        IndexError::Consistency(format!("fileset {} does not exist", fileset_id))
    })?;
    previous_fileset_id(conn, current.timestamp, fileset_id)
}

/// Copy the previous fileset's entries into `fileset_id` for every file it
/// does not list yet, then drop the entries of `deleted_paths`.
///
/// Returns the number of entries carried forward.
pub fn append_files_from_previous_set(
    conn: &Connection,
    fileset_id: i64,
    deleted_paths: &[String],
) -> Result<usize> {
    let Some(previous) = previous_of(conn, fileset_id)? else {
        debug!("No fileset before {}, nothing to carry forward", fileset_id);
        return Ok(0);
    };

    let tx = TemporaryTransaction::join(conn)?;
    let carried = tx.execute(
        "INSERT INTO FilesetEntry (FilesetID, FileID, Scantime)
         SELECT ?1, FileID, Scantime FROM FilesetEntry
         WHERE FilesetID = ?2
           AND FileID NOT IN (SELECT FileID FROM FilesetEntry WHERE FilesetID = ?1)",
        params![fileset_id, previous],
    )?;

    if !deleted_paths.is_empty() {
        let deleted = TempTable::create(conn, "DeletedPaths", "Path TEXT NOT NULL")?;
        {
            let mut stmt =
                conn.prepare(&format!("INSERT INTO {} (Path) VALUES (?1)", deleted.quoted()))?;
            for path in deleted_paths {
                stmt.execute(params![path])?;
            }
        }
        let removed = conn.execute(
            &format!(
                "DELETE FROM FilesetEntry
                 WHERE FilesetID = ?1
                   AND FileID IN (SELECT ID FROM File WHERE Path IN (SELECT Path FROM {}))",
                deleted.quoted()
            ),
            params![fileset_id],
        )?;
        debug!("Removed {} deleted paths from fileset {}", removed, fileset_id);
    }

    tx.commit()?;
    debug!(
        "Carried {} entries from fileset {} into {}",
        carried, previous, fileset_id
    );
    Ok(carried)
}

/// Carry forward the previous entries `exclude` does not reject.
///
/// `exclude` is called with each path and its content length (`None` for
/// folders and symlinks).
pub fn append_files_from_previous_set_with_predicate<F>(
    conn: &Connection,
    fileset_id: i64,
    mut exclude: F,
) -> Result<usize>
where
    F: FnMut(&str, Option<i64>) -> bool,
{
    let Some(previous) = previous_of(conn, fileset_id)? else {
        return Ok(0);
    };

    let candidates: Vec<(i64, i64, String, Option<i64>)> = {
        let mut stmt = conn.prepare(
            "SELECT FilesetEntry.FileID, FilesetEntry.Scantime, File.Path, Blockset.Length
             FROM FilesetEntry
             JOIN File ON File.ID = FilesetEntry.FileID
             LEFT JOIN Blockset ON Blockset.ID = File.BlocksetID
             WHERE FilesetEntry.FilesetID = ?1
               AND FilesetEntry.FileID NOT IN
                   (SELECT FileID FROM FilesetEntry WHERE FilesetID = ?2)",
        )?;
        let rows = stmt.query_map(params![previous, fileset_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let tx = TemporaryTransaction::join(conn)?;
    let mut carried = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES (?1, ?2, ?3)",
        )?;
        for (file_id, scantime, path, length) in candidates {
            if exclude(&path, length) {
                continue;
            }
            stmt.execute(params![fileset_id, file_id, scantime])?;
            carried += 1;
        }
    }
    tx.commit()?;
    Ok(carried)
}

/// Filesets selected by version index (0 is the newest) and/or taken at or
/// before `restore_time`.
///
/// When the filter matches nothing the newest filesets are returned instead,
/// with a warning; an index without filesets is an error.
pub fn fileset_ids(
    conn: &Connection,
    restore_time: Option<DateTime<Utc>>,
    versions: &[usize],
) -> Result<Vec<i64>> {
    let all = fileset_times(conn)?;
    if all.is_empty() {
        return Err(IndexError::user(
            ErrorCode::NoBackupAtDate,
            "No backups found in the index",
        ));
    }

    let mut query = QueryBuilder::new("SELECT ID FROM Fileset");
    if let Some(time) = restore_time {
        query = query
            .and_where("Timestamp <= :time")
            .bind(":time", time.timestamp());
    }
    if !versions.is_empty() {
        let ids: Vec<i64> = versions
            .iter()
            .filter_map(|&v| all.get(v).map(|(id, _)| *id))
            .collect();
        query = query.and_where_in("ID", ids);
    }
    let ids = query
        .then("ORDER BY Timestamp DESC, ID DESC")
        .query_map(conn, |row| row.get::<_, i64>(0))?;

    if ids.is_empty() {
        warn!(
            "No fileset matches restore time {:?} and versions {:?}, using the most recent",
            restore_time, versions
        );
        return Ok(all.into_iter().map(|(id, _)| id).collect());
    }
    Ok(ids)
}

/// The expanded file list of a fileset, ordered by path
pub fn fileset_entries(conn: &Connection, fileset_id: i64) -> Result<Vec<FilesetFileEntry>> {
    let mut stmt = conn.prepare(
        "SELECT File.ID, File.Path, File.BlocksetID, FilesetEntry.Scantime,
                Blockset.Length, Blockset.FullHash, MetaBlockset.FullHash, File.MetadataID
         FROM FilesetEntry
         JOIN File ON File.ID = FilesetEntry.FileID
         LEFT JOIN Blockset ON Blockset.ID = File.BlocksetID
         LEFT JOIN Metadataset ON Metadataset.ID = File.MetadataID
         LEFT JOIN Blockset AS MetaBlockset ON MetaBlockset.ID = Metadataset.BlocksetID
         WHERE FilesetEntry.FilesetID = ?1
         ORDER BY File.Path, File.ID",
    )?;
    let rows = stmt.query_map(params![fileset_id], |row| {
        let blockset_id: i64 = row.get(2)?;
        let metadata_id: i64 = row.get(7)?;
        let metadata_hash: Option<String> = row.get(6)?;
        Ok(FilesetFileEntry {
            file_id: row.get(0)?,
            path: row.get(1)?,
            kind: EntryKind::from_blockset_id(blockset_id),
            blockset_id,
            scantime: row.get(3)?,
            length: row.get(4)?,
            full_hash: row.get(5)?,
            metadata_hash: if metadata_id == EMPTY_METADATA_ID {
                None
            } else {
                metadata_hash
            },
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Hand a fileset's entries to `writer`, returning how many were written
pub fn write_fileset<W: FilesetWriter + ?Sized>(
    conn: &Connection,
    writer: &mut W,
    fileset_id: i64,
) -> Result<usize> {
    let entries = fileset_entries(conn, fileset_id)?;
    for entry in &entries {
        let metadata = entry.metadata_hash.as_deref();
        match entry.kind {
            EntryKind::Directory => writer.add_directory(&entry.path, entry.scantime, metadata)?,
            EntryKind::Symlink => writer.add_symlink(&entry.path, entry.scantime, metadata)?,
            EntryKind::File => match (&entry.full_hash, entry.length) {
                (Some(hash), Some(length)) => {
                    writer.add_file(&entry.path, hash, length, entry.scantime, metadata)?
                }
                _ => {
                    return Err(IndexError::Consistency(format!(
                        "file {} refers to missing blockset {}",
                        entry.path, entry.blockset_id
                    )))
                }
            },
        }
    }
    Ok(entries.len())
}
