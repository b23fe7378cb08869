//! Catalogue of remote archive volumes.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::IndexOptions;
use crate::errors::{expect_one_row, ErrorCode, IndexError, Result};
use crate::query::QueryBuilder;
use crate::temp_table::TempTable;
use crate::transaction::TemporaryTransaction;
use crate::verify::{verify_consistency, VerifyOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteVolumeType {
    Blocks,
    Index,
    Files,
}

impl RemoteVolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteVolumeType::Blocks => "Blocks",
            RemoteVolumeType::Index => "Index",
            RemoteVolumeType::Files => "Files",
        }
    }
}

impl fmt::Display for RemoteVolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteVolumeType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Blocks" => Ok(RemoteVolumeType::Blocks),
            "Index" => Ok(RemoteVolumeType::Index),
            "Files" => Ok(RemoteVolumeType::Files),
            other => Err(IndexError::Serialization(format!(
                "unknown remote volume type: {}",
                other
            ))),
        }
    }
}

/// Upload lifecycle of a remote volume.
///
/// `Temporary → Uploading → Uploaded → Verified` while alive;
/// `Deleting → Deleted` once it is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteVolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl RemoteVolumeState {
    pub const LIVE: [RemoteVolumeState; 4] = [
        RemoteVolumeState::Temporary,
        RemoteVolumeState::Uploading,
        RemoteVolumeState::Uploaded,
        RemoteVolumeState::Verified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteVolumeState::Temporary => "Temporary",
            RemoteVolumeState::Uploading => "Uploading",
            RemoteVolumeState::Uploaded => "Uploaded",
            RemoteVolumeState::Verified => "Verified",
            RemoteVolumeState::Deleting => "Deleting",
            RemoteVolumeState::Deleted => "Deleted",
        }
    }

    /// Blocks in a live volume can be trusted to exist remotely
    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

impl fmt::Display for RemoteVolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteVolumeState {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Temporary" => Ok(RemoteVolumeState::Temporary),
            "Uploading" => Ok(RemoteVolumeState::Uploading),
            "Uploaded" => Ok(RemoteVolumeState::Uploaded),
            "Verified" => Ok(RemoteVolumeState::Verified),
            "Deleting" => Ok(RemoteVolumeState::Deleting),
            "Deleted" => Ok(RemoteVolumeState::Deleted),
            other => Err(IndexError::Serialization(format!(
                "unknown remote volume state: {}",
                other
            ))),
        }
    }
}

/// `(Name, Hash, Size)` of a volume as the transfer layer knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolume {
    pub name: String,
    pub hash: Option<String>,
    pub size: i64,
}

/// A catalogued volume row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolumeEntry {
    pub id: i64,
    pub name: String,
    pub volume_type: RemoteVolumeType,
    pub state: RemoteVolumeState,
    pub size: i64,
    pub hash: Option<String>,
    pub verification_count: i64,
    pub delete_grace_time: i64,
}

impl RemoteVolumeEntry {
    pub fn as_remote_volume(&self) -> RemoteVolume {
        RemoteVolume {
            name: self.name.clone(),
            hash: self.hash.clone(),
            size: self.size,
        }
    }
}

const VOLUME_COLUMNS: &str =
    "ID, Name, Type, State, Size, Hash, VerificationCount, DeleteGraceTime";

fn volume_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, i64, Option<String>, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_entry(
    raw: (i64, String, String, String, i64, Option<String>, i64, i64),
) -> Result<RemoteVolumeEntry> {
    let (id, name, volume_type, state, size, hash, verification_count, delete_grace_time) = raw;
    Ok(RemoteVolumeEntry {
        id,
        name,
        volume_type: volume_type.parse()?,
        state: state.parse()?,
        size,
        hash,
        verification_count,
        delete_grace_time,
    })
}

/// Add a volume to the catalogue and return its ID
pub fn register_remote_volume(
    conn: &Connection,
    name: &str,
    volume_type: RemoteVolumeType,
    state: RemoteVolumeState,
    size: i64,
) -> Result<i64> {
    let id = conn.query_row(
        "INSERT INTO RemoteVolume (Name, Type, State, Size, VerificationCount, DeleteGraceTime)
         VALUES (?1, ?2, ?3, ?4, 0, 0)
         RETURNING ID",
        params![name, volume_type.as_str(), state.as_str(), size],
        |row| row.get(0),
    )?;
    debug!("Registered {} volume {} as {} (id {})", volume_type, name, state, id);
    Ok(id)
}

/// Record a state change, and optionally the final size and hash
pub fn update_remote_volume(
    conn: &Connection,
    name: &str,
    state: RemoteVolumeState,
    size: i64,
    hash: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE RemoteVolume SET State = ?1, Size = ?2, Hash = COALESCE(?3, Hash) WHERE Name = ?4",
        params![state.as_str(), size, hash, name],
    )?;
    if changed == 0 {
        return Err(IndexError::user(
            ErrorCode::UnknownRemoteVolume,
            format!("Remote volume {} is not in the catalogue", name),
        ));
    }
    expect_one_row(changed, || format!("update remote volume {}", name))
}

pub fn set_volume_state(conn: &Connection, id: i64, state: RemoteVolumeState) -> Result<()> {
    let changed = conn.execute(
        "UPDATE RemoteVolume SET State = ?1 WHERE ID = ?2",
        params![state.as_str(), id],
    )?;
    expect_one_row(changed, || format!("set state of volume {}", id))
}

pub fn remote_volume(conn: &Connection, name: &str) -> Result<Option<RemoteVolumeEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM RemoteVolume WHERE Name = ?1", VOLUME_COLUMNS),
            params![name],
            volume_from_row,
        )
        .optional()?;
    raw.map(into_entry).transpose()
}

pub fn remote_volume_by_id(conn: &Connection, id: i64) -> Result<Option<RemoteVolumeEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM RemoteVolume WHERE ID = ?1", VOLUME_COLUMNS),
            params![id],
            volume_from_row,
        )
        .optional()?;
    raw.map(into_entry).transpose()
}

pub fn remote_volume_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT ID FROM RemoteVolume WHERE Name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

/// All catalogued volumes ordered by ID
pub fn remote_volumes(conn: &Connection) -> Result<Vec<RemoteVolumeEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM RemoteVolume ORDER BY ID",
        VOLUME_COLUMNS
    ))?;
    let rows = stmt.query_map([], volume_from_row)?;
    rows.map(|raw| into_entry(raw?)).collect()
}

pub fn add_index_block_link(conn: &Connection, index_volume_id: i64, block_volume_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO IndexBlockLink (IndexVolumeID, BlockVolumeID) VALUES (?1, ?2)",
        params![index_volume_id, block_volume_id],
    )?;
    Ok(())
}

/// Forget the named volumes and everything that depended on them.
///
/// Blocksets with a block (or blocklist page) on a removed volume are gone,
/// and with them the files and metadata built on them. Filesets anchored to
/// a removed volume, or emptied by the cascade, are dropped and their files
/// volumes moved to `Deleting`.
pub fn remove_remote_volumes(
    conn: &Connection,
    names: &[String],
    options: &IndexOptions,
) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let tx = TemporaryTransaction::join(conn)?;

    let dangling: i64 = conn.query_row(
        "SELECT COUNT(*) FROM FilesetEntry WHERE FileID NOT IN (SELECT ID FROM File)",
        [],
        |row| row.get(0),
    )?;
    if dangling > 0 {
        return Err(IndexError::Consistency(format!(
            "refusing to remove remote volumes, {} fileset entries have no file",
            dangling
        )));
    }

    let volumes = TempTable::create(conn, "DelVolumeIds", "ID INTEGER PRIMARY KEY")?;
    QueryBuilder::new(format!(
        "INSERT OR IGNORE INTO {} SELECT ID FROM RemoteVolume",
        volumes.quoted()
    ))
    .and_where_in("Name", names.iter().cloned())
    .execute(conn)?;

    let vol_ids = format!("SELECT ID FROM {}", volumes.quoted());

    let blocksets = TempTable::create(conn, "DelBlocksetIds", "ID INTEGER PRIMARY KEY")?;
    conn.execute_batch(&format!(
        "INSERT OR IGNORE INTO {bs}
            SELECT DISTINCT BlocksetEntry.BlocksetID FROM BlocksetEntry, Block
            WHERE BlocksetEntry.BlockID = Block.ID AND Block.VolumeID IN ({vols})
            UNION
            SELECT DISTINCT BlocksetID FROM BlocklistHash
            WHERE Hash IN (SELECT Hash FROM Block WHERE VolumeID IN ({vols}));",
        bs = blocksets.quoted(),
        vols = vol_ids
    ))?;
    let bs_ids = format!("SELECT ID FROM {}", blocksets.quoted());

    // Files whose content or metadata went with the blocksets
    let files = TempTable::create(conn, "DelFileIds", "ID INTEGER, FilesetID INTEGER")?;
    conn.execute_batch(&format!(
        "INSERT INTO {files}
            SELECT File.ID, FilesetEntry.FilesetID
            FROM File LEFT JOIN FilesetEntry ON FilesetEntry.FileID = File.ID
            WHERE File.BlocksetID IN ({bs})
               OR File.MetadataID IN (SELECT ID FROM Metadataset WHERE BlocksetID IN ({bs}));",
        files = files.quoted(),
        bs = bs_ids
    ))?;

    let filesets = TempTable::create(conn, "DelFilesetIds", "ID INTEGER PRIMARY KEY")?;

    conn.execute_batch(&format!(
        "DELETE FROM FilesetEntry WHERE FileID IN (SELECT ID FROM {files});
        DELETE FROM File WHERE ID IN (SELECT ID FROM {files});
        DELETE FROM Metadataset WHERE BlocksetID IN ({bs});
        DELETE FROM Blockset WHERE ID IN ({bs});
        DELETE FROM BlocksetEntry WHERE BlocksetID IN ({bs});
        DELETE FROM BlocklistHash WHERE BlocksetID IN ({bs});
        DELETE FROM IndexBlockLink WHERE BlockVolumeID IN ({vols}) OR IndexVolumeID IN ({vols});
        DELETE FROM DuplicateBlock WHERE VolumeID IN ({vols})
            OR BlockID IN (SELECT ID FROM Block WHERE VolumeID IN ({vols}));
        DELETE FROM Block WHERE VolumeID IN ({vols});
        DELETE FROM DeletedBlock WHERE VolumeID IN ({vols});
        INSERT OR IGNORE INTO {fs} SELECT ID FROM Fileset WHERE VolumeID IN ({vols});
        INSERT OR IGNORE INTO {fs}
            SELECT ID FROM Fileset
            WHERE ID IN (SELECT FilesetID FROM {files} WHERE FilesetID IS NOT NULL)
              AND ID NOT IN (SELECT DISTINCT FilesetID FROM FilesetEntry);
        DELETE FROM FilesetEntry WHERE FilesetID IN (SELECT ID FROM {fs});",
        files = files.quoted(),
        bs = bs_ids,
        vols = vol_ids,
        fs = filesets.quoted()
    ))?;

    QueryBuilder::new("UPDATE RemoteVolume SET State = :deleting")
    .and_where(format!(
        "ID IN (SELECT VolumeID FROM Fileset WHERE ID IN (SELECT ID FROM {}))",
        filesets.quoted()
    ))
    .bind(":deleting", RemoteVolumeState::Deleting.as_str().to_string())
    .and_where_in(
        "State",
        RemoteVolumeState::LIVE.iter().map(|s| s.as_str().to_string()),
    )
    .execute(conn)?;

    conn.execute_batch(&format!(
        "DELETE FROM Fileset WHERE ID IN (SELECT ID FROM {fs});
         DELETE FROM RemoteVolume WHERE ID IN ({vols});",
        fs = filesets.quoted(),
        vols = vol_ids
    ))?;

    drop(filesets);
    drop(files);
    drop(blocksets);
    drop(volumes);

    info!("Removed {} remote volumes from the index", names.len());

    verify_consistency(&tx, &VerifyOptions::new(options).lax(true))?;
    tx.commit()
}
