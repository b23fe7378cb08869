//! Repairs for the corruption classes the verifier detects.
//!
//! Every routine detects, rewrites inside one transaction, then re-runs its
//! own detection. If violations remain the transaction is rolled back and a
//! [`ErrorCode::RepairFailed`] error is returned. Running a routine on a
//! healthy index does nothing, so all of them are safe to repeat.

use rusqlite::{params, Connection};
use strata_chunker::{blocklist_pages, BlockHash};
use tracing::{debug, info, warn};

use crate::config::IndexOptions;
use crate::errors::{expect_one_row, ErrorCode, IndexError, Result};
use crate::fileset::{fileset, Fileset};
use crate::grouped::Grouped;
use crate::temp_table::TempTable;
use crate::transaction::TemporaryTransaction;
use crate::verify::{verify_consistency, VerifyOptions};
use crate::volume::{remote_volume_by_id, RemoteVolumeEntry};

fn scalar(conn: &Connection, sql: &str) -> Result<i64> {
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

fn metadata_duplicates(conn: &Connection) -> Result<i64> {
    Ok(scalar(conn, "SELECT COUNT(*) FROM Metadataset")?
        - scalar(conn, "SELECT COUNT(DISTINCT BlocksetID) FROM Metadataset")?)
}

fn file_duplicates(conn: &Connection) -> Result<i64> {
    scalar(
        conn,
        "SELECT COUNT(*) FROM (
            SELECT Path FROM File GROUP BY Path, BlocksetID, MetadataID HAVING COUNT(*) > 1)",
    )
}

fn blocklist_duplicates(conn: &Connection) -> Result<i64> {
    Ok(scalar(conn, "SELECT COUNT(*) FROM BlocklistHash")?
        - scalar(
            conn,
            "SELECT COUNT(*) FROM (SELECT DISTINCT BlocksetID, \"Index\" FROM BlocklistHash)",
        )?)
}

/// Fold File rows sharing `(Path, BlocksetID, MetadataID)` into the lowest ID
fn merge_duplicate_files(conn: &Connection) -> Result<usize> {
    let map = TempTable::create_as(
        conn,
        "FileMap",
        "SELECT File.ID AS DupID, Canon.ID AS CanonID FROM File
         JOIN (SELECT MIN(ID) AS ID, Path, BlocksetID, MetadataID FROM File
               GROUP BY Path, BlocksetID, MetadataID HAVING COUNT(*) > 1) AS Canon
           ON Canon.Path = File.Path
          AND Canon.BlocksetID = File.BlocksetID
          AND Canon.MetadataID = File.MetadataID
         WHERE File.ID != Canon.ID",
        [],
    )?;

    // A fileset listing both copies keeps one entry: the update is skipped
    // for the conflicting row, which the delete then removes
    conn.execute_batch(&format!(
        "UPDATE OR IGNORE FilesetEntry
            SET FileID = (SELECT CanonID FROM {m} WHERE DupID = FilesetEntry.FileID)
            WHERE FileID IN (SELECT DupID FROM {m});
         DELETE FROM FilesetEntry WHERE FileID IN (SELECT DupID FROM {m});
         DELETE FROM File WHERE ID IN (SELECT DupID FROM {m});",
        m = map.quoted()
    ))?;

    Ok(map.count()? as usize)
}

/// Collapse Metadataset rows that share a blockset
pub fn fix_duplicate_metahash(conn: &Connection) -> Result<()> {
    let duplicates = metadata_duplicates(conn)?;
    if duplicates == 0 {
        debug!("No duplicate metadata hashes");
        return Ok(());
    }
    warn!("Found {} duplicate metadata hashes, repairing", duplicates);

    let tx = TemporaryTransaction::join(conn)?;
    {
        let map = TempTable::create_as(
            &tx,
            "MetadataMap",
            "SELECT Metadataset.ID AS DupID, Canon.ID AS CanonID FROM Metadataset
             JOIN (SELECT MIN(ID) AS ID, BlocksetID FROM Metadataset GROUP BY BlocksetID) AS Canon
               ON Canon.BlocksetID = Metadataset.BlocksetID
             WHERE Metadataset.ID != Canon.ID",
            [],
        )?;
        tx.execute_batch(&format!(
            "UPDATE File
                SET MetadataID = (SELECT CanonID FROM {m} WHERE DupID = File.MetadataID)
                WHERE MetadataID IN (SELECT DupID FROM {m});
             DELETE FROM Metadataset WHERE ID IN (SELECT DupID FROM {m});",
            m = map.quoted()
        ))?;
    }

    // Repointing can make File rows identical
    let merged = merge_duplicate_files(&tx)?;
    debug!("Merged {} file rows after metadata repair", merged);

    if metadata_duplicates(&tx)? != 0 {
        return Err(IndexError::user(
            ErrorCode::RepairFailed,
            "Repair failed, there are still duplicate metadatahashes!",
        ));
    }
    tx.commit()?;
    info!("Duplicate metadata hashes repaired");
    Ok(())
}

/// Collapse File rows that share path, content and metadata
pub fn fix_duplicate_file_entries(conn: &Connection) -> Result<()> {
    let duplicates = file_duplicates(conn)?;
    if duplicates == 0 {
        debug!("No duplicate file entries");
        return Ok(());
    }
    warn!("Found {} duplicate file entries, repairing", duplicates);

    let tx = TemporaryTransaction::join(conn)?;
    merge_duplicate_files(&tx)?;
    if file_duplicates(&tx)? != 0 {
        return Err(IndexError::user(
            ErrorCode::RepairFailed,
            "Repair failed, there are still duplicate file entries!",
        ));
    }
    tx.commit()?;
    info!("Duplicate file entries repaired");
    Ok(())
}

/// Keep one BlocklistHash row per `(BlocksetID, Index)`
pub fn fix_duplicate_blocklist_hashes(conn: &Connection, options: &IndexOptions) -> Result<()> {
    let duplicates = blocklist_duplicates(conn)?;
    if duplicates == 0 {
        debug!("No duplicate blocklist hashes");
        return Ok(());
    }
    warn!("Found {} duplicate blocklist hashes, repairing", duplicates);

    let tx = TemporaryTransaction::join(conn)?;
    tx.execute(
        "DELETE FROM BlocklistHash WHERE rowid NOT IN (
            SELECT MIN(rowid) FROM BlocklistHash GROUP BY BlocksetID, \"Index\")",
        [],
    )?;
    if blocklist_duplicates(&tx)? != 0 {
        return Err(IndexError::user(
            ErrorCode::RepairFailed,
            "Repair failed, there are still duplicate blocklist hashes!",
        ));
    }

    verify_consistency(&tx, &VerifyOptions::new(options).lax(true))?;
    tx.commit()?;
    info!("Duplicate blocklist hashes repaired");
    Ok(())
}

fn blocksets_missing_blocklists(conn: &Connection, hashes_per_blocklist: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT Blocks.BlocksetID FROM (
            SELECT BlocksetID, COUNT(*) AS BlockCount FROM BlocksetEntry GROUP BY BlocksetID
         ) AS Blocks
         LEFT JOIN (
            SELECT BlocksetID, COUNT(*) AS HashCount FROM BlocklistHash GROUP BY BlocksetID
         ) AS Hashes ON Hashes.BlocksetID = Blocks.BlocksetID
         WHERE Blocks.BlockCount > 1
           AND (Blocks.BlockCount + ?1 - 1) / ?1 != COALESCE(Hashes.HashCount, 0)
         ORDER BY Blocks.BlocksetID",
    )?;
    let rows = stmt.query_map(params![hashes_per_blocklist], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
}

/// Make sure a block with `hash` and `size` is indexed, bringing it back
/// from the tombstones if needed
fn ensure_block(conn: &Connection, hash: &str, size: i64) -> Result<()> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM Block WHERE Hash = ?1 AND Size = ?2",
        params![hash, size],
        |row| row.get(0),
    )?;
    if present > 0 {
        return Ok(());
    }

    let tombstone = conn.query_row(
        "SELECT ID, VolumeID FROM DeletedBlock WHERE Hash = ?1 AND Size = ?2 LIMIT 1",
        params![hash, size],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    );
    let (deleted_id, volume_id) = match tombstone {
        Ok(found) => found,
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            return Err(IndexError::user(
                ErrorCode::RepairFailed,
                format!("Blocklist page {} is not stored in any volume", hash),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let changed = conn.execute(
        "INSERT INTO Block (Hash, Size, VolumeID) VALUES (?1, ?2, ?3)",
        params![hash, size, volume_id],
    )?;
    expect_one_row(changed, || format!("restore blocklist block {}", hash))?;
    let changed = conn.execute("DELETE FROM DeletedBlock WHERE ID = ?1", params![deleted_id])?;
    expect_one_row(changed, || format!("remove tombstone of {}", hash))?;
    debug!("Restored blocklist block {} from volume {}", hash, volume_id);
    Ok(())
}

/// Recompute the blocklist pages of blocksets that lack some
pub fn fix_missing_blocklist_hashes(conn: &Connection, options: &IndexOptions) -> Result<()> {
    let hpb = options.hashes_per_blocklist() as i64;
    let broken = blocksets_missing_blocklists(conn, hpb)?;
    if broken.is_empty() {
        debug!("No blocksets with missing blocklist hashes");
        return Ok(());
    }
    warn!(
        "Found {} blocksets with missing blocklist hashes, repairing",
        broken.len()
    );

    let tx = TemporaryTransaction::join(conn)?;
    for blockset_id in &broken {
        let hashes: Vec<BlockHash> = {
            let mut stmt = tx.prepare(
                "SELECT Block.Hash FROM BlocksetEntry
                 JOIN Block ON Block.ID = BlocksetEntry.BlockID
                 WHERE BlocksetEntry.BlocksetID = ?1
                 ORDER BY BlocksetEntry.\"Index\"",
            )?;
            let rows = stmt.query_map(params![blockset_id], |row| row.get::<_, String>(0))?;
            let mut hashes = Vec::new();
            for hex in rows {
                hashes.push(BlockHash::from_hex(&hex?)?);
            }
            hashes
        };

        let pages = blocklist_pages(
            options.hash_algorithm,
            options.blocksize as usize,
            &hashes,
        );

        tx.execute(
            "DELETE FROM BlocklistHash WHERE BlocksetID = ?1",
            params![blockset_id],
        )?;
        for (index, page) in pages.iter().enumerate() {
            let hash = page.hash.to_hex();
            ensure_block(&tx, &hash, page.data.len() as i64)?;
            tx.execute(
                "INSERT INTO BlocklistHash (BlocksetID, \"Index\", Hash) VALUES (?1, ?2, ?3)",
                params![blockset_id, index as i64, hash],
            )?;
        }
        debug!("Rebuilt {} blocklist hashes for blockset {}", pages.len(), blockset_id);
    }

    if !blocksets_missing_blocklists(&tx, hpb)?.is_empty() {
        return Err(IndexError::user(
            ErrorCode::RepairFailed,
            "Repair failed, there are still blocksets with missing blocklist hashes!",
        ));
    }
    tx.commit()?;
    info!("Missing blocklist hashes repaired");
    Ok(())
}

/// Run every structural repair, then verify the result
pub fn repair_index(conn: &Connection, options: &IndexOptions) -> Result<()> {
    let tx = TemporaryTransaction::join(conn)?;
    fix_duplicate_metahash(&tx)?;
    fix_duplicate_file_entries(&tx)?;
    fix_duplicate_blocklist_hashes(&tx, options)?;
    fix_missing_blocklist_hashes(&tx, options)?;
    verify_consistency(&tx, &VerifyOptions::new(options).lax(true))?;
    tx.commit()
}

/// The fileset materialized by the named files volume
pub fn fileset_id_from_remote_name(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let result = conn.query_row(
        "SELECT Fileset.ID FROM Fileset
         JOIN RemoteVolume ON RemoteVolume.ID = Fileset.VolumeID
         WHERE RemoteVolume.Name = ?1",
        params![name],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Block volumes described by the named index volume
pub fn block_volumes_from_index_name(conn: &Connection, name: &str) -> Result<Vec<RemoteVolumeEntry>> {
    let ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT IndexBlockLink.BlockVolumeID FROM IndexBlockLink
             JOIN RemoteVolume ON RemoteVolume.ID = IndexBlockLink.IndexVolumeID
             WHERE RemoteVolume.Name = ?1
             ORDER BY IndexBlockLink.BlockVolumeID",
        )?;
        let rows = stmt.query_map(params![name], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut volumes = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(volume) = remote_volume_by_id(conn, id)? {
            volumes.push(volume);
        }
    }
    Ok(volumes)
}

/// One place a missing block's bytes can be read back from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSource {
    pub path: String,
    pub offset: i64,
}

struct SourceRow {
    hash: String,
    size: i64,
    path: String,
    offset: i64,
}

/// Blocks of a lost volume, and what is known about recovering them.
///
/// Backed by a temporary table that lives as long as the value.
pub struct MissingBlockList<'c> {
    conn: &'c Connection,
    table: TempTable<'c>,
    volume_name: String,
}

impl<'c> MissingBlockList<'c> {
    pub fn new(conn: &'c Connection, volume_name: &str) -> Result<Self> {
        let table = TempTable::create(
            conn,
            "MissingBlocks",
            "Hash TEXT NOT NULL, Size INTEGER NOT NULL, Restored INTEGER NOT NULL DEFAULT 0",
        )?;
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX \"{}-HashSize\" ON {} (Hash, Size)",
            table.name(),
            table.quoted()
        ))?;
        let added = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (Hash, Size, Restored)
                 SELECT Block.Hash, Block.Size, 0 FROM Block
                 JOIN RemoteVolume ON RemoteVolume.ID = Block.VolumeID
                 WHERE RemoteVolume.Name = ?1",
                table.quoted()
            ),
            params![volume_name],
        )?;
        debug!("Tracking {} blocks of volume {}", added, volume_name);

        Ok(Self {
            conn,
            table,
            volume_name: volume_name.to_string(),
        })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// Mark a block as recovered; `false` if it is not one of the missing
    pub fn set_block_restored(&self, hash: &str, size: i64) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET Restored = 1 WHERE Hash = ?1 AND Size = ?2",
                self.table.quoted()
            ),
            params![hash, size],
        )?;
        Ok(changed == 1)
    }

    /// Walk the unrestored blocks that local files still contain.
    ///
    /// `visit` is called once per block with the files and offsets holding
    /// it, streamed from a single query.
    pub fn source_files_with_blocks<F>(&self, blocksize: u64, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, i64, &mut dyn Iterator<Item = Result<BlockSource>>) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT Block.Hash, Block.Size, File.Path, BlocksetEntry.\"Index\" * ?1
             FROM {t}
             JOIN Block ON Block.Hash = {t}.Hash AND Block.Size = {t}.Size
             JOIN BlocksetEntry ON BlocksetEntry.BlockID = Block.ID
             JOIN File ON File.BlocksetID = BlocksetEntry.BlocksetID
             WHERE {t}.Restored = 0
             ORDER BY Block.Hash, Block.Size, File.Path, BlocksetEntry.\"Index\"",
            t = self.table.quoted()
        ))?;
        let rows = stmt.query_map(params![blocksize as i64], |row| {
            Ok(SourceRow {
                hash: row.get(0)?,
                size: row.get(1)?,
                path: row.get(2)?,
                offset: row.get(3)?,
            })
        })?;

        let mut grouped = Grouped::new(rows, |row: &SourceRow| (row.hash.clone(), row.size));
        while let Some(group) = grouped.next_group() {
            let group = group?;
            let (hash, size) = group.key().clone();
            let mut sources = group.map(|row| {
                row.map(|r| BlockSource {
                    path: r.path,
                    offset: r.offset,
                })
                .map_err(IndexError::from)
            });
            visit(&hash, size, &mut sources)?;
        }
        Ok(())
    }

    /// `(Hash, Size)` of every block not yet restored
    pub fn missing_blocks(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT Hash, Size FROM {} WHERE Restored = 0 ORDER BY Hash, Size",
            self.table.quoted()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Filesets that cannot be fully restored while blocks are missing
    pub fn filesets_using_missing_blocks(&self) -> Result<Vec<Fileset>> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT DISTINCT FilesetEntry.FilesetID FROM {t}
                 JOIN Block ON Block.Hash = {t}.Hash AND Block.Size = {t}.Size
                 JOIN BlocksetEntry ON BlocksetEntry.BlockID = Block.ID
                 JOIN File ON File.BlocksetID = BlocksetEntry.BlocksetID
                    OR File.MetadataID IN
                       (SELECT ID FROM Metadataset WHERE BlocksetID = BlocksetEntry.BlocksetID)
                 JOIN FilesetEntry ON FilesetEntry.FileID = File.ID
                 WHERE {t}.Restored = 0
                 ORDER BY FilesetEntry.FilesetID",
                t = self.table.quoted()
            ))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(set) = fileset(self.conn, id)? {
                result.push(set);
            }
        }
        Ok(result)
    }

    /// Names of other volumes holding copies of missing blocks
    pub fn missing_block_sources(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT RemoteVolume.Name FROM {t}
             JOIN Block ON Block.Hash = {t}.Hash AND Block.Size = {t}.Size
             JOIN DuplicateBlock ON DuplicateBlock.BlockID = Block.ID
             JOIN RemoteVolume ON RemoteVolume.ID = DuplicateBlock.VolumeID
             WHERE {t}.Restored = 0 AND RemoteVolume.Name != ?1
             ORDER BY RemoteVolume.Name",
            t = self.table.quoted()
        ))?;
        let rows = stmt.query_map(params![self.volume_name], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
