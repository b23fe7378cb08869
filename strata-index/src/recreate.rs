//! Rebuilding the index from the contents of remote volumes.
//!
//! Files volumes give filesets, files and the blocklist hashes of every
//! blockset. Index and block volumes give the blocks, and the packed
//! blocklist pages that say which block sits at which position of a
//! blockset. Pages are staged in a temporary table and expanded into
//! `BlocksetEntry` rows as their blockset becomes known, so the expansion
//! can be repeated as more volumes are read.

use std::collections::HashSet;

use rusqlite::{named_params, params, Connection, OptionalExtension};
use strata_chunker::{BlockHash, BlockRecord, BlocklistPage};
use tracing::{debug, info, trace, warn};

use crate::config::IndexOptions;
use crate::database::IndexDatabase;
use crate::errors::{expect_one_row, IndexError, Result};
use crate::schema::{EMPTY_METADATA_ID, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID, UNASSIGNED_VOLUME_ID};
use crate::temp_table::TempTable;
use crate::transaction::TemporaryTransaction;
use crate::volume::{remote_volume_by_id, RemoteVolumeEntry, RemoteVolumeState, RemoteVolumeType};

/// Read access to one downloaded block volume
pub trait BlockVolumeReader {
    /// Every block the volume holds
    fn blocks(&mut self) -> Result<Vec<BlockRecord>>;

    /// Raw bytes of one block, looked up by its hex hash
    fn read_block(&mut self, hash: &str) -> Result<Vec<u8>>;
}

/// What reading one block volume changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeRestore {
    pub new_blocks: usize,
    pub changed_blocks: usize,
    pub blocklist_pages: usize,
    pub blockset_entries: usize,
}

/// Rows added by expanding the staged blocklist pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandedEntries {
    pub blocks: usize,
    pub entries: usize,
}

/// Missing blocklist pages: BlocklistHash rows whose first entry is absent
const MISSING_BLOCKLIST_PAGES: &str = "
    SELECT BlocklistHash.Hash FROM BlocklistHash
    LEFT OUTER JOIN BlocksetEntry
      ON BlocksetEntry.BlocksetID = BlocklistHash.BlocksetID
     AND BlocksetEntry.\"Index\" = BlocklistHash.\"Index\" * :hpb
    WHERE BlocksetEntry.BlocksetID IS NULL";

pub struct RecreateSession<'a> {
    tx: TemporaryTransaction<'a>,
    blocklist: TempTable<'a>,
    smalllist: TempTable<'a>,
    options: IndexOptions,
    processed_volumes: HashSet<i64>,
}

impl<'a> RecreateSession<'a> {
    pub fn begin(db: &'a IndexDatabase, options: &IndexOptions) -> Result<Self> {
        db.check_options(options)?;
        Self::new(db.connection(), options)
    }

    /// Run on `conn`, joining its transaction if one is open
    pub fn new(conn: &'a Connection, options: &IndexOptions) -> Result<Self> {
        options.validate()?;
        let tx = TemporaryTransaction::join(conn)?;

        let blocklist = TempTable::create(
            conn,
            "Blocklist",
            "BlocklistHash TEXT NOT NULL,
             BlockHash TEXT NOT NULL,
             \"Index\" INTEGER NOT NULL,
             PRIMARY KEY (BlocklistHash, \"Index\")",
        )?;
        let smalllist = TempTable::create(
            conn,
            "Smalllist",
            "FileHash TEXT NOT NULL,
             BlockHash TEXT NOT NULL,
             BlockSize INTEGER NOT NULL,
             UNIQUE (FileHash, BlockSize),
             UNIQUE (BlockHash, BlockSize)",
        )?;

        Ok(Self {
            tx,
            blocklist,
            smalllist,
            options: options.clone(),
            processed_volumes: HashSet::new(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn is_owned(&self) -> bool {
        self.tx.is_owned()
    }

    pub fn commit(self) -> Result<()> {
        let Self {
            tx,
            blocklist,
            smalllist,
            ..
        } = self;
        drop(blocklist);
        drop(smalllist);
        tx.commit()
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()
    }

    fn hpb(&self) -> i64 {
        self.options.hashes_per_blocklist() as i64
    }

    /// Find or create a blockset, recording at most `expected` blocklist
    /// hashes for a new one
    pub fn add_blockset(
        &mut self,
        full_hash: &str,
        size: i64,
        blocklist_hashes: &[String],
        expected: usize,
    ) -> Result<i64> {
        let conn: &Connection = &self.tx;
        let existing = conn
            .query_row(
                "SELECT ID FROM Blockset WHERE Length = ?1 AND FullHash = ?2",
                params![size, full_hash],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let changed = conn.execute(
            "INSERT INTO Blockset (Length, FullHash) VALUES (?1, ?2)",
            params![size, full_hash],
        )?;
        expect_one_row(changed, || format!("insert blockset {}", full_hash))?;
        let blockset_id = conn.last_insert_rowid();

        let mut found = 0usize;
        let mut stmt = conn.prepare(
            "INSERT INTO BlocklistHash (BlocksetID, \"Index\", Hash) VALUES (?1, ?2, ?3)",
        )?;
        for hash in blocklist_hashes.iter().filter(|h| !h.is_empty()) {
            if found < expected {
                stmt.execute(params![blockset_id, found as i64, hash])?;
            }
            found += 1;
        }

        if found != expected {
            warn!(
                "Mismatching number of blocklist hashes on blockset {}: expected {}, found {}",
                blockset_id, expected, found
            );
        }
        Ok(blockset_id)
    }

    /// Find or create the metadataset of a metadata blockset.
    ///
    /// Zero-length metadata maps to the fixed empty ID.
    pub fn add_metadataset(
        &mut self,
        hash: &str,
        size: i64,
        blocklist_hashes: &[String],
        expected: usize,
    ) -> Result<i64> {
        if size <= 0 {
            return Ok(EMPTY_METADATA_ID);
        }

        let existing = self
            .tx
            .query_row(
                "SELECT Metadataset.ID FROM Metadataset
                 JOIN Blockset ON Blockset.ID = Metadataset.BlocksetID
                 WHERE Blockset.FullHash = ?1 AND Blockset.Length = ?2
                 ORDER BY Metadataset.ID LIMIT 1",
                params![hash, size],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let blockset_id = self.add_blockset(hash, size, blocklist_hashes, expected)?;
        let changed = self.tx.execute(
            "INSERT INTO Metadataset (BlocksetID) VALUES (?1)",
            params![blockset_id],
        )?;
        expect_one_row(changed, || format!("insert metadataset {}", hash))?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Add a path to a fileset, reusing an identical File row
    pub fn add_file_entry(
        &mut self,
        fileset_id: i64,
        path: &str,
        scantime: i64,
        blockset_id: i64,
        metadata_id: i64,
    ) -> Result<i64> {
        let conn: &Connection = &self.tx;
        let existing = conn
            .query_row(
                "SELECT ID FROM File WHERE Path = ?1 AND BlocksetID = ?2 AND MetadataID = ?3
                 ORDER BY ID LIMIT 1",
                params![path, blockset_id, metadata_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        let file_id = match existing {
            Some(id) => id,
            None => {
                let changed = conn.execute(
                    "INSERT INTO File (Path, BlocksetID, MetadataID) VALUES (?1, ?2, ?3)",
                    params![path, blockset_id, metadata_id],
                )?;
                expect_one_row(changed, || format!("insert file {}", path))?;
                conn.last_insert_rowid()
            }
        };

        let changed = conn.execute(
            "INSERT INTO FilesetEntry (FilesetID, FileID, Scantime) VALUES (?1, ?2, ?3)",
            params![fileset_id, file_id, scantime],
        )?;
        expect_one_row(changed, || format!("add {} to fileset {}", path, fileset_id))?;
        Ok(file_id)
    }

    pub fn add_directory_entry(
        &mut self,
        fileset_id: i64,
        path: &str,
        scantime: i64,
        metadata_id: i64,
    ) -> Result<i64> {
        self.add_file_entry(fileset_id, path, scantime, FOLDER_BLOCKSET_ID, metadata_id)
    }

    pub fn add_symlink_entry(
        &mut self,
        fileset_id: i64,
        path: &str,
        scantime: i64,
        metadata_id: i64,
    ) -> Result<i64> {
        self.add_file_entry(fileset_id, path, scantime, SYMLINK_BLOCKSET_ID, metadata_id)
    }

    /// Record that `volume_id` holds a block.
    ///
    /// Returns `(changed, new)`: a block seen for the first time, or one that
    /// was known without a volume, is `new`. A block already placed in
    /// another volume gains a `DuplicateBlock` row and is not new.
    pub fn update_block(&mut self, hash: &str, size: i64, volume_id: i64) -> Result<(bool, bool)> {
        let conn: &Connection = &self.tx;
        let current = conn
            .query_row(
                "SELECT VolumeID FROM Block WHERE Hash = ?1 AND Size = ?2",
                params![hash, size],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        match current {
            Some(current) if current == volume_id => Ok((false, false)),
            None => {
                let changed = conn.execute(
                    "INSERT INTO Block (Hash, Size, VolumeID) VALUES (?1, ?2, ?3)",
                    params![hash, size, volume_id],
                )?;
                expect_one_row(changed, || format!("insert block {}", hash))?;
                Ok((true, true))
            }
            Some(UNASSIGNED_VOLUME_ID) => {
                let changed = conn.execute(
                    "UPDATE Block SET VolumeID = ?1 WHERE Hash = ?2 AND Size = ?3",
                    params![volume_id, hash, size],
                )?;
                expect_one_row(changed, || format!("place block {} of {} bytes", hash, size))?;
                Ok((true, true))
            }
            Some(_) => {
                conn.execute(
                    "INSERT OR IGNORE INTO DuplicateBlock (BlockID, VolumeID)
                     SELECT ID, ?3 FROM Block WHERE Hash = ?1 AND Size = ?2",
                    params![hash, size, volume_id],
                )?;
                Ok((true, false))
            }
        }
    }

    /// Note that a single-block blockset consists of exactly `block_hash`
    pub fn add_small_blockset_link(&mut self, file_hash: &str, block_hash: &str, size: i64) -> Result<()> {
        self.tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (FileHash, BlockHash, BlockSize) VALUES (?1, ?2, ?3)",
                self.smalllist.quoted()
            ),
            params![file_hash, block_hash, size],
        )?;
        Ok(())
    }

    /// Stage the block hashes of a blocklist page.
    ///
    /// Returns false if the page was already staged.
    pub fn add_temp_blocklist_hash(&mut self, page_hash: &str, hashes: &[String]) -> Result<bool> {
        let conn: &Connection = &self.tx;
        let known = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE BlocklistHash = ?1 LIMIT 1",
                    self.blocklist.quoted()
                ),
                params![page_hash],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if known {
            return Ok(false);
        }

        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (BlocklistHash, BlockHash, \"Index\") VALUES (?1, ?2, ?3)",
            self.blocklist.quoted()
        ))?;
        for (index, hash) in hashes.iter().enumerate() {
            stmt.execute(params![page_hash, hash, index as i64])?;
        }
        trace!("Staged blocklist page {} with {} hashes", page_hash, hashes.len());
        Ok(true)
    }

    /// Expand the staged pages into `Block` and `BlocksetEntry` rows.
    ///
    /// Blocks not yet seen in any volume are inserted unassigned. The entry
    /// at position `page * hashes_per_blocklist + offset` is only written if
    /// absent, so calling this again after more pages arrive is safe. With
    /// `hash_only` the single-block blocksets are left alone.
    pub fn add_block_and_blockset_entry_from_temp(&mut self, hash_only: bool) -> Result<ExpandedEntries> {
        let blocklist = self.blocklist.quoted();
        let smalllist = self.smalllist.quoted();

        let small_blocks = if hash_only {
            String::new()
        } else {
            format!(
                "UNION
                 SELECT TS.BlockHash, TS.BlockSize FROM {smalllist} TS
                 WHERE NOT EXISTS (
                     SELECT 1 FROM Block B WHERE B.Hash = TS.BlockHash AND B.Size = TS.BlockSize)"
            )
        };
        let blocks = self.tx.execute(
            &format!(
                "INSERT INTO Block (Hash, Size, VolumeID)
                 SELECT DISTINCT BlockHash, BlockSize, :unassigned FROM (
                     SELECT NB.BlockHash,
                            MIN(:blocksize, BS.Length - ((NB.\"Index\" + BH.\"Index\" * :hpb) * :blocksize)) AS BlockSize
                     FROM (
                         SELECT TBL.BlocklistHash, TBL.BlockHash, TBL.\"Index\" FROM {blocklist} TBL
                         LEFT OUTER JOIN Block B ON B.Hash = TBL.BlockHash
                         WHERE B.Hash IS NULL
                     ) NB
                     JOIN BlocklistHash BH ON BH.Hash = NB.BlocklistHash
                     JOIN Blockset BS ON BS.ID = BH.BlocksetID
                     {small_blocks}
                 )"
            ),
            named_params! {
                ":unassigned": UNASSIGNED_VOLUME_ID,
                ":blocksize": self.options.blocksize as i64,
                ":hpb": self.hpb(),
            },
        )?;

        let small_entries = if hash_only {
            String::new()
        } else {
            format!(
                "UNION
                 SELECT BS.ID, 0, BL.ID FROM {smalllist} TS
                 JOIN Blockset BS
                   ON BS.FullHash = TS.FileHash
                  AND BS.Length = TS.BlockSize
                  AND BS.Length <= :blocksize
                 JOIN Block BL ON BL.Hash = TS.BlockHash AND BL.Size = TS.BlockSize
                 LEFT OUTER JOIN BlocksetEntry BE ON BE.BlocksetID = BS.ID AND BE.\"Index\" = 0
                 WHERE BE.BlocksetID IS NULL"
            )
        };
        let entries = self.tx.execute(
            &format!(
                "INSERT INTO BlocksetEntry (BlocksetID, \"Index\", BlockID)
                 SELECT DISTINCT BH.BlocksetID, BH.\"Index\" * :hpb + TBL.\"Index\", BK.ID
                 FROM {blocklist} TBL
                 JOIN BlocklistHash BH ON BH.Hash = TBL.BlocklistHash
                 JOIN Blockset BS ON BS.ID = BH.BlocksetID
                 JOIN Block BK
                   ON BK.Hash = TBL.BlockHash
                  AND BK.Size = MIN(:blocksize, BS.Length - (BH.\"Index\" * :hpb + TBL.\"Index\") * :blocksize)
                 LEFT OUTER JOIN BlocksetEntry BE
                   ON BE.BlocksetID = BH.BlocksetID
                  AND BE.\"Index\" = BH.\"Index\" * :hpb + TBL.\"Index\"
                 WHERE BE.BlocksetID IS NULL
                 {small_entries}"
            ),
            named_params! {
                ":blocksize": self.options.blocksize as i64,
                ":hpb": self.hpb(),
            },
        )?;

        debug!("Expanded staged blocklists into {} blocks and {} entries", blocks, entries);
        Ok(ExpandedEntries { blocks, entries })
    }

    /// Expand everything staged so far, then list the blocklist pages still
    /// needed: those whose blockset has no entry where the page begins.
    pub fn find_missing_blocklist_hashes(&mut self) -> Result<Vec<String>> {
        self.add_block_and_blockset_entry_from_temp(false)?;

        let mut stmt = self.tx.prepare(&format!(
            "SELECT DISTINCT Hash FROM ({}) ORDER BY Hash",
            MISSING_BLOCKLIST_PAGES
        ))?;
        let hashes = stmt
            .query_map(named_params! { ":hpb": self.hpb() }, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        if !hashes.is_empty() {
            debug!("{} blocklist pages are still missing", hashes.len());
        }
        Ok(hashes)
    }

    /// Hashes of the blocklist pages stored in a volume
    pub fn blocklists_on_volume(&self, volume_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.tx.prepare(
            "SELECT DISTINCT BlocklistHash.Hash FROM BlocklistHash
             JOIN Block ON Block.Hash = BlocklistHash.Hash
             WHERE Block.VolumeID = ?1
             ORDER BY BlocklistHash.Hash",
        )?;
        let hashes = stmt
            .query_map(params![volume_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(hashes)
    }

    /// Block volumes to read on pass `pass` of the recovery loop.
    ///
    /// Pass 0 lists the volumes holding pages known to be missing and resets
    /// the set of processed volumes. Later passes stop early once nothing is
    /// missing, unless `force_block_use`; pass 1 lists block volumes no
    /// block points to yet, and pass 2 onwards every block volume. A volume
    /// is never handed out twice.
    pub fn missing_blocklist_volumes(
        &mut self,
        pass: usize,
        force_block_use: bool,
    ) -> Result<Vec<RemoteVolumeEntry>> {
        let hpb = self.hpb();
        let page_volumes = format!(
            "SELECT Block.VolumeID FROM Block
             JOIN ({}) AS Missing ON Missing.Hash = Block.Hash",
            MISSING_BLOCKLIST_PAGES
        );

        let ids: Vec<i64> = if pass == 0 {
            self.processed_volumes.clear();
            let mut stmt = self.tx.prepare(&format!(
                "SELECT DISTINCT ID FROM RemoteVolume WHERE ID IN ({}) ORDER BY ID",
                page_volumes
            ))?;
            let ids = stmt
                .query_map(named_params! { ":hpb": hpb }, |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        } else {
            let missing: i64 = self.tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM (
                         SELECT VolumeID FROM Block WHERE VolumeID < 0 AND Size > 0
                         UNION {})",
                    page_volumes
                ),
                named_params! { ":hpb": hpb },
                |row| row.get(0),
            )?;
            if missing == 0 && !force_block_use {
                debug!("Nothing is missing after pass {}", pass);
                return Ok(Vec::new());
            }

            let sql = if pass == 1 {
                "SELECT ID FROM RemoteVolume
                 WHERE Type = :type AND ID NOT IN (SELECT DISTINCT VolumeID FROM Block)
                 ORDER BY ID"
            } else {
                "SELECT ID FROM RemoteVolume WHERE Type = :type ORDER BY ID"
            };
            let mut stmt = self.tx.prepare(sql)?;
            let ids = stmt
                .query_map(
                    named_params! { ":type": RemoteVolumeType::Blocks.as_str() },
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };

        let mut volumes = Vec::new();
        for id in ids {
            if !self.processed_volumes.insert(id) {
                continue;
            }
            if let Some(volume) = remote_volume_by_id(&self.tx, id)? {
                volumes.push(volume);
            }
        }
        debug!("Pass {} selected {} block volumes", pass, volumes.len());
        Ok(volumes)
    }

    /// Place the blocks of a downloaded block volume and expand the
    /// blocklist pages it carries
    pub fn restore_block_volume<R: BlockVolumeReader + ?Sized>(
        &mut self,
        volume_id: i64,
        reader: &mut R,
    ) -> Result<VolumeRestore> {
        let mut restore = VolumeRestore::default();

        for block in reader.blocks()? {
            let (changed, new) = self.update_block(&block.hash.to_hex(), block.size as i64, volume_id)?;
            if new {
                restore.new_blocks += 1;
            } else if changed {
                restore.changed_blocks += 1;
            }
        }

        let algorithm = self.options.hash_algorithm;
        for page_hash in self.blocklists_on_volume(volume_id)? {
            let data = reader.read_block(&page_hash)?;
            let actual = algorithm.digest(&data).to_hex();
            if actual != page_hash {
                warn!(
                    "Blocklist page {} in volume {} hashes to {}, skipping it",
                    page_hash, volume_id, actual
                );
                continue;
            }

            let hashes = self.split_blocklist_page(&page_hash, data)?;
            if self.add_temp_blocklist_hash(&page_hash, &hashes)? {
                restore.blocklist_pages += 1;
            }
        }

        restore.blockset_entries = self.add_block_and_blockset_entry_from_temp(true)?.entries;
        info!(
            "Volume {}: {} new blocks, {} relocated, {} blocklist pages",
            volume_id, restore.new_blocks, restore.changed_blocks, restore.blocklist_pages
        );
        Ok(restore)
    }

    /// Move blocks off temporary block volumes onto verified copies and
    /// drop the temporary volumes nothing refers to anymore.
    ///
    /// Returns how many temporary block volumes remain.
    pub fn cleanup_missing_volumes(&mut self) -> Result<i64> {
        let conn: &Connection = &self.tx;
        let count_sql = "SELECT COUNT(*) FROM RemoteVolume WHERE Type = ?1 AND State = ?2";
        let state_params = [
            RemoteVolumeType::Blocks.as_str(),
            RemoteVolumeState::Temporary.as_str(),
        ];

        let before: i64 = conn.query_row(count_sql, state_params, |row| row.get(0))?;
        if before == 0 {
            return Ok(0);
        }

        {
            let swap = TempTable::create_as(
                conn,
                "SwapBlocks",
                "SELECT A.ID AS BlockID, A.VolumeID AS SourceVolumeID, B.VolumeID AS TargetVolumeID
                 FROM (
                     SELECT Block.ID, Block.VolumeID FROM Block
                     JOIN RemoteVolume ON RemoteVolume.ID = Block.VolumeID
                     WHERE RemoteVolume.State = :temporary
                 ) A
                 JOIN (
                     SELECT DuplicateBlock.BlockID, MIN(DuplicateBlock.VolumeID) AS VolumeID
                     FROM DuplicateBlock
                     JOIN RemoteVolume ON RemoteVolume.ID = DuplicateBlock.VolumeID
                     WHERE RemoteVolume.State = :verified
                     GROUP BY DuplicateBlock.BlockID
                 ) B ON B.BlockID = A.ID",
                named_params! {
                    ":temporary": RemoteVolumeState::Temporary.as_str(),
                    ":verified": RemoteVolumeState::Verified.as_str(),
                },
            )?;
            let swap_name = swap.quoted();

            conn.execute(
                &format!(
                    "UPDATE Block SET VolumeID = (
                         SELECT TargetVolumeID FROM {swap_name} WHERE {swap_name}.BlockID = Block.ID)
                     WHERE ID IN (SELECT BlockID FROM {swap_name})"
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "UPDATE DuplicateBlock SET VolumeID = (
                         SELECT SourceVolumeID FROM {swap_name}
                         WHERE {swap_name}.BlockID = DuplicateBlock.BlockID)
                     WHERE (BlockID, VolumeID) IN (SELECT BlockID, TargetVolumeID FROM {swap_name})"
                ),
                [],
            )?;
        }

        let unused = "SELECT ID FROM RemoteVolume
                      WHERE Type = ?1 AND State = ?2
                        AND ID NOT IN (SELECT DISTINCT VolumeID FROM Block)";
        conn.execute(
            &format!("DELETE FROM IndexBlockLink WHERE BlockVolumeID IN ({})", unused),
            state_params,
        )?;
        conn.execute(
            &format!("DELETE FROM DuplicateBlock WHERE VolumeID IN ({})", unused),
            state_params,
        )?;
        conn.execute(
            &format!("DELETE FROM RemoteVolume WHERE ID IN ({})", unused),
            state_params,
        )?;

        let after: i64 = conn.query_row(count_sql, state_params, |row| row.get(0))?;
        warn!(
            "Replaced blocks for {} missing volumes; there are now {} missing volumes",
            before, after
        );
        Ok(after)
    }

    /// Tombstone blocks that no blockset and no blocklist refers to.
    ///
    /// Run after the last expansion, otherwise blocks still waiting for their
    /// entries look unused.
    pub fn cleanup_deleted_blocks(&mut self) -> Result<usize> {
        let conn: &Connection = &self.tx;
        let unused = TempTable::create_as(
            conn,
            "DeletedBlocks",
            "SELECT ID, Hash, Size, VolumeID FROM Block
             WHERE ID NOT IN (SELECT BlockID FROM BlocksetEntry)
               AND Hash NOT IN (SELECT Hash FROM BlocklistHash)",
            [],
        )?;
        let name = unused.quoted();

        conn.execute(
            &format!(
                "INSERT INTO DeletedBlock (Hash, Size, VolumeID)
                 SELECT Hash, Size, VolumeID FROM {}",
                name
            ),
            [],
        )?;
        let removed = conn.execute(
            &format!("DELETE FROM Block WHERE ID IN (SELECT ID FROM {})", name),
            [],
        )?;
        if removed > 0 {
            info!("Moved {} unreferenced blocks to the deleted blocks", removed);
        }
        Ok(removed)
    }

    /// Parse a packed blocklist page into hex block hashes
    pub fn split_blocklist_page(&self, page_hash: &str, data: Vec<u8>) -> Result<Vec<String>> {
        let algorithm = self.options.hash_algorithm;
        let page = BlocklistPage {
            hash: BlockHash::from_hex(page_hash)?,
            data,
        };
        let hashes = page.hashes(algorithm.digest_len()).map_err(|e| {
            IndexError::InvalidHash(format!("blocklist page {}: {}", page_hash, e))
        })?;
        Ok(hashes.iter().map(|h| h.to_hex()).collect())
    }
}
