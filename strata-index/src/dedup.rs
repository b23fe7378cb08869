//! Canonical insertion of blocks, blocksets, metadata and files during a
//! backup, with the membership caches as a fast path in front of the store.

use rusqlite::{params, Connection};
use tracing::{debug, trace};

use crate::config::IndexOptions;
use crate::database::IndexDatabase;
use crate::errors::{expect_one_row, IndexError, Result};
use crate::fileset;
use crate::membership::{CacheStats, Lookup, MembershipCache};
use crate::query::QueryBuilder;
use crate::schema::{EMPTY_METADATA_ID, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::transaction::TemporaryTransaction;
use crate::volume::{remote_volume_by_id, RemoteVolumeState};

type SizedKey = (String, i64);

/// The membership caches of one session, absent when caching is disabled
struct Caches {
    blocks: MembershipCache<SizedKey, i64>,
    blocksets: MembershipCache<SizedKey, i64>,
    metadatasets: MembershipCache<SizedKey, i64>,
    blocklist_hashes: MembershipCache<String>,
}

impl Caches {
    fn new(memory: u64) -> Self {
        Self {
            blocks: MembershipCache::new(memory / 2),
            blocksets: MembershipCache::new(memory / 4),
            metadatasets: MembershipCache::new(memory / 8),
            blocklist_hashes: MembershipCache::new(memory / 8),
        }
    }
}

/// One backup's writes against the index.
///
/// The session either owns its transaction (see [`BackupSession::begin`]) or
/// joins a caller's ([`BackupSession::with_transaction`]); in the latter case
/// [`BackupSession::commit`] leaves the outcome to the caller.
pub struct BackupSession<'a> {
    tx: TemporaryTransaction<'a>,
    options: IndexOptions,
    caches: Option<Caches>,
    fileset_id: Option<i64>,
}

impl<'a> BackupSession<'a> {
    pub fn begin(db: &'a mut IndexDatabase, options: &IndexOptions) -> Result<Self> {
        db.check_options(options)?;
        let tx = db.temporary_transaction()?;
        Self::start(tx, options)
    }

    pub fn with_transaction(conn: &'a Connection, options: &IndexOptions) -> Result<Self> {
        options.validate()?;
        Self::start(TemporaryTransaction::borrowed(conn), options)
    }

    fn start(tx: TemporaryTransaction<'a>, options: &IndexOptions) -> Result<Self> {
        let caches = if options.cache_memory == 0 {
            debug!("Membership cache disabled");
            None
        } else {
            Some(Caches::new(options.cache_memory))
        };

        let mut session = Self {
            tx,
            options: options.clone(),
            caches,
            fileset_id: None,
        };
        session.build_lookup_table()?;
        Ok(session)
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn is_owned(&self) -> bool {
        self.tx.is_owned()
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn commit(self) -> Result<()> {
        for (name, stats) in self.cache_stats() {
            debug!(
                "{} cache: {} entries, {}/{} bits, {} positive and {} negative misses",
                name,
                stats.entries,
                stats.bits_used,
                stats.bit_count,
                stats.positive_misses,
                stats.negative_misses
            );
        }
        self.tx.commit()
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()
    }

    /// Reseed the caches from the store.
    ///
    /// Only blocks on live volumes are cached, so a cache hit can always be
    /// trusted to mean "stored somewhere that still exists". Every other
    /// block and tombstone is marked in the miss filter, so a definite miss
    /// means the store has never seen the block. Writes to `Block` or
    /// `DeletedBlock` made outside the session need a rebuild.
    pub fn build_lookup_table(&mut self) -> Result<()> {
        let Some(caches) = self.caches.as_mut() else {
            return Ok(());
        };
        let conn: &Connection = &self.tx;

        caches.blocks.clear();
        caches.blocksets.clear();
        caches.metadatasets.clear();
        caches.blocklist_hashes.clear();

        let blocks = QueryBuilder::new(
            "SELECT Block.Hash, Block.Size, Block.ID FROM Block
             JOIN RemoteVolume ON RemoteVolume.ID = Block.VolumeID",
        )
        .and_where_in(
            "RemoteVolume.State",
            RemoteVolumeState::LIVE.iter().map(|s| s.as_str().to_string()),
        );
        for (hash, size, id) in blocks.query_map(conn, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })? {
            caches.blocks.insert((hash, size), id);
        }

        let mut stmt = conn.prepare(
            "SELECT Hash, Size FROM Block UNION SELECT Hash, Size FROM DeletedBlock",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            caches.blocks.mark(&row?);
        }

        let mut stmt = conn.prepare("SELECT FullHash, Length, ID FROM Blockset")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (hash, length, id) = row?;
            caches.blocksets.insert((hash, length), id);
        }

        let mut stmt = conn.prepare(
            "SELECT Blockset.FullHash, Blockset.Length, Metadataset.ID
             FROM Metadataset JOIN Blockset ON Blockset.ID = Metadataset.BlocksetID",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (hash, length, id) = row?;
            caches.metadatasets.insert((hash, length), id);
        }

        let mut stmt = conn.prepare("SELECT DISTINCT Hash FROM BlocklistHash")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            caches.blocklist_hashes.add(row?);
        }

        debug!(
            "Lookup tables built: {} blocks, {} blocksets",
            caches.blocks.stats().entries,
            caches.blocksets.stats().entries
        );
        Ok(())
    }

    pub fn cache_stats(&self) -> Vec<(&'static str, CacheStats)> {
        match &self.caches {
            None => Vec::new(),
            Some(c) => vec![
                ("block", c.blocks.stats()),
                ("blockset", c.blocksets.stats()),
                ("metadataset", c.metadatasets.stats()),
                ("blocklist", c.blocklist_hashes.stats()),
            ],
        }
    }

    /// Record that `volume_id` holds the block, returning whether the index
    /// changed because of it.
    ///
    /// A block whose current volume is no longer live is moved to
    /// `volume_id`; a tombstoned block whose volume still exists is brought
    /// back to that volume instead of being stored again.
    pub fn add_block(&mut self, hash: &str, size: i64, volume_id: i64) -> Result<bool> {
        let key = (hash.to_string(), size);
        let cached = match &self.caches {
            Some(c) => c.blocks.has_value(&key),
            None => Lookup::Uncertain,
        };
        if let Lookup::Found(_) = cached {
            return Ok(false);
        }

        // A definite miss is neither a block nor a tombstone
        let unseen = cached == Lookup::NotFound;

        let conn: &Connection = &self.tx;
        let existing = if unseen {
            None
        } else {
            match conn.query_row(
                "SELECT ID, VolumeID FROM Block WHERE Hash = ?1 AND Size = ?2",
                params![hash, size],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            ) {
                Ok(found) => Some(found),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(caches) = self.caches.as_mut() {
            if cached == Lookup::Uncertain {
                caches.blocks.record_miss(existing.is_some());
            }
        }

        let resurrected = match existing {
            None if !unseen => self.resurrect_block(hash, size)?,
            _ => None,
        };

        let (id, is_new) = match existing {
            None => match resurrected {
                Some(id) => (id, false),
                None => {
                    let changed = conn.execute(
                        "INSERT INTO Block (Hash, Size, VolumeID) VALUES (?1, ?2, ?3)",
                        params![hash, size, volume_id],
                    )?;
                    expect_one_row(changed, || format!("insert block {}", hash))?;
                    trace!("New block {} ({} bytes) in volume {}", hash, size, volume_id);
                    (conn.last_insert_rowid(), true)
                }
            },
            Some((id, current)) => {
                let live = remote_volume_by_id(conn, current)?
                    .map(|v| v.state.is_live())
                    .unwrap_or(false);
                if live {
                    (id, false)
                } else {
                    let changed = conn.execute(
                        "UPDATE Block SET VolumeID = ?1 WHERE ID = ?2",
                        params![volume_id, id],
                    )?;
                    expect_one_row(changed, || format!("repoint block {}", hash))?;
                    debug!(
                        "Block {} moved from lost volume {} to {}",
                        hash, current, volume_id
                    );
                    (id, true)
                }
            }
        };

        if let Some(caches) = self.caches.as_mut() {
            caches.blocks.insert(key, id);
        }
        Ok(is_new)
    }

    fn resurrect_block(&self, hash: &str, size: i64) -> Result<Option<i64>> {
        let conn: &Connection = &self.tx;
        let tombstone = QueryBuilder::new(
            "SELECT DeletedBlock.ID, DeletedBlock.VolumeID FROM DeletedBlock
             JOIN RemoteVolume ON RemoteVolume.ID = DeletedBlock.VolumeID",
        )
        .and_where("DeletedBlock.Hash = :hash")
        .bind(":hash", hash.to_string())
        .and_where("DeletedBlock.Size = :size")
        .bind(":size", size)
        .and_where("RemoteVolume.State NOT IN ('Deleting', 'Deleted')")
        .then("LIMIT 1")
        .query_map(conn, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let Some(&(deleted_id, volume_id)) = tombstone.first() else {
            return Ok(None);
        };

        let changed = conn.execute(
            "INSERT INTO Block (Hash, Size, VolumeID) VALUES (?1, ?2, ?3)",
            params![hash, size, volume_id],
        )?;
        expect_one_row(changed, || format!("restore block {}", hash))?;
        let id = conn.last_insert_rowid();

        let changed = conn.execute("DELETE FROM DeletedBlock WHERE ID = ?1", params![deleted_id])?;
        expect_one_row(changed, || format!("remove tombstone of block {}", hash))?;

        debug!("Block {} restored from deleted blocks in volume {}", hash, volume_id);
        Ok(Some(id))
    }

    /// ID of an indexed block, through the cache when it knows the answer
    pub fn find_block_id(&self, hash: &str, size: i64) -> Result<Option<i64>> {
        if let Some(caches) = &self.caches {
            match caches.blocks.has_value(&(hash.to_string(), size)) {
                Lookup::Found(id) => return Ok(Some(id)),
                Lookup::NotFound => return Ok(None),
                Lookup::Uncertain => {}
            }
        }
        let result = self.tx.query_row(
            "SELECT ID FROM Block WHERE Hash = ?1 AND Size = ?2",
            params![hash, size],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a blockset, returning whether it is new and its ID.
    ///
    /// Every block in `block_hashes` must already be indexed. Block sizes are
    /// implied by the blocksize: all full except the last.
    pub fn add_blockset(
        &mut self,
        full_hash: &str,
        size: i64,
        block_hashes: &[String],
        blocklist_hashes: &[String],
    ) -> Result<(bool, i64)> {
        let key = (full_hash.to_string(), size);
        if let Some(caches) = &self.caches {
            if let Lookup::Found(id) = caches.blocksets.has_value(&key) {
                return Ok((false, id));
            }
        }

        let conn: &Connection = &self.tx;
        let existing = match conn.query_row(
            "SELECT ID FROM Blockset WHERE Length = ?1 AND FullHash = ?2",
            params![size, full_hash],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(id) = existing {
            if let Some(caches) = self.caches.as_mut() {
                caches.blocksets.insert(key, id);
            }
            return Ok((false, id));
        }

        if size > 0 && block_hashes.is_empty() {
            return Err(IndexError::Consistency(format!(
                "blockset {} of {} bytes has no blocks",
                full_hash, size
            )));
        }

        // Resolve every block before writing so a failure leaves no rows
        let blocksize = self.options.blocksize as i64;
        let mut block_ids = Vec::with_capacity(block_hashes.len());
        let mut remaining = size;
        for hash in block_hashes {
            let block_size = remaining.min(blocksize);
            let block_id = self.find_block_id(hash, block_size)?.ok_or_else(|| {
                IndexError::Consistency(format!(
                    "block {} of {} bytes in blockset {} is not indexed",
                    hash, block_size, full_hash
                ))
            })?;
            block_ids.push(block_id);
            remaining -= blocksize;
        }

        let conn: &Connection = &self.tx;
        let changed = conn.execute(
            "INSERT INTO Blockset (Length, FullHash) VALUES (?1, ?2)",
            params![size, full_hash],
        )?;
        expect_one_row(changed, || format!("insert blockset {}", full_hash))?;
        let blockset_id = conn.last_insert_rowid();

        {
            let mut stmt = conn.prepare(
                "INSERT INTO BlocklistHash (BlocksetID, \"Index\", Hash) VALUES (?1, ?2, ?3)",
            )?;
            for (index, hash) in blocklist_hashes.iter().enumerate() {
                stmt.execute(params![blockset_id, index as i64, hash])?;
            }

            let mut stmt = conn.prepare(
                "INSERT INTO BlocksetEntry (BlocksetID, \"Index\", BlockID) VALUES (?1, ?2, ?3)",
            )?;
            for (index, block_id) in block_ids.iter().enumerate() {
                stmt.execute(params![blockset_id, index as i64, block_id])?;
            }
        }

        if let Some(caches) = self.caches.as_mut() {
            for hash in blocklist_hashes {
                caches.blocklist_hashes.add(hash.clone());
            }
            caches.blocksets.insert(key, blockset_id);
        }
        trace!(
            "New blockset {} ({} bytes, {} blocks)",
            full_hash,
            size,
            block_hashes.len()
        );
        Ok((true, blockset_id))
    }

    /// Record a metadata payload, stored as a single-block blockset whose
    /// block is the payload itself.
    ///
    /// Empty metadata is never materialized and maps to a fixed ID.
    pub fn add_metadataset(&mut self, hash: &str, size: i64) -> Result<(bool, i64)> {
        if size <= 0 {
            return Ok((false, EMPTY_METADATA_ID));
        }

        let key = (hash.to_string(), size);
        if let Some(caches) = &self.caches {
            if let Lookup::Found(id) = caches.metadatasets.has_value(&key) {
                return Ok((false, id));
            }
        }

        let (_, blockset_id) = self.add_blockset(hash, size, &[hash.to_string()], &[])?;

        let conn: &Connection = &self.tx;
        let existing = match conn.query_row(
            "SELECT ID FROM Metadataset WHERE BlocksetID = ?1 ORDER BY ID LIMIT 1",
            params![blockset_id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let (is_new, id) = match existing {
            Some(id) => (false, id),
            None => {
                let changed = conn.execute(
                    "INSERT INTO Metadataset (BlocksetID) VALUES (?1)",
                    params![blockset_id],
                )?;
                expect_one_row(changed, || format!("insert metadataset {}", hash))?;
                (true, conn.last_insert_rowid())
            }
        };

        if let Some(caches) = self.caches.as_mut() {
            caches.metadatasets.insert(key, id);
        }
        Ok((is_new, id))
    }

    /// Known blocklist page hash, through the key-only cache
    pub fn is_blocklist_hash_known(&mut self, hash: &str) -> Result<bool> {
        let key = hash.to_string();
        let cached = match &self.caches {
            Some(c) => c.blocklist_hashes.contains(&key),
            None => Lookup::Uncertain,
        };
        match cached {
            Lookup::Found(()) => return Ok(true),
            Lookup::NotFound => return Ok(false),
            Lookup::Uncertain => {}
        }

        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM BlocklistHash WHERE Hash = ?1",
            params![hash],
            |row| row.get(0),
        )?;
        if let Some(caches) = self.caches.as_mut() {
            caches.blocklist_hashes.record_miss(count > 0);
            if count > 0 {
                caches.blocklist_hashes.add(key);
            }
        }
        Ok(count > 0)
    }

    /// Move a block between volumes, as compaction does when repacking
    pub fn move_block_to_volume(
        &mut self,
        hash: &str,
        size: i64,
        from_volume: i64,
        to_volume: i64,
    ) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE Block SET VolumeID = ?1 WHERE Hash = ?2 AND Size = ?3 AND VolumeID = ?4",
            params![to_volume, hash, size, from_volume],
        )?;
        expect_one_row(changed, || {
            format!("move block {} from volume {} to {}", hash, from_volume, to_volume)
        })
    }

    /// Select the fileset that [`add_file`](Self::add_file) appends to
    pub fn set_fileset(&mut self, fileset_id: i64) {
        self.fileset_id = Some(fileset_id);
    }

    pub fn fileset_id(&self) -> Option<i64> {
        self.fileset_id
    }

    fn current_fileset(&self) -> Result<i64> {
        self.fileset_id.ok_or_else(|| {
            IndexError::Consistency("no fileset selected for this backup session".to_string())
        })
    }

    /// Create the fileset this session writes into
    pub fn create_fileset(
        &mut self,
        volume_id: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
        is_full_backup: bool,
    ) -> Result<i64> {
        let id = fileset::create_fileset(&self.tx, volume_id, timestamp, is_full_backup)?;
        self.fileset_id = Some(id);
        Ok(id)
    }

    /// Bind a path to content and metadata in the current fileset.
    ///
    /// An existing File row with the same triple is reused, so unchanged
    /// files share one row across filesets.
    pub fn add_file(
        &mut self,
        path: &str,
        blockset_id: i64,
        metadata_id: i64,
        scantime: i64,
    ) -> Result<i64> {
        let fileset_id = self.current_fileset()?;
        let conn: &Connection = &self.tx;

        let existing = match conn.query_row(
            "SELECT ID FROM File WHERE Path = ?1 AND BlocksetID = ?2 AND MetadataID = ?3
             ORDER BY ID LIMIT 1",
            params![path, blockset_id, metadata_id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

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

    pub fn add_directory_entry(&mut self, path: &str, metadata_id: i64, scantime: i64) -> Result<i64> {
        self.add_file(path, FOLDER_BLOCKSET_ID, metadata_id, scantime)
    }

    pub fn add_symlink_entry(&mut self, path: &str, metadata_id: i64, scantime: i64) -> Result<i64> {
        self.add_file(path, SYMLINK_BLOCKSET_ID, metadata_id, scantime)
    }

    /// Carry forward the previous fileset's entries, minus `deleted_paths`
    pub fn append_files_from_previous_set(&mut self, deleted_paths: &[String]) -> Result<usize> {
        let fileset_id = self.current_fileset()?;
        fileset::append_files_from_previous_set(&self.tx, fileset_id, deleted_paths)
    }

    /// Carry forward only the previous entries `exclude` does not reject.
    ///
    /// `exclude` sees each path with its content length (`None` for folders
    /// and symlinks).
    pub fn append_files_from_previous_set_with_predicate<F>(&mut self, exclude: F) -> Result<usize>
    where
        F: FnMut(&str, Option<i64>) -> bool,
    {
        let fileset_id = self.current_fileset()?;
        fileset::append_files_from_previous_set_with_predicate(&self.tx, fileset_id, exclude)
    }

    /// File count and total content size of the most recent fileset
    pub fn last_backup_file_count_and_size(&self) -> Result<(i64, i64)> {
        let conn: &Connection = &self.tx;
        let latest = match conn.query_row(
            "SELECT ID FROM Fileset ORDER BY Timestamp DESC, ID DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => id,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        Ok(conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(Blockset.Length), 0)
             FROM FilesetEntry
             JOIN File ON File.ID = FilesetEntry.FileID
             JOIN Blockset ON Blockset.ID = File.BlocksetID
             WHERE FilesetEntry.FilesetID = ?1",
            params![latest],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }
}
