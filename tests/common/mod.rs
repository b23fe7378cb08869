//! A simulated remote store and the helpers to back up into it.

#![allow(dead_code)]

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use strata::chunker::{BlockHash, BlockRecord};
use strata::index::fileset::write_fileset;
use strata::index::volume::register_remote_volume;
use strata::index::{
    BackupSession, BlockVolumeReader, FilesetWriter, IndexError, IndexOptions, RemoteVolumeState,
    RemoteVolumeType, Result,
};

pub fn options() -> IndexOptions {
    IndexOptions {
        blocksize: 64,
        cache_memory: 1024 * 1024,
        ..IndexOptions::default()
    }
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

pub fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(37).wrapping_add((i * 11) as u8))
        .collect()
}

/// A block volume downloaded into memory
#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    pub blocks: HashMap<String, Vec<u8>>,
}

impl BlockVolumeReader for MemoryVolume {
    fn blocks(&mut self) -> Result<Vec<BlockRecord>> {
        let mut records = Vec::new();
        for (hash, data) in &self.blocks {
            records.push(BlockRecord {
                hash: BlockHash::from_hex(hash)?,
                size: data.len() as u64,
            });
        }
        Ok(records)
    }

    fn read_block(&mut self, hash: &str) -> Result<Vec<u8>> {
        self.blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| IndexError::DatabaseError(format!("block {} is not in the volume", hash)))
    }
}

/// One line of an uploaded file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListedEntry {
    File {
        path: String,
        full_hash: String,
        length: i64,
        scantime: i64,
        metadata_hash: Option<String>,
    },
    Directory {
        path: String,
        scantime: i64,
        metadata_hash: Option<String>,
    },
    Symlink {
        path: String,
        scantime: i64,
        metadata_hash: Option<String>,
    },
}

/// The uploaded form of one fileset
#[derive(Debug, Clone, Default)]
pub struct FileList {
    pub volume: String,
    pub timestamp: i64,
    pub is_full_backup: bool,
    pub entries: Vec<ListedEntry>,
}

impl FilesetWriter for FileList {
    fn add_file(
        &mut self,
        path: &str,
        full_hash: &str,
        length: i64,
        scantime: i64,
        metadata_hash: Option<&str>,
    ) -> Result<()> {
        self.entries.push(ListedEntry::File {
            path: path.to_string(),
            full_hash: full_hash.to_string(),
            length,
            scantime,
            metadata_hash: metadata_hash.map(str::to_string),
        });
        Ok(())
    }

    fn add_directory(&mut self, path: &str, scantime: i64, metadata_hash: Option<&str>) -> Result<()> {
        self.entries.push(ListedEntry::Directory {
            path: path.to_string(),
            scantime,
            metadata_hash: metadata_hash.map(str::to_string),
        });
        Ok(())
    }

    fn add_symlink(&mut self, path: &str, scantime: i64, metadata_hash: Option<&str>) -> Result<()> {
        self.entries.push(ListedEntry::Symlink {
            path: path.to_string(),
            scantime,
            metadata_hash: metadata_hash.map(str::to_string),
        });
        Ok(())
    }
}

/// Everything a backup uploaded, keyed the way a recreate finds it
#[derive(Debug, Default)]
pub struct RemoteStore {
    /// `(name, type, size)` in upload order
    pub catalog: Vec<(String, RemoteVolumeType, i64)>,
    pub volumes: HashMap<String, MemoryVolume>,
    pub filelists: Vec<FileList>,
    /// Blocklist hashes per blockset full hash, as file lists carry them
    pub blocklists: HashMap<String, Vec<String>>,
    /// Payload size per metadata hash
    pub metadata_sizes: HashMap<String, i64>,
}

impl RemoteStore {
    /// Register a volume in both the index and the store
    pub fn create_volume(&mut self, conn: &Connection, name: &str, kind: RemoteVolumeType) -> i64 {
        let size = 4096;
        self.catalog.push((name.to_string(), kind, size));
        if kind == RemoteVolumeType::Blocks {
            self.volumes.insert(name.to_string(), MemoryVolume::default());
        }
        register_remote_volume(conn, name, kind, RemoteVolumeState::Verified, size).unwrap()
    }

    /// Upload content into a block volume and index it, returning the
    /// blockset ID and full hash
    pub fn store(
        &mut self,
        session: &mut BackupSession<'_>,
        volume: (&str, i64),
        data: &[u8],
    ) -> (i64, String) {
        let (name, volume_id) = volume;
        let digest = session.options().blockifier().unwrap().digest_bytes(data);
        let blocksize = session.options().blocksize as usize;
        let target = self.volumes.get_mut(name).unwrap();

        for (chunk, block) in data.chunks(blocksize).zip(&digest.blocks) {
            if session
                .add_block(&block.hash.to_hex(), block.size as i64, volume_id)
                .unwrap()
            {
                target.blocks.insert(block.hash.to_hex(), chunk.to_vec());
            }
        }
        for page in &digest.blocklist_pages {
            if session
                .add_block(&page.hash.to_hex(), page.data.len() as i64, volume_id)
                .unwrap()
            {
                target.blocks.insert(page.hash.to_hex(), page.data.clone());
            }
        }

        let full_hash = digest.full_hash.to_hex();
        let (_, id) = session
            .add_blockset(
                &full_hash,
                digest.length as i64,
                &digest.block_hashes_hex(),
                &digest.blocklist_hashes_hex(),
            )
            .unwrap();
        self.blocklists
            .insert(full_hash.clone(), digest.blocklist_hashes_hex());
        (id, full_hash)
    }

    /// Upload a metadata payload, returning its metadataset ID
    pub fn store_metadata(
        &mut self,
        session: &mut BackupSession<'_>,
        volume: (&str, i64),
        data: &[u8],
    ) -> i64 {
        let (name, volume_id) = volume;
        let hash = session.options().hash_algorithm.digest(data).to_hex();
        if session.add_block(&hash, data.len() as i64, volume_id).unwrap() {
            self.volumes
                .get_mut(name)
                .unwrap()
                .blocks
                .insert(hash.clone(), data.to_vec());
        }
        let (_, id) = session.add_metadataset(&hash, data.len() as i64).unwrap();
        self.metadata_sizes.insert(hash, data.len() as i64);
        id
    }

    /// Upload the file list of a fileset
    pub fn upload_filelist(&mut self, conn: &Connection, fileset_id: i64, volume: &str, timestamp: i64, full: bool) {
        let mut list = FileList {
            volume: volume.to_string(),
            timestamp,
            is_full_backup: full,
            entries: Vec::new(),
        };
        write_fileset(conn, &mut list, fileset_id).unwrap();
        self.filelists.push(list);
    }
}

/// Paths with the content and metadata hashes they resolve to, by path
pub fn describe_fileset(conn: &Connection, fileset_id: i64) -> Vec<(String, Option<String>, Option<String>)> {
    strata::index::fileset::fileset_entries(conn, fileset_id)
        .unwrap()
        .into_iter()
        .map(|e| (e.path, e.full_hash, e.metadata_hash))
        .collect()
}
