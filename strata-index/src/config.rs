//! Options an index is created and operated with.

use serde::{Deserialize, Serialize};
use strata_chunker::{Blockifier, HashAlgorithm};

use crate::errors::{IndexError, Result};

const MIB: u64 = 1024 * 1024;

/// Thresholds for the compaction advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactOptions {
    /// Target size of a remote block volume in bytes
    pub volume_size: u64,
    /// Percentage of wasted bytes that makes a volume worth repacking
    pub threshold: u64,
    /// Volumes at or below this size count as small
    pub small_file_size: u64,
    /// More small volumes than this triggers a compact
    pub max_small_file_count: u64,
}

impl Default for CompactOptions {
    fn default() -> Self {
        let volume_size = 50 * MIB;
        Self {
            volume_size,
            threshold: 25,
            small_file_size: volume_size / 5,
            max_small_file_count: 20,
        }
    }
}

/// Configuration for an index database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Fixed block size in bytes
    pub blocksize: u64,
    pub hash_algorithm: HashAlgorithm,
    /// Memory ceiling for the membership cache; 0 disables it
    pub cache_memory: u64,
    pub compact: CompactOptions,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            blocksize: 100 * 1024,
            hash_algorithm: HashAlgorithm::Blake3,
            cache_memory: 64 * MIB,
            compact: CompactOptions::default(),
        }
    }
}

impl IndexOptions {
    pub fn validate(&self) -> Result<()> {
        let hash_size = self.hash_size();
        if self.blocksize == 0 {
            return Err(IndexError::InvalidConfig(
                "blocksize must be greater than zero".to_string(),
            ));
        }
        if self.blocksize < hash_size || self.blocksize % hash_size != 0 {
            return Err(IndexError::InvalidConfig(format!(
                "blocksize {} is not a multiple of the {} byte hash size",
                self.blocksize, hash_size
            )));
        }
        if self.compact.threshold > 100 {
            return Err(IndexError::InvalidConfig(format!(
                "compact threshold {} is not a percentage",
                self.compact.threshold
            )));
        }
        if self.compact.volume_size == 0 {
            return Err(IndexError::InvalidConfig(
                "volume size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Digest length of the configured algorithm
    pub fn hash_size(&self) -> u64 {
        self.hash_algorithm.digest_len() as u64
    }

    /// Block hashes per blocklist page
    pub fn hashes_per_blocklist(&self) -> u64 {
        self.blocksize / self.hash_size()
    }

    pub fn blockifier(&self) -> Result<Blockifier> {
        Ok(Blockifier::new(self.hash_algorithm, self.blocksize as usize)?)
    }
}
