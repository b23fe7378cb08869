use std::io::Read;

use crate::errors::{ChunkerError, Result};
use crate::hash::{BlockHash, HashAlgorithm};

/// One fixed-size block of a blockset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: BlockHash,
    pub size: u64,
}

/// One page of packed block-hash bytes and its own hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistPage {
    pub hash: BlockHash,
    pub data: Vec<u8>,
}

impl BlocklistPage {
    /// Split the packed bytes back into the block hashes they hold
    pub fn hashes(&self, digest_len: usize) -> Result<Vec<BlockHash>> {
        if digest_len == 0 || self.data.len() % digest_len != 0 {
            return Err(ChunkerError::InvalidHash(format!(
                "blocklist page of {} bytes is not a multiple of {}",
                self.data.len(),
                digest_len
            )));
        }
        self.data
            .chunks(digest_len)
            .map(BlockHash::from_slice)
            .collect()
    }
}

/// Everything the index needs to record one blockset
#[derive(Debug, Clone)]
pub struct BlocksetDigest {
    pub length: u64,
    pub full_hash: BlockHash,
    pub blocks: Vec<BlockRecord>,
    /// Empty for blocksets of zero or one block
    pub blocklist_pages: Vec<BlocklistPage>,
}

impl BlocksetDigest {
    pub fn block_hashes_hex(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.hash.to_hex()).collect()
    }

    pub fn blocklist_hashes_hex(&self) -> Vec<String> {
        self.blocklist_pages.iter().map(|p| p.hash.to_hex()).collect()
    }
}

/// Splits content into fixed-size blocks.
///
/// Every block is `blocksize` bytes except the last, which holds the
/// remainder. Blocksets with more than one block also get blocklist pages:
/// the raw block hashes packed `blocksize / digest_len` to a page.
///
/// # Example
///
/// ```rust
/// use strata_chunker::{Blockifier, HashAlgorithm};
///
/// let blockifier = Blockifier::new(HashAlgorithm::Blake3, 64).unwrap();
/// let digest = blockifier.digest_bytes(&[7u8; 150]);
/// let sizes: Vec<u64> = digest.blocks.iter().map(|b| b.size).collect();
/// assert_eq!(sizes, vec![64, 64, 22]);
/// ```
#[derive(Debug, Clone)]
pub struct Blockifier {
    algorithm: HashAlgorithm,
    blocksize: usize,
}

impl Blockifier {
    pub fn new(algorithm: HashAlgorithm, blocksize: usize) -> Result<Self> {
        let digest_len = algorithm.digest_len();
        if blocksize == 0 {
            return Err(ChunkerError::InvalidConfig(
                "blocksize must be greater than zero".to_string(),
            ));
        }
        if blocksize < digest_len || blocksize % digest_len != 0 {
            return Err(ChunkerError::InvalidConfig(format!(
                "blocksize {} must be a multiple of the {} byte hash length",
                blocksize, digest_len
            )));
        }
        Ok(Self {
            algorithm,
            blocksize,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    /// Number of block hashes that fit on one blocklist page
    pub fn hashes_per_page(&self) -> usize {
        self.blocksize / self.algorithm.digest_len()
    }

    /// Digest an in-memory buffer
    pub fn digest_bytes(&self, data: &[u8]) -> BlocksetDigest {
        let blocks: Vec<BlockRecord> = data
            .chunks(self.blocksize)
            .map(|chunk| BlockRecord {
                hash: self.algorithm.digest(chunk),
                size: chunk.len() as u64,
            })
            .collect();

        self.finish(data.len() as u64, self.algorithm.digest(data), blocks)
    }

    /// Digest a reader block by block without holding the whole stream
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> Result<BlocksetDigest> {
        let mut full = self.algorithm.hasher();
        let mut blocks = Vec::new();
        let mut length = 0u64;
        let mut buffer = vec![0u8; self.blocksize];

        loop {
            let filled = read_full(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let block = &buffer[..filled];
            full.update(block);
            blocks.push(BlockRecord {
                hash: self.algorithm.digest(block),
                size: filled as u64,
            });
            length += filled as u64;
            if filled < self.blocksize {
                break;
            }
        }

        Ok(self.finish(length, full.finalize(), blocks))
    }

    fn finish(&self, length: u64, full_hash: BlockHash, blocks: Vec<BlockRecord>) -> BlocksetDigest {
        let blocklist_pages = if blocks.len() > 1 {
            let hashes: Vec<BlockHash> = blocks.iter().map(|b| b.hash).collect();
            blocklist_pages(self.algorithm, self.blocksize, &hashes)
        } else {
            Vec::new()
        };

        BlocksetDigest {
            length,
            full_hash,
            blocks,
            blocklist_pages,
        }
    }
}

/// Pack block hashes into pages of `blocksize` bytes and hash each page
pub fn blocklist_pages(
    algorithm: HashAlgorithm,
    blocksize: usize,
    hashes: &[BlockHash],
) -> Vec<BlocklistPage> {
    let per_page = (blocksize / algorithm.digest_len()).max(1);
    hashes
        .chunks(per_page)
        .map(|page| {
            let mut data = Vec::with_capacity(page.len() * algorithm.digest_len());
            for hash in page {
                data.extend_from_slice(hash.as_bytes());
            }
            BlocklistPage {
                hash: algorithm.digest(&data),
                data,
            }
        })
        .collect()
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
