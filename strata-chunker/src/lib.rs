pub mod chunker;
pub mod errors;
pub mod hash;

pub use chunker::{blocklist_pages, BlockRecord, Blockifier, BlocklistPage, BlocksetDigest};
pub use errors::{ChunkerError, Result};
pub use hash::{prefix_from_hex, BlockHash, HashAlgorithm, DIGEST_LEN};
