//! Strata workspace root
//!
//! Re-exports the workspace crates so the end-to-end tests can drive a
//! backup, a verify and a recreate through one dependency.

pub use strata_chunker as chunker;
pub use strata_index as index;
