use std::fmt;

use thiserror::Error;

/// Most offending items a user-facing message lists before summarising
pub const MAX_EXAMPLES: usize = 5;

/// Render up to [`MAX_EXAMPLES`] items, then "... and N more".
pub fn format_examples<S: AsRef<str>>(items: &[S], total: usize) -> String {
    let shown: Vec<&str> = items.iter().take(MAX_EXAMPLES).map(|s| s.as_ref()).collect();
    let mut text = shown.join(", ");
    let listed = items.len().min(MAX_EXAMPLES);
    if total > listed {
        text.push_str(&format!(" ... and {} more", total - listed));
    }
    text
}

/// Stable tags for user-facing errors, for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BlocksetLengthMismatch,
    BlocklistHashCountMismatch,
    MissingBlocklistHashes,
    EmptyBlockset,
    MissingBlockset,
    MissingFilesetVolume,
    FilesVolumeWithoutFileset,
    MissingFileEntries,
    FilesetDifferences,
    RepairFailed,
    NoBackupAtDate,
    PurgeRemovesAllFiles,
    UnknownRemoteVolume,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BlocksetLengthMismatch => "BlocksetLengthMismatch",
            ErrorCode::BlocklistHashCountMismatch => "BlocklistHashCountMismatch",
            ErrorCode::MissingBlocklistHashes => "MissingBlocklistHashes",
            ErrorCode::EmptyBlockset => "EmptyBlockset",
            ErrorCode::MissingBlockset => "MissingBlockset",
            ErrorCode::MissingFilesetVolume => "MissingFilesetVolume",
            ErrorCode::FilesVolumeWithoutFileset => "FilesVolumeWithoutFileset",
            ErrorCode::MissingFileEntries => "MissingFileEntries",
            ErrorCode::FilesetDifferences => "FilesetDifferences",
            ErrorCode::RepairFailed => "RepairFailed",
            ErrorCode::NoBackupAtDate => "NoBackupAtDate",
            ErrorCode::PurgeRemovesAllFiles => "PurgeRemovesAllFiles",
            ErrorCode::UnknownRemoteVolume => "UnknownRemoteVolume",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The index is corrupt; the enclosing operation must stop
    #[error("Internal consistency failure: {0}")]
    Consistency(String),

    #[error("{message}")]
    UserInformation { code: ErrorCode, message: String },
}

impl IndexError {
    pub fn user(code: ErrorCode, message: impl Into<String>) -> Self {
        IndexError::UserInformation {
            code,
            message: message.into(),
        }
    }

    /// Tag of a user-facing error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            IndexError::UserInformation { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<strata_chunker::ChunkerError> for IndexError {
    fn from(e: strata_chunker::ChunkerError) -> Self {
        match e {
            strata_chunker::ChunkerError::Io(io) => IndexError::Io(io),
            strata_chunker::ChunkerError::InvalidHash(msg) => IndexError::InvalidHash(msg),
            other => IndexError::InvalidConfig(other.to_string()),
        }
    }
}

/// Fail with [`IndexError::Consistency`] unless exactly one row changed
pub(crate) fn expect_one_row(affected: usize, what: impl FnOnce() -> String) -> Result<()> {
    if affected != 1 {
        return Err(IndexError::Consistency(format!(
            "{}: expected 1 row, affected {}",
            what(),
            affected
        )));
    }
    Ok(())
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_examples_small() {
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(format_examples(&items, 2), "a, b");
    }

    #[test]
    fn test_examples_capped() {
        let items: Vec<String> = (0..8).map(|i| format!("/path/{}", i)).collect();
        let text = format_examples(&items, items.len());
        assert!(text.starts_with("/path/0, /path/1"));
        assert!(!text.contains("/path/5"));
        assert!(text.ends_with("... and 3 more"));
    }

    #[test]
    fn test_examples_counts_unlisted_rows() {
        // Only a sample was fetched, the total came from a COUNT
        let items = vec!["x".to_string()];
        assert_eq!(format_examples(&items, 4), "x ... and 3 more");
    }

    #[test]
    fn test_user_error_code() {
        let err = IndexError::user(ErrorCode::RepairFailed, "still broken");
        assert_eq!(err.code(), Some(ErrorCode::RepairFailed));
        assert_eq!(err.to_string(), "still broken");
        assert_eq!(ErrorCode::RepairFailed.as_str(), "RepairFailed");
        assert!(IndexError::Consistency("x".into()).code().is_none());
    }

    #[test]
    fn test_expect_one_row() {
        assert!(expect_one_row(1, || "update".into()).is_ok());
        let err = expect_one_row(2, || "update block".into()).unwrap_err();
        assert!(matches!(err, IndexError::Consistency(_)));
        assert!(err.to_string().contains("affected 2"));
    }
}
