use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::config::IndexOptions;
use crate::errors::{IndexError, Result};
use crate::migrations::run_migrations;
use crate::schema::{PRAGMAS, SCHEMA, SCHEMA_VERSION};
use crate::transaction::TemporaryTransaction;

const BLOCKSIZE_KEY: &str = "blocksize";
const HASH_KEY: &str = "hash-algorithm";

/// Handle on one local index database
pub struct IndexDatabase {
    conn: Connection,
    path: Option<PathBuf>,
}

impl IndexDatabase {
    /// Open or create a database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;

        let mut db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.initialize()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self { conn, path: None };
        db.initialize()?;

        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        initialize_schema(&mut self.conn)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a database transaction for atomic operations
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// Begin a transaction owned by the returned scope
    pub fn temporary_transaction(&mut self) -> Result<TemporaryTransaction<'_>> {
        TemporaryTransaction::begin(&mut self.conn)
    }

    pub fn config_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT Value FROM Configuration WHERE Key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO Configuration (Key, Value) VALUES (?1, ?2)
             ON CONFLICT(Key) DO UPDATE SET Value = excluded.Value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Pin the block layout on first use and refuse a different one later.
    ///
    /// Hashes and blocklist pages recorded under one blocksize or algorithm
    /// cannot be interpreted under another.
    pub fn check_options(&self, options: &IndexOptions) -> Result<()> {
        options.validate()?;

        let blocksize = options.blocksize.to_string();
        let algorithm = options.hash_algorithm.name();

        match self.config_value(BLOCKSIZE_KEY)? {
            None => self.set_config_value(BLOCKSIZE_KEY, &blocksize)?,
            Some(stored) if stored != blocksize => {
                return Err(IndexError::InvalidConfig(format!(
                    "index was created with blocksize {}, options ask for {}",
                    stored, blocksize
                )));
            }
            Some(_) => {}
        }

        match self.config_value(HASH_KEY)? {
            None => self.set_config_value(HASH_KEY, algorithm)?,
            Some(stored) if stored != algorithm => {
                return Err(IndexError::InvalidConfig(format!(
                    "index was created with hash {}, options ask for {}",
                    stored, algorithm
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

/// Create the schema on a fresh database or bring an older one up to date
pub(crate) fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let version: Option<u32> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    match version {
        None => {
            info!("Initializing new index schema");
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            info!("Upgrading index schema from version {} to {}", v, SCHEMA_VERSION);
            run_migrations(conn, SCHEMA_VERSION)?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(IndexError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                actual: v,
            });
        }
        _ => {
            debug!("Index schema up to date (version {})", SCHEMA_VERSION);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_database_has_schema() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let version: u32 = db
            .connection()
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let blocks: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM Block", [], |r| r.get(0))
            .unwrap();
        assert_eq!(blocks, 0);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.sqlite");

        {
            let db = IndexDatabase::open(&path).unwrap();
            db.set_config_value("marker", "1").unwrap();
        }

        let db = IndexDatabase::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert_eq!(db.config_value("marker").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.sqlite");
        drop(IndexDatabase::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION + 1],
        )
        .unwrap();
        drop(conn);

        match IndexDatabase::open(&path) {
            Err(IndexError::SchemaVersionMismatch { expected, actual }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(actual, SCHEMA_VERSION + 1);
            }
            other => panic!("expected schema mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_options_are_pinned() {
        let db = IndexDatabase::open_in_memory().unwrap();
        let options = IndexOptions {
            blocksize: 1024,
            ..Default::default()
        };
        db.check_options(&options).unwrap();
        db.check_options(&options).unwrap();
        assert_eq!(db.config_value("blocksize").unwrap().as_deref(), Some("1024"));
        assert_eq!(
            db.config_value("hash-algorithm").unwrap().as_deref(),
            Some("blake3")
        );

        db.set_config_value("hash-algorithm", "sha256").unwrap();
        assert!(matches!(
            db.check_options(&options),
            Err(IndexError::InvalidConfig(_))
        ));
        db.set_config_value("hash-algorithm", "blake3").unwrap();

        let other = IndexOptions {
            blocksize: 2048,
            ..Default::default()
        };
        assert!(matches!(
            db.check_options(&other),
            Err(IndexError::InvalidConfig(_))
        ));
    }
}
