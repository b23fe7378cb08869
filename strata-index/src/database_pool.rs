//! Pooled connections for driving index reports from async code.
//!
//! Queries run on the blocking thread pool, one pooled connection each.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::task;
use tracing::debug;

use crate::compact::{compact_report, wasted_space_report, CompactReport, VolumeUsage};
use crate::config::{CompactOptions, IndexOptions};
use crate::database::initialize_schema;
use crate::errors::{IndexError, Result};
use crate::fileset::{fileset_entries, fileset_ids, filesets, Fileset, FilesetFileEntry};
use crate::repair::repair_index;
use crate::schema::PRAGMAS;
use crate::verify::{verify_consistency, VerifyOptions};
use crate::volume::{remote_volumes, RemoteVolumeEntry};

#[derive(Clone)]
pub struct IndexPool {
    pool: Pool<SqliteConnectionManager>,
}

impl IndexPool {
    /// Pool over a database file with default settings
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).build()
    }

    /// Pool over a private in-memory database (for testing).
    ///
    /// Every in-memory connection is its own database, so the pool holds
    /// exactly one.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            init_connection(conn)
        });

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| IndexError::DatabaseError(format!("Pool creation failed: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn builder() -> IndexPoolBuilder {
        IndexPoolBuilder::new()
    }

    /// Run `f` on a pooled connection in a blocking task
    pub async fn execute_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| {
                IndexError::DatabaseError(format!("Failed to get connection: {}", e))
            })?;

            f(&conn)
        })
        .await
        .map_err(|e| IndexError::DatabaseError(format!("Task join error: {}", e)))?
    }

    /// Run `f` inside a transaction that commits when it returns `Ok`
    pub async fn execute_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                IndexError::DatabaseError(format!("Failed to get connection: {}", e))
            })?;

            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;

            Ok(result)
        })
        .await
        .map_err(|e| IndexError::DatabaseError(format!("Task join error: {}", e)))?
    }

    pub async fn verify(&self, options: VerifyOptions) -> Result<()> {
        self.execute_blocking(move |conn| verify_consistency(conn, &options))
            .await
    }

    /// Run every repair routine in one transaction, committed only when the
    /// repaired index verifies
    pub async fn repair(&self, options: IndexOptions) -> Result<()> {
        self.execute_blocking(move |conn| repair_index(conn, &options))
            .await
    }

    pub async fn compact_report(&self, options: CompactOptions) -> Result<CompactReport> {
        self.execute_blocking(move |conn| compact_report(conn, &options))
            .await
    }

    pub async fn wasted_space_report(&self) -> Result<Vec<VolumeUsage>> {
        self.execute_blocking(wasted_space_report).await
    }

    pub async fn filesets(&self) -> Result<Vec<Fileset>> {
        self.execute_blocking(filesets).await
    }

    pub async fn fileset_ids(
        &self,
        restore_time: Option<DateTime<Utc>>,
        versions: Vec<usize>,
    ) -> Result<Vec<i64>> {
        self.execute_blocking(move |conn| fileset_ids(conn, restore_time, &versions))
            .await
    }

    pub async fn fileset_entries(&self, fileset_id: i64) -> Result<Vec<FilesetFileEntry>> {
        self.execute_blocking(move |conn| fileset_entries(conn, fileset_id))
            .await
    }

    pub async fn remote_volumes(&self) -> Result<Vec<RemoteVolumeEntry>> {
        self.execute_blocking(remote_volumes).await
    }

    /// `(connections, idle connections)`
    pub fn pool_stats(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

pub struct IndexPoolBuilder {
    path: Option<PathBuf>,
    max_size: u32,
    connection_timeout: Duration,
    test_on_check_out: bool,
}

impl IndexPoolBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            max_size: 10,
            connection_timeout: Duration::from_secs(30),
            test_on_check_out: true,
        }
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn test_on_check_out(mut self, test: bool) -> Self {
        self.test_on_check_out = test;
        self
    }

    pub fn build(self) -> Result<IndexPool> {
        let Some(path) = self.path else {
            return Err(IndexError::DatabaseError(
                "Path is required for file-based databases. Use new_in_memory() for in-memory databases.".to_string(),
            ));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(PRAGMAS)?;
            init_connection(conn)
        });

        let pool = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .test_on_check_out(self.test_on_check_out)
            .build(manager)
            .map_err(|e| IndexError::DatabaseError(format!("Pool creation failed: {}", e)))?;

        debug!("Opened index pool on {}", path.display());
        Ok(IndexPool { pool })
    }
}

impl Default for IndexPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Schema setup for a new pooled connection
fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    initialize_schema(conn).map_err(|e| match e {
        IndexError::Database(e) => e,
        other => rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_SCHEMA),
            Some(format!("Schema initialization failed: {}", other)),
        ),
    })
}
