//! Schema upgrades for index databases written by older releases.
//!
//! A fresh database gets the whole current [`SCHEMA`](crate::schema::SCHEMA)
//! in one go. Databases that recorded an older `schema_version` are brought
//! forward one registered step at a time, each step in its own transaction.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::errors::{IndexError, Result};

/// One schema step
pub struct Migration {
    pub version: u32,
    pub description: String,
    pub up: Vec<String>,
    /// Statements undoing `up`, run in reverse order
    pub down: Option<Vec<String>>,
}

impl Migration {
    pub fn new(
        version: u32,
        description: impl Into<String>,
        up: Vec<String>,
        down: Option<Vec<String>>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            up,
            down,
        }
    }

    /// Run `up` and record the version
    pub fn apply(&self, conn: &mut Connection) -> Result<()> {
        info!("Applying migration {}: {}", self.version, self.description);

        let tx = conn.transaction()?;
        for statement in &self.up {
            tx.execute_batch(statement)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![self.version],
        )?;
        tx.commit()?;

        debug!("Migration {} applied", self.version);
        Ok(())
    }

    /// Run `down` and forget the version
    pub fn rollback(&self, conn: &mut Connection) -> Result<()> {
        let down = self.down.as_ref().ok_or_else(|| {
            IndexError::DatabaseError(format!(
                "Migration {} does not support rollback",
                self.version
            ))
        })?;

        info!("Rolling back migration {}: {}", self.version, self.description);

        let tx = conn.transaction()?;
        for statement in down.iter().rev() {
            tx.execute_batch(statement)?;
        }
        tx.execute(
            "DELETE FROM schema_version WHERE version = ?1",
            params![self.version],
        )?;
        tx.commit()?;

        Ok(())
    }
}

/// Ordered set of migrations up to a target version
pub struct MigrationManager {
    migrations: BTreeMap<u32, Migration>,
    target_version: u32,
}

impl MigrationManager {
    /// Manager preloaded with the index schema history
    pub fn new(target_version: u32) -> Self {
        let mut manager = Self::empty(target_version);
        manager.register_migrations();
        manager
    }

    /// Manager without any registered steps
    pub fn empty(target_version: u32) -> Self {
        Self {
            migrations: BTreeMap::new(),
            target_version,
        }
    }

    fn register_migrations(&mut self) {
        // Version 1 is the original table layout, created by `SCHEMA` itself
        self.add_migration(Migration::new(1, "Initial index schema", Vec::new(), None));

        self.add_migration(Migration::new(
            2,
            "Index remote volumes by type and state",
            vec![
                "CREATE INDEX IF NOT EXISTS RemoteVolumeTypeState ON RemoteVolume(Type, State)"
                    .to_string(),
            ],
            Some(vec!["DROP INDEX IF EXISTS RemoteVolumeTypeState".to_string()]),
        ));
    }

    pub fn add_migration(&mut self, migration: Migration) {
        let version = migration.version;
        if self.migrations.insert(version, migration).is_some() {
            warn!("Replacing existing migration for version {}", version);
        }
    }

    /// Highest version recorded in `schema_version`, 0 when none
    pub fn current_version(&self, conn: &Connection) -> Result<u32> {
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<u32>>(0)
            })?
            .unwrap_or(0);
        Ok(version)
    }

    pub fn needs_migration(&self, conn: &Connection) -> Result<bool> {
        Ok(self.current_version(conn)? != self.target_version)
    }

    /// Versions that `migrate` would apply
    pub fn pending_migrations(&self, conn: &Connection) -> Result<Vec<u32>> {
        let current = self.current_version(conn)?;
        if current >= self.target_version {
            return Ok(Vec::new());
        }
        Ok(self
            .migrations
            .range(current + 1..=self.target_version)
            .map(|(v, _)| *v)
            .collect())
    }

    pub fn migrate(&self, conn: &mut Connection) -> Result<()> {
        let current = self.current_version(conn)?;

        if current == self.target_version {
            debug!("Database is already at version {}", current);
            return Ok(());
        }

        if current > self.target_version {
            self.migrate_down(conn, current)
        } else {
            self.migrate_up(conn, current)
        }
    }

    fn migrate_up(&self, conn: &mut Connection, from: u32) -> Result<()> {
        info!("Migrating database from version {} to {}", from, self.target_version);

        for version in from + 1..=self.target_version {
            let migration = self.migrations.get(&version).ok_or_else(|| {
                IndexError::DatabaseError(format!("Missing migration for version {}", version))
            })?;
            migration.apply(conn)?;
        }

        Ok(())
    }

    fn migrate_down(&self, conn: &mut Connection, from: u32) -> Result<()> {
        info!("Rolling back database from version {} to {}", from, self.target_version);

        for version in (self.target_version + 1..=from).rev() {
            let migration = self.migrations.get(&version).ok_or_else(|| {
                IndexError::DatabaseError(format!("Missing migration for version {}", version))
            })?;
            migration.rollback(conn)?;
        }

        Ok(())
    }

    /// Registered versions must run 1..=n without gaps and reach the target
    pub fn validate(&self) -> Result<()> {
        for (expected, version) in (1u32..).zip(self.migrations.keys()) {
            if *version != expected {
                return Err(IndexError::DatabaseError(format!(
                    "Migration version gap: expected {}, found {}",
                    expected, version
                )));
            }
        }

        if !self.migrations.is_empty() && !self.migrations.contains_key(&self.target_version) {
            return Err(IndexError::DatabaseError(format!(
                "Target version {} not found in migrations",
                self.target_version
            )));
        }

        Ok(())
    }
}

/// Bring `conn` to `target_version` using the registered history
pub fn run_migrations(conn: &mut Connection, target_version: u32) -> Result<()> {
    let manager = MigrationManager::new(target_version);
    manager.validate()?;

    if manager.needs_migration(conn)? {
        manager.migrate(conn)?;
    }

    Ok(())
}
