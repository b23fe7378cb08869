//! Scoped temporary tables.

use rusqlite::{Connection, Params};
use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;

/// A `TEMPORARY` table dropped when the guard goes out of scope.
///
/// Dropping is best effort: a failure is logged and swallowed, since the
/// table disappears with the connection anyway.
pub struct TempTable<'c> {
    conn: &'c Connection,
    name: String,
}

impl<'c> TempTable<'c> {
    /// Create an empty table with the given column list
    pub fn create(conn: &'c Connection, prefix: &str, columns: &str) -> Result<Self> {
        let name = unique_name(prefix);
        conn.execute_batch(&format!(
            "CREATE TEMPORARY TABLE \"{}\" ({})",
            name, columns
        ))?;
        Ok(Self { conn, name })
    }

    /// Create a table holding the result of `select`
    pub fn create_as<P: Params>(
        conn: &'c Connection,
        prefix: &str,
        select: &str,
        params: P,
    ) -> Result<Self> {
        let name = unique_name(prefix);
        conn.execute(
            &format!("CREATE TEMPORARY TABLE \"{}\" AS {}", name, select),
            params,
        )?;
        Ok(Self { conn, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name quoted for use inside SQL text
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.quoted()),
            [],
            |row| row.get(0),
        )?)
    }
}

impl Drop for TempTable<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", self.name))
        {
            debug!("Failed to drop temporary table {}: {}", self.name, e);
        }
    }
}

fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}
