//! Transactions that are either owned by the current operation or borrowed
//! from a caller that batches several operations together.

use std::ops::Deref;

use rusqlite::{Connection, Transaction};

use crate::errors::Result;

/// A transaction scope that only finishes what it started.
///
/// `Owned` wraps a transaction begun for this call: `commit` commits it, and
/// dropping it uncommitted rolls it back. `Borrowed` runs on a caller's
/// transaction (or connection): `commit` and `rollback` are no-ops, leaving
/// the outcome to the caller.
pub enum TemporaryTransaction<'a> {
    Owned(Transaction<'a>),
    Borrowed(&'a Connection),
}

impl<'a> TemporaryTransaction<'a> {
    /// Begin a transaction owned by this scope
    pub fn begin(conn: &'a mut Connection) -> Result<Self> {
        Ok(TemporaryTransaction::Owned(conn.transaction()?))
    }

    /// Join a transaction managed by the caller
    pub fn borrowed(conn: &'a Connection) -> Self {
        TemporaryTransaction::Borrowed(conn)
    }

    /// Own a transaction unless `conn` is already inside one
    pub fn join(conn: &'a Connection) -> Result<Self> {
        if conn.is_autocommit() {
            Ok(TemporaryTransaction::Owned(conn.unchecked_transaction()?))
        } else {
            Ok(TemporaryTransaction::Borrowed(conn))
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, TemporaryTransaction::Owned(_))
    }

    pub fn commit(self) -> Result<()> {
        if let TemporaryTransaction::Owned(tx) = self {
            tx.commit()?;
        }
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        if let TemporaryTransaction::Owned(tx) = self {
            tx.rollback()?;
        }
        Ok(())
    }
}

impl Deref for TemporaryTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            TemporaryTransaction::Owned(tx) => tx,
            TemporaryTransaction::Borrowed(conn) => conn,
        }
    }
}
