//! Small statement builder for queries whose filters depend on runtime
//! options. Values always travel as bound parameters, never as SQL text.

use rusqlite::types::Value;
use rusqlite::{Connection, Row, ToSql};

use crate::errors::Result;

/// A statement assembled from a base, `WHERE` clauses and bound values
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    base: String,
    clauses: Vec<String>,
    tail: Vec<String>,
    params: Vec<(String, Value)>,
}

impl QueryBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            ..Default::default()
        }
    }

    /// Add a condition, joined to the others with `AND`
    pub fn and_where(mut self, clause: impl Into<String>) -> Self {
        self.clauses.push(clause.into());
        self
    }

    /// Bind a named parameter such as `:ts` used by a clause
    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.push((name.to_string(), value.into()));
        self
    }

    /// `column IN (...)` with one bound parameter per value.
    ///
    /// An empty list matches nothing.
    pub fn and_where_in<V: Into<Value>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let start = self.params.len();
        let mut names = Vec::new();
        for (i, value) in values.into_iter().enumerate() {
            let name = format!(":in{}", start + i);
            names.push(name.clone());
            self.params.push((name, value.into()));
        }
        if names.is_empty() {
            self.clauses.push("0".to_string());
        } else {
            self.clauses
                .push(format!("{} IN ({})", column, names.join(", ")));
        }
        self
    }

    /// Append `ORDER BY`, `GROUP BY` or similar after the conditions
    pub fn then(mut self, tail: impl Into<String>) -> Self {
        self.tail.push(tail.into());
        self
    }

    pub fn sql(&self) -> String {
        let mut sql = self.base.clone();
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        for tail in &self.tail {
            sql.push(' ');
            sql.push_str(tail);
        }
        sql
    }

    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    fn named(&self) -> Vec<(&str, &dyn ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }

    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare(&self.sql())?;
        Ok(stmt.execute(self.named().as_slice())?)
    }

    pub fn query_map<T, F>(&self, conn: &Connection, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = conn.prepare(&self.sql())?;
        let rows = stmt.query_map(self.named().as_slice(), f)?;
        Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
    }

    pub fn query_scalar(&self, conn: &Connection) -> Result<i64> {
        let mut stmt = conn.prepare(&self.sql())?;
        Ok(stmt.query_row(self.named().as_slice(), |row| row.get(0))?)
    }
}
