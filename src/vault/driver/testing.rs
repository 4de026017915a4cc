//! SQLite driver wrapper whose session refuses selected operations, for
//! exercising the fallbacks a locked-down server forces.

use crate::vault::driver::sqlite::SqliteDriver;
use crate::vault::driver::{Column, InsertOutcome, SqlDriver};
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use serde_json::{Map, Value};

pub struct Refusing {
    pub inner: SqliteDriver,
    /// Constraint checks cannot be turned off, like a Postgres role without
    /// superuser rights.
    pub relax: bool,
    /// Every transaction is rejected, like a read-only replica.
    pub begin: bool,
}

impl Refusing {
    pub fn new(inner: SqliteDriver) -> Self {
        Self {
            inner,
            relax: false,
            begin: false,
        }
    }
}

impl SqlDriver for Refusing {
    fn engine(&self) -> Engine {
        self.inner.engine()
    }
    fn ping(&mut self) -> Result<()> {
        self.inner.ping()
    }
    fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner.execute(sql)
    }
    fn begin(&mut self) -> Result<()> {
        if self.begin {
            return Err(Error::invalid_state(
                "cannot execute BEGIN in a read-only transaction",
            ));
        }
        self.inner.begin()
    }
    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }
    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }
    fn list_tables(&mut self) -> Result<Vec<String>> {
        self.inner.list_tables()
    }
    fn columns(&mut self, table: &str) -> Result<Vec<Column>> {
        self.inner.columns(table)
    }
    fn table_ddl(&mut self, table: &str) -> Result<Option<String>> {
        self.inner.table_ddl(table)
    }
    fn count_rows(&mut self, table: &str) -> Result<u64> {
        self.inner.count_rows(table)
    }
    fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[Column],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<Value>>> {
        self.inner.fetch_rows(table, columns, offset, limit)
    }
    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome> {
        self.inner.insert_row(table, row)
    }
    fn update_row(&mut self, table: &str, key: &[String], row: &Map<String, Value>) -> Result<u64> {
        self.inner.update_row(table, key, row)
    }
    fn row_exists(&mut self, table: &str, key: &[String], row: &Map<String, Value>) -> Result<bool> {
        self.inner.row_exists(table, key, row)
    }
    fn clear_table(&mut self, table: &str) -> Result<u64> {
        self.inner.clear_table(table)
    }
    fn relax_constraints(&mut self, relaxed: bool) -> Result<()> {
        if self.relax {
            return Err(Error::invalid_state(
                "permission denied to set parameter \"session_replication_role\"",
            ));
        }
        self.inner.relax_constraints(relaxed)
    }
}
