//! Live database access used when the native tools are not enough: schema
//! introspection, row paging and row-level writes with conflict detection.

pub mod mysql;
pub mod postgres;
pub mod sqlite;
#[cfg(test)]
pub mod testing;

use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::result_error::result::Result;
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

impl Column {
    pub fn is_integer(&self) -> bool {
        let t = self.data_type.to_ascii_lowercase();
        t.contains("int") || t == "serial" || t == "bigserial"
    }

    pub fn is_binary(&self) -> bool {
        let t = self.data_type.to_ascii_lowercase();
        t == "bytea" || t.contains("blob") || t.contains("binary")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A unique or primary key constraint rejected the row.
    Conflict,
}

pub trait SqlDriver: Send {
    fn engine(&self) -> Engine;

    fn ping(&mut self) -> Result<()>;

    /// Runs one statement, returns the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Groups following writes. Engines where a failed statement aborts the
    /// surrounding transaction keep autocommit and ignore this.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>>;

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.list_tables()?.iter().any(|t| t == table))
    }

    fn columns(&mut self, table: &str) -> Result<Vec<Column>>;

    fn primary_key(&mut self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .columns(table)?
            .into_iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect())
    }

    /// `CREATE TABLE` statement of `table` in this engine's dialect.
    fn table_ddl(&mut self, table: &str) -> Result<Option<String>>;

    fn count_rows(&mut self, table: &str) -> Result<u64>;

    /// One page of rows in a stable order, values in `columns` order.
    fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[Column],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<Value>>>;

    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome>;

    /// Updates the row matching `key` columns of `row`, returns the affected count.
    fn update_row(&mut self, table: &str, key: &[String], row: &Map<String, Value>)
        -> Result<u64>;

    fn row_exists(&mut self, table: &str, key: &[String], row: &Map<String, Value>)
        -> Result<bool>;

    /// Deletes every row of `table`.
    fn clear_table(&mut self, table: &str) -> Result<u64>;

    /// Turns foreign key enforcement off (or back on) for this session so that
    /// tables can be cleared and loaded in any order.
    fn relax_constraints(&mut self, relaxed: bool) -> Result<()>;

    fn quote_ident(&self, name: &str) -> String {
        quote_ident(self.engine(), name)
    }
}

impl<D: SqlDriver + ?Sized> SqlDriver for Box<D> {
    fn engine(&self) -> Engine {
        (**self).engine()
    }
    fn ping(&mut self) -> Result<()> {
        (**self).ping()
    }
    fn execute(&mut self, sql: &str) -> Result<u64> {
        (**self).execute(sql)
    }
    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }
    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }
    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
    fn list_tables(&mut self) -> Result<Vec<String>> {
        (**self).list_tables()
    }
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        (**self).table_exists(table)
    }
    fn columns(&mut self, table: &str) -> Result<Vec<Column>> {
        (**self).columns(table)
    }
    fn primary_key(&mut self, table: &str) -> Result<Vec<String>> {
        (**self).primary_key(table)
    }
    fn table_ddl(&mut self, table: &str) -> Result<Option<String>> {
        (**self).table_ddl(table)
    }
    fn count_rows(&mut self, table: &str) -> Result<u64> {
        (**self).count_rows(table)
    }
    fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[Column],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<Value>>> {
        (**self).fetch_rows(table, columns, offset, limit)
    }
    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome> {
        (**self).insert_row(table, row)
    }
    fn update_row(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<u64> {
        (**self).update_row(table, key, row)
    }
    fn row_exists(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<bool> {
        (**self).row_exists(table, key, row)
    }
    fn clear_table(&mut self, table: &str) -> Result<u64> {
        (**self).clear_table(table)
    }
    fn relax_constraints(&mut self, relaxed: bool) -> Result<()> {
        (**self).relax_constraints(relaxed)
    }
}

/// Hands out driver sessions for a connection config.
pub trait DriverOpener: Send + Sync {
    fn open_driver(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>>;
}

pub fn quote_ident(engine: Engine, name: &str) -> String {
    match engine {
        Engine::MySql => format!("`{}`", name.replace('`', "``")),
        _ => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// `ORDER BY` list for paging: the primary key, or every column.
pub(crate) fn order_by(engine: Engine, columns: &[Column]) -> String {
    let pk: Vec<&Column> = columns.iter().filter(|c| c.primary_key).collect();
    let cols = if pk.is_empty() {
        columns.iter().collect()
    } else {
        pk
    };
    cols.iter()
        .map(|c| quote_ident(engine, &c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column names of `row` in a fixed order, together with their values.
pub(crate) fn split_row(row: &Map<String, Value>) -> (Vec<&str>, Vec<&Value>) {
    row.iter().map(|(k, v)| (k.as_str(), v)).unzip()
}
