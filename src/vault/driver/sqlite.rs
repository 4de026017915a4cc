use crate::vault::artifact::records::{as_blob, blob_value};
use crate::vault::driver::{order_by, quote_ident, split_row, Column, InsertOutcome, SqlDriver};
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Number, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

static BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDriver {
    conn: Connection,
    path: PathBuf,
}

impl SqliteDriver {
    /// Opens an existing database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| Error::connectivity(path.display().to_string(), e.to_string()))?;
        Self::from_connection(conn, path)
    }

    /// Opens the file, creating an empty database when missing.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::connectivity(path.display().to_string(), e.to_string()))?;
        Self::from_connection(conn, path)
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| Error::format(format!("{path:?} is not a SQLite database: {e}")))?;
        Self::from_connection(conn, path)
    }

    fn from_connection(conn: Connection, path: &Path) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ident(&self, name: &str) -> String {
        quote_ident(Engine::Sqlite, name)
    }
}

pub(crate) fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => blob_value(b),
    }
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => match as_blob(other) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(other.to_string()),
        },
    }
}

impl SqlDriver for SqliteDriver {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    fn ping(&mut self) -> Result<()> {
        self.conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get::<_, i64>(0))
            .map_err(|e| Error::connectivity(self.path.display().to_string(), e.to_string()))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            return Ok(0);
        }
        Ok(stmt.execute([])? as u64)
    }

    fn begin(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tables)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", self.ident(table)))?;
        let columns = stmt
            .query_map([], |r| {
                Ok(Column {
                    name: r.get(1)?,
                    data_type: r.get(2)?,
                    not_null: r.get::<_, i64>(3)? != 0,
                    primary_key: r.get::<_, i64>(5)? > 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn table_ddl(&mut self, table: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    fn count_rows(&mut self, table: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", self.ident(table)),
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[Column],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<Value>>> {
        let select = columns
            .iter()
            .map(|c| self.ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
            select,
            self.ident(table),
            order_by(Engine::Sqlite, columns)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([limit as i64, offset as i64])?;
        let mut out = vec![];
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(to_json(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome> {
        let (names, values) = split_row(row);
        let sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", self.ident(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.ident(table),
                names.iter().map(|n| self.ident(n)).collect::<Vec<_>>().join(", "),
                (1..=names.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
            )
        };
        match self
            .conn
            .execute(&sql, params_from_iter(values.into_iter().map(to_sql)))
        {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) => {
                let e = Error::from(e);
                if e.is_unique_violation() {
                    Ok(InsertOutcome::Conflict)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn update_row(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<u64> {
        let set: Vec<(&String, &Value)> = row.iter().filter(|(k, _)| !key.contains(k)).collect();
        if set.is_empty() {
            return Ok(0);
        }
        let mut params = vec![];
        let mut assignments = vec![];
        for (name, value) in &set {
            params.push(to_sql(value));
            assignments.push(format!("{} = ?{}", self.ident(name), params.len()));
        }
        let mut conditions = vec![];
        for k in key {
            params.push(to_sql(row.get(k).unwrap_or(&Value::Null)));
            conditions.push(format!("{} = ?{}", self.ident(k), params.len()));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.ident(table),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        Ok(self.conn.execute(&sql, params_from_iter(params))? as u64)
    }

    fn row_exists(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<bool> {
        let conditions = key
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{} = ?{}", self.ident(k), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            self.ident(table),
            conditions
        );
        let params = key
            .iter()
            .map(|k| to_sql(row.get(k).unwrap_or(&Value::Null)));
        Ok(self
            .conn
            .query_row(&sql, params_from_iter(params), |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn clear_table(&mut self, table: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute(&format!("DELETE FROM {}", self.ident(table)), [])? as u64)
    }

    fn relax_constraints(&mut self, relaxed: bool) -> Result<()> {
        // no effect inside a transaction
        let value = if relaxed { "OFF" } else { "ON" };
        self.conn
            .execute_batch(&format!("PRAGMA foreign_keys = {value}"))?;
        Ok(())
    }
}
