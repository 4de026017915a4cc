use crate::vault::artifact::records::{as_blob, blob_value, decode_hex};
use crate::vault::driver::{order_by, quote_ident, split_row, Column, InsertOutcome, SqlDriver};
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use serde_json::{Map, Value};
use sqlx::mysql::MySqlArguments;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{MySql, MySqlPool};
use tokio::runtime::Handle;

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

/// MySQL/MariaDB access over one pooled sqlx connection. Rows are read with
/// `JSON_ARRAY`, binary columns as hex.
pub struct MySqlDriver {
    handle: Handle,
    conn: PoolConnection<MySql>,
}

impl MySqlDriver {
    pub fn connect(handle: Handle, pool: &MySqlPool, target: &str) -> Result<Self> {
        let conn = handle
            .block_on(pool.acquire())
            .map_err(|e| Error::connectivity(target, e.to_string()))?;
        Ok(Self { handle, conn })
    }

    fn ident(&self, name: &str) -> String {
        quote_ident(Engine::MySql, name)
    }
}

fn bind_value<'q>(query: MySqlQuery<'q>, value: &Value) -> MySqlQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => match as_blob(other) {
            Some(bytes) => query.bind(bytes),
            None => query.bind(other.to_string()),
        },
    }
}

impl SqlDriver for MySqlDriver {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    fn ping(&mut self) -> Result<()> {
        self.handle
            .block_on(sqlx::query("SELECT 1").execute(&mut *self.conn))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = self
            .handle
            .block_on(sqlx::raw_sql(sql).execute(&mut *self.conn))?;
        Ok(result.rows_affected())
    }

    fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.handle.block_on(
            sqlx::query_scalar::<_, String>(
                "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY 1",
            )
            .fetch_all(&mut *self.conn),
        )?)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<Column>> {
        let rows = self.handle.block_on(
            sqlx::query_as::<_, (String, String, String, String)>(
                "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR), \
                        CAST(is_nullable AS CHAR), CAST(column_key AS CHAR) \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position",
            )
            .bind(table)
            .fetch_all(&mut *self.conn),
        )?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type, nullable, key)| Column {
                name,
                data_type,
                not_null: nullable == "NO",
                primary_key: key == "PRI",
            })
            .collect())
    }

    fn table_ddl(&mut self, table: &str) -> Result<Option<String>> {
        let sql = format!("SHOW CREATE TABLE {}", self.ident(table));
        let row = self.handle.block_on(
            sqlx::query_as::<_, (String, String)>(&sql).fetch_optional(&mut *self.conn),
        )?;
        Ok(row.map(|(_, ddl)| ddl))
    }

    fn count_rows(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.ident(table));
        let n = self
            .handle
            .block_on(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *self.conn))?;
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
            .map(|c| {
                if c.is_binary() {
                    format!("HEX({})", self.ident(&c.name))
                } else {
                    self.ident(&c.name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT CAST(JSON_ARRAY({}) AS CHAR) FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            select,
            self.ident(table),
            order_by(Engine::MySql, columns)
        );
        let rows = self.handle.block_on(
            sqlx::query_scalar::<_, String>(&sql)
                .bind(limit)
                .bind(offset)
                .fetch_all(&mut *self.conn),
        )?;

        rows.into_iter()
            .map(|text| -> Result<Vec<Value>> {
                let values: Vec<Value> = serde_json::from_str(&text)?;
                Ok(values
                    .into_iter()
                    .zip(columns)
                    .map(|(v, c)| match (&v, c.is_binary()) {
                        (Value::String(hex), true) => decode_hex(hex)
                            .map(|b| blob_value(&b))
                            .unwrap_or(v),
                        _ => v,
                    })
                    .collect())
            })
            .collect()
    }

    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome> {
        let (names, values) = split_row(row);
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.ident(table),
            names.iter().map(|n| self.ident(n)).collect::<Vec<_>>().join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let query = values
            .into_iter()
            .fold(sqlx::query(&sql), |q, v| bind_value(q, v));
        match self.handle.block_on(query.execute(&mut *self.conn)) {
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
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.ident(table),
            set.iter()
                .map(|(k, _)| format!("{} = ?", self.ident(k)))
                .collect::<Vec<_>>()
                .join(", "),
            key.iter()
                .map(|k| format!("{} = ?", self.ident(k)))
                .collect::<Vec<_>>()
                .join(" AND ")
        );
        let query = set
            .iter()
            .map(|(_, v)| *v)
            .chain(key.iter().map(|k| row.get(k).unwrap_or(&Value::Null)))
            .fold(sqlx::query(&sql), |q, v| bind_value(q, v));
        let result = self.handle.block_on(query.execute(&mut *self.conn))?;
        Ok(result.rows_affected())
    }

    fn row_exists(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            self.ident(table),
            key.iter()
                .map(|k| format!("{} = ?", self.ident(k)))
                .collect::<Vec<_>>()
                .join(" AND ")
        );
        let query = key
            .iter()
            .map(|k| row.get(k).unwrap_or(&Value::Null))
            .fold(sqlx::query(&sql), |q, v| bind_value(q, v));
        Ok(self
            .handle
            .block_on(query.fetch_optional(&mut *self.conn))?
            .is_some())
    }

    fn clear_table(&mut self, table: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.ident(table));
        self.execute(&sql)
    }

    fn relax_constraints(&mut self, relaxed: bool) -> Result<()> {
        let value = if relaxed { 0 } else { 1 };
        self.execute(&format!("SET FOREIGN_KEY_CHECKS = {value}"))?;
        Ok(())
    }
}
