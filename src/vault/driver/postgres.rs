use crate::vault::artifact::records::{as_blob, blob_value, decode_hex, encode_hex};
use crate::vault::driver::{order_by, quote_ident, Column, InsertOutcome, SqlDriver};
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::runtime::Handle;

/// Postgres access over one pooled sqlx connection. Rows travel as JSON:
/// `row_to_json` on the way out, `json_populate_record` on the way in, so no
/// per-type decoding is needed.
///
/// Runs in autocommit: a failed row would abort an open transaction and every
/// row after it, so `begin`/`commit` keep their no-op defaults.
pub struct PostgresDriver {
    handle: Handle,
    conn: PoolConnection<Postgres>,
}

impl PostgresDriver {
    pub fn connect(handle: Handle, pool: &PgPool, target: &str) -> Result<Self> {
        let conn = handle
            .block_on(pool.acquire())
            .map_err(|e| Error::connectivity(target, e.to_string()))?;
        Ok(Self { handle, conn })
    }

    fn ident(&self, name: &str) -> String {
        quote_ident(Engine::Postgres, name)
    }

    /// `bytea` values go in as `\x` hex text.
    fn record_json(row: &Map<String, Value>) -> String {
        let row: Map<String, Value> = row
            .iter()
            .map(|(k, v)| match as_blob(v) {
                Some(bytes) => (k.clone(), Value::String(format!("\\x{}", encode_hex(&bytes)))),
                None => (k.clone(), v.clone()),
            })
            .collect();
        Value::Object(row).to_string()
    }

    fn populate(&self, table: &str) -> String {
        format!("json_populate_record(NULL::{}, $1::json)", self.ident(table))
    }

    fn key_match(&self, key: &[String]) -> String {
        key.iter()
            .map(|k| format!("d.{0} = r.{0}", self.ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl SqlDriver for PostgresDriver {
    fn engine(&self) -> Engine {
        Engine::Postgres
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
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY 1",
            )
            .fetch_all(&mut *self.conn),
        )?)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let ident = self.ident(table);
        Ok(self.handle.block_on(
            sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
                .bind(ident)
                .fetch_one(&mut *self.conn),
        )?)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<Column>> {
        let ident = self.ident(table);
        let rows = self.handle.block_on(
            sqlx::query_as::<_, (String, String, bool, bool)>(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attnotnull, \
                        COALESCE(a.attnum = ANY(i.indkey), false) \
                 FROM pg_attribute a \
                 LEFT JOIN pg_index i ON i.indrelid = a.attrelid AND i.indisprimary \
                 WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
            )
            .bind(ident)
            .fetch_all(&mut *self.conn),
        )?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type, not_null, primary_key)| Column {
                name,
                data_type,
                not_null,
                primary_key,
            })
            .collect())
    }

    /// Column types, nullability and the primary key. Defaults, indexes and
    /// sequences are left to the native dump.
    fn table_ddl(&mut self, table: &str) -> Result<Option<String>> {
        let columns = self.columns(table)?;
        if columns.is_empty() {
            return Ok(None);
        }
        let mut parts: Vec<String> = columns
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    self.ident(&c.name),
                    c.data_type,
                    if c.not_null { " NOT NULL" } else { "" }
                )
            })
            .collect();
        let pk: Vec<String> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| self.ident(&c.name))
            .collect();
        if !pk.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        Ok(Some(format!(
            "CREATE TABLE {} ({})",
            self.ident(table),
            parts.join(", ")
        )))
    }

    fn count_rows(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM {}", self.ident(table));
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
            .map(|c| self.ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT row_to_json(r)::text FROM (SELECT {} FROM {} ORDER BY {} LIMIT $1 OFFSET $2) r",
            select,
            self.ident(table),
            order_by(Engine::Postgres, columns)
        );
        let rows = self.handle.block_on(
            sqlx::query_scalar::<_, String>(&sql)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&mut *self.conn),
        )?;

        rows.into_iter()
            .map(|text| -> Result<Vec<Value>> {
                let mut object: Map<String, Value> = serde_json::from_str(&text)?;
                Ok(columns
                    .iter()
                    .map(|c| {
                        let v = object.remove(&c.name).unwrap_or(Value::Null);
                        match (&v, c.is_binary()) {
                            (Value::String(s), true) => s
                                .strip_prefix("\\x")
                                .and_then(decode_hex)
                                .map(|b| blob_value(&b))
                                .unwrap_or(v),
                            _ => v,
                        }
                    })
                    .collect())
            })
            .collect()
    }

    fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<InsertOutcome> {
        let cols = row
            .keys()
            .map(|k| self.ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if row.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", self.ident(table))
        } else {
            format!(
                "INSERT INTO {} ({cols}) SELECT {cols} FROM {} ON CONFLICT DO NOTHING",
                self.ident(table),
                self.populate(table)
            )
        };
        let mut query = sqlx::query(&sql);
        if !row.is_empty() {
            query = query.bind(Self::record_json(row));
        }
        let result = self.handle.block_on(query.execute(&mut *self.conn))?;
        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Conflict
        } else {
            InsertOutcome::Inserted
        })
    }

    fn update_row(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<u64> {
        let set = row
            .keys()
            .filter(|k| !key.contains(k))
            .map(|k| format!("{0} = r.{0}", self.ident(k)))
            .collect::<Vec<_>>();
        if set.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} AS d SET {} FROM {} AS r WHERE {}",
            self.ident(table),
            set.join(", "),
            self.populate(table),
            self.key_match(key)
        );
        let result = self.handle.block_on(
            sqlx::query(&sql)
                .bind(Self::record_json(row))
                .execute(&mut *self.conn),
        )?;
        Ok(result.rows_affected())
    }

    fn row_exists(
        &mut self,
        table: &str,
        key: &[String],
        row: &Map<String, Value>,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} AS d, {} AS r WHERE {})",
            self.ident(table),
            self.populate(table),
            self.key_match(key)
        );
        Ok(self.handle.block_on(
            sqlx::query_scalar::<_, bool>(&sql)
                .bind(Self::record_json(row))
                .fetch_one(&mut *self.conn),
        )?)
    }

    fn clear_table(&mut self, table: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.ident(table));
        Ok(self.execute(&sql)?)
    }

    /// Needs a role allowed to set `session_replication_role`.
    fn relax_constraints(&mut self, relaxed: bool) -> Result<()> {
        let value = if relaxed { "replica" } else { "DEFAULT" };
        self.execute(&format!("SET session_replication_role = {value}"))?;
        Ok(())
    }
}
