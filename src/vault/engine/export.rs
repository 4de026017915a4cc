//! Artifact generation through a driver connection, used for the interchange
//! format and wherever the native dump tool is missing.

use crate::vault::artifact::interchange::{InterchangeHeader, InterchangeWriter};
use crate::vault::artifact::records::{as_blob, encode_hex, TableDescriptor};
use crate::vault::driver::SqlDriver;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::Engine;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Write};
use std::path::Path;

pub(crate) static PAGE_SIZE: u64 = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub tables: usize,
    pub rows: u64,
}

/// Pages through every row of `table`, handing each page to `f`.
fn for_each_page<F: FnMut(Vec<Vec<Value>>) -> Result<()>>(
    driver: &mut dyn SqlDriver,
    table: &str,
    columns: &[crate::vault::driver::Column],
    mut f: F,
) -> Result<u64> {
    let mut offset = 0;
    loop {
        let page = driver
            .fetch_rows(table, columns, offset, PAGE_SIZE)
            .with_msg(format!("Reading rows of {table} failed"))?;
        let n = page.len() as u64;
        if n > 0 {
            f(page)?;
        }
        offset += n;
        if n < PAGE_SIZE {
            return Ok(offset);
        }
    }
}

pub fn export_interchange(
    driver: &mut dyn SqlDriver,
    backup_type: BackupType,
    out: &Path,
) -> Result<ExportSummary> {
    let file = BufWriter::new(File::create(out)?);
    let mut writer = InterchangeWriter::new(file, &InterchangeHeader::new(driver.engine(), backup_type))?;
    let mut summary = ExportSummary::default();

    for table in driver.list_tables()? {
        let columns = driver.columns(&table)?;
        let descriptor = TableDescriptor {
            name: table.clone(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            primary_key: columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.clone())
                .collect(),
            // Carried for data backups too, so an empty target can be rebuilt.
            ddl: driver.table_ddl(&table)?,
            row_count: if backup_type.has_data() {
                Some(driver.count_rows(&table)?)
            } else {
                Some(0)
            },
        };
        writer.begin_table(&descriptor)?;
        if backup_type.has_data() {
            summary.rows += for_each_page(driver, &table, &columns, |page| {
                page.iter().try_for_each(|row| writer.write_row(row))
            })?;
        }
        summary.tables += 1;
    }

    writer
        .finish()?
        .into_inner()
        .map_err(IntoInnerError::into_error)?
        .sync_all()?;
    Ok(summary)
}

/// SQL literal for `value` in the dialect of `engine`.
pub fn sql_literal(engine: Engine, value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => match engine {
            Engine::Postgres => if *b { "TRUE" } else { "FALSE" }.to_owned(),
            _ => if *b { "1" } else { "0" }.to_owned(),
        },
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(engine, s),
        other => match as_blob(other) {
            Some(bytes) => match engine {
                Engine::Postgres => format!("'\\x{}'", encode_hex(&bytes)),
                _ => format!("X'{}'", encode_hex(&bytes)),
            },
            None => quote_string(engine, &other.to_string()),
        },
    }
}

fn quote_string(engine: Engine, s: &str) -> String {
    let escaped = s.replace('\'', "''");
    match engine {
        Engine::MySql => format!("'{}'", escaped.replace('\\', "\\\\")),
        _ => format!("'{escaped}'"),
    }
}

/// Plain SQL dump: per table a drop-and-create pair and one `INSERT` per row,
/// then `trailer` statements (indexes, triggers).
pub fn export_sql(
    driver: &mut dyn SqlDriver,
    backup_type: BackupType,
    trailer: &[String],
    out: &Path,
) -> Result<ExportSummary> {
    let engine = driver.engine();
    let mut w = BufWriter::new(File::create(out)?);
    let mut summary = ExportSummary::default();
    writeln!(
        w,
        "-- k_dbvault {} dump of a {} database, {}",
        backup_type,
        engine,
        Utc::now().to_rfc3339()
    )?;
    writeln!(w, "BEGIN;")?;

    for table in driver.list_tables()? {
        let columns = driver.columns(&table)?;
        if backup_type.has_schema() {
            if let Some(ddl) = driver.table_ddl(&table)? {
                writeln!(w, "DROP TABLE IF EXISTS {};", driver.quote_ident(&table))?;
                writeln!(w, "{};", ddl.trim_end_matches(';'))?;
            }
        }
        if backup_type.has_data() {
            let prefix = format!(
                "INSERT INTO {} ({}) VALUES",
                driver.quote_ident(&table),
                columns
                    .iter()
                    .map(|c| driver.quote_ident(&c.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            summary.rows += for_each_page(driver, &table, &columns, |page| {
                for row in page {
                    let values = row
                        .iter()
                        .map(|v| sql_literal(engine, v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(w, "{prefix} ({values});")?;
                }
                Ok(())
            })?;
        }
        summary.tables += 1;
    }

    if backup_type.has_schema() {
        for stmt in trailer {
            writeln!(w, "{};", stmt.trim_end_matches(';'))?;
        }
    }
    writeln!(w, "COMMIT;")?;
    w.into_inner().map_err(IntoInnerError::into_error)?.sync_all()?;
    Ok(summary)
}
