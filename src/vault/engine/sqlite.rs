use crate::vault::artifact::ArtifactFormat;
use crate::vault::driver::sqlite::SqliteDriver;
use crate::vault::engine::export::{export_interchange, export_sql};
use crate::vault::engine::tool::{Tool, ToolsConfig};
use crate::vault::engine::NativeRestore;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use std::path::Path;

/// SQLite is embedded, so backups never need an external binary: the online
/// backup API copies the file, SQL and interchange go through the driver.
#[derive(Clone, Debug)]
pub struct SqliteAdapter {
    tools: ToolsConfig,
}

impl SqliteAdapter {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    /// Whole-file copies only exist for full backups, partial ones fall back to
    /// the default format of their type.
    pub fn effective_format(backup_type: BackupType, format: ArtifactFormat) -> ArtifactFormat {
        match (format, backup_type) {
            (ArtifactFormat::Native, BackupType::Full) => format,
            (ArtifactFormat::Native, t) => ArtifactFormat::default_for(Engine::Sqlite, t),
            _ => format,
        }
    }

    pub fn backup(
        &self,
        config: &ConnectionConfig,
        backup_type: BackupType,
        format: ArtifactFormat,
        out: &Path,
    ) -> Result<(ArtifactFormat, String)> {
        let path = Path::new(&config.database);
        let format = Self::effective_format(backup_type, format);
        let method = match format {
            ArtifactFormat::Native => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| Error::connectivity(config.label(), e.to_string()))?;
                conn.backup(DatabaseName::Main, out, None)?;
                "sqlite online backup".to_owned()
            }
            ArtifactFormat::Sql => {
                let mut driver = SqliteDriver::open(path)?;
                let trailer = schema_trailer(driver.connection())?;
                let summary = export_sql(&mut driver, backup_type, &trailer, out)?;
                format!("driver sql export ({} tables, {} rows)", summary.tables, summary.rows)
            }
            ArtifactFormat::Interchange => {
                let mut driver = SqliteDriver::open(path)?;
                let summary = export_interchange(&mut driver, backup_type, out)?;
                format!(
                    "driver interchange export ({} tables, {} rows)",
                    summary.tables, summary.rows
                )
            }
        };
        Ok((format, method))
    }

    pub fn native_restore(&self, config: &ConnectionConfig, restore: &NativeRestore) -> Result<String> {
        match restore.format {
            ArtifactFormat::Native => {
                if restore.source_engine != Some(Engine::Sqlite) {
                    return Err(Error::tool_unavailable(
                        "sqlite backup api",
                        "artifact is not a SQLite database file",
                    ));
                }
                if !restore.whole_database {
                    return Err(Error::tool_unavailable(
                        "sqlite backup api",
                        "a whole-file restore would replace tables outside the restore scope",
                    ));
                }
                let mut conn = Connection::open(&config.database)
                    .map_err(|e| Error::connectivity(config.label(), e.to_string()))?;
                conn.restore(DatabaseName::Main, restore.artifact, None::<fn(Progress)>)?;
                Ok("sqlite whole-file restore".to_owned())
            }
            ArtifactFormat::Sql => {
                let cmd = self
                    .tools
                    .command(Tool::Sqlite3)
                    .args(["-bail", config.database.as_str()])
                    .stdin_file(restore.artifact);
                cmd.run()?;
                Ok(cmd.display())
            }
            ArtifactFormat::Interchange => Err(Error::tool_unavailable(
                Tool::Sqlite3.binary(),
                "interchange artifacts have no native loader",
            )),
        }
    }
}

/// Indexes, triggers and views, replayed after the tables and rows.
fn schema_trailer(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL \
         ORDER BY CASE type WHEN 'index' THEN 0 WHEN 'view' THEN 1 ELSE 2 END, name",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
