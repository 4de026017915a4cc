//! One adapter per database engine, each producing and consuming artifacts
//! with that engine's own tools. Anything the tools cannot do goes through a
//! [`SqlDriver`](crate::vault::driver::SqlDriver) session instead.

pub mod export;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod tool;

use crate::vault::artifact::ArtifactFormat;
use crate::vault::driver::DriverOpener;
use crate::vault::engine::export::{export_interchange, export_sql, ExportSummary};
use crate::vault::engine::mysql::MySqlAdapter;
use crate::vault::engine::postgres::PostgresAdapter;
use crate::vault::engine::sqlite::SqliteAdapter;
use crate::vault::engine::tool::ToolsConfig;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::result_error::error::{Error, ErrorKind};
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub enum EngineAdapter {
    Postgres(PostgresAdapter),
    MySql(MySqlAdapter),
    Sqlite(SqliteAdapter),
}

/// What a backup actually wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupOutcome {
    pub format: ArtifactFormat,
    /// Tool command line or driver export description, for the log
    pub method: String,
    /// Why the requested path was not taken, if it was not
    pub fallback_reason: Option<String>,
}

/// Input of a native restore step.
#[derive(Clone, Debug)]
pub struct NativeRestore<'a> {
    pub artifact: &'a Path,
    pub format: ArtifactFormat,
    /// Engine that wrote a native dump
    pub source_engine: Option<Engine>,
    /// Drop and recreate objects the artifact defines
    pub clean: bool,
    /// The restore may replace the whole database, not just some tables
    pub whole_database: bool,
}

impl EngineAdapter {
    pub fn new(engine: Engine, tools: &ToolsConfig) -> Self {
        match engine {
            Engine::Postgres => EngineAdapter::Postgres(PostgresAdapter::new(tools.clone())),
            Engine::MySql => EngineAdapter::MySql(MySqlAdapter::new(tools.clone())),
            Engine::Sqlite => EngineAdapter::Sqlite(SqliteAdapter::new(tools.clone())),
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            EngineAdapter::Postgres(_) => Engine::Postgres,
            EngineAdapter::MySql(_) => Engine::MySql,
            EngineAdapter::Sqlite(_) => Engine::Sqlite,
        }
    }

    /// Writes one raw artifact of `config` to `out`. A missing native tool
    /// falls back to a driver export: SQL text for schema backups, interchange
    /// otherwise.
    pub fn backup(
        &self,
        config: &ConnectionConfig,
        backup_type: BackupType,
        format: ArtifactFormat,
        out: &Path,
        opener: &dyn DriverOpener,
    ) -> Result<BackupOutcome> {
        let format = format.supported_by(self.engine());
        let native = match self {
            EngineAdapter::Sqlite(a) => {
                let (format, method) = a.backup(config, backup_type, format, out)?;
                return Ok(BackupOutcome {
                    format,
                    method,
                    fallback_reason: None,
                });
            }
            _ if format == ArtifactFormat::Interchange => {
                let summary = driver_export(config, backup_type, format, out, opener)?;
                return Ok(BackupOutcome {
                    format,
                    method: describe_export(format, summary),
                    fallback_reason: None,
                });
            }
            EngineAdapter::Postgres(a) => a.native_backup(config, backup_type, format, out),
            EngineAdapter::MySql(a) => a.native_backup(config, backup_type, out),
        };

        match native {
            Ok(method) => Ok(BackupOutcome {
                format,
                method,
                fallback_reason: None,
            }),
            Err(e) if e.kind() == ErrorKind::ToolUnavailable => {
                let fallback = if backup_type == BackupType::Schema {
                    ArtifactFormat::Sql
                } else {
                    ArtifactFormat::Interchange
                };
                warn!(
                    "Native dump of {} unavailable, exporting {} through the driver: {}",
                    config.label(),
                    fallback,
                    e
                );
                remove_partial(out);
                let reason = e.to_string();
                let summary = driver_export(config, backup_type, fallback, out, opener)
                    .map_err(|e2| e.chain(e2))?;
                Ok(BackupOutcome {
                    format: fallback,
                    method: describe_export(fallback, summary),
                    fallback_reason: Some(reason),
                })
            }
            Err(e) => {
                remove_partial(out);
                Err(e)
            }
        }
    }

    /// Applies an artifact with the engine's own loader. Artifacts the loader
    /// cannot take report [`ErrorKind::ToolUnavailable`] so the caller moves on.
    pub fn native_restore(&self, config: &ConnectionConfig, restore: &NativeRestore) -> Result<String> {
        info!(
            "Native restore of {} artifact into {}",
            restore.format,
            config.label()
        );
        match self {
            EngineAdapter::Postgres(a) => a.native_restore(config, restore),
            EngineAdapter::MySql(a) => a.native_restore(config, restore),
            EngineAdapter::Sqlite(a) => a.native_restore(config, restore),
        }
    }
}

fn driver_export(
    config: &ConnectionConfig,
    backup_type: BackupType,
    format: ArtifactFormat,
    out: &Path,
    opener: &dyn DriverOpener,
) -> Result<ExportSummary> {
    let mut driver = opener.open_driver(config)?;
    match format {
        ArtifactFormat::Sql => export_sql(driver.as_mut(), backup_type, &[], out),
        ArtifactFormat::Interchange => export_interchange(driver.as_mut(), backup_type, out),
        ArtifactFormat::Native => Err(Error::invalid_state(
            "native dumps cannot be produced through a driver connection",
        )),
    }
    .with_msg(format!("Driver export of {} failed", config.label()))
}

fn describe_export(format: ArtifactFormat, summary: ExportSummary) -> String {
    format!(
        "driver {} export ({} tables, {} rows)",
        format, summary.tables, summary.rows
    )
}

fn remove_partial(out: &Path) {
    if out.exists() {
        if let Err(e) = std::fs::remove_file(out) {
            warn!("Removing partial artifact {:?} failed: {}", out, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::artifact::interchange::InterchangeReader;
    use crate::vault::driver::sqlite::SqliteDriver;
    use crate::vault::driver::SqlDriver;
    use chrono::Utc;
    use std::fs::File;
    use std::io::BufReader;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Serves every config from one local SQLite file.
    struct LocalFile(std::path::PathBuf);

    impl DriverOpener for LocalFile {
        fn open_driver(&self, _config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>> {
            Ok(Box::new(SqliteDriver::open(&self.0)?))
        }
    }

    fn server_config() -> ConnectionConfig {
        ConnectionConfig {
            id: Uuid::new_v4(),
            name: "pg".into(),
            engine: Engine::Postgres,
            host: Some("127.0.0.1".into()),
            port: None,
            username: None,
            password: None,
            database: "shop".into(),
            is_active: true,
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn local(dir: &TempDir) -> LocalFile {
        let path = dir.path().join("stand-in.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1), (2);")
            .unwrap();
        LocalFile(path)
    }

    #[test]
    fn test_missing_dump_tool_falls_back_to_driver_export() {
        let dir = TempDir::new().unwrap();
        let tools = ToolsConfig {
            disabled: true,
            ..Default::default()
        };
        let out = dir.path().join("raw");
        let outcome = EngineAdapter::new(Engine::Postgres, &tools)
            .backup(&server_config(), BackupType::Full, ArtifactFormat::Native, &out, &local(&dir))
            .unwrap();
        assert_eq!(outcome.format, ArtifactFormat::Interchange);
        assert!(outcome.fallback_reason.unwrap().contains("pg_dump"));
        let reader = InterchangeReader::open(BufReader::new(File::open(&out).unwrap())).unwrap();
        assert_eq!(reader.header().engine, Engine::Sqlite);
    }

    #[test]
    fn test_schema_fallback_is_sql_text() {
        let dir = TempDir::new().unwrap();
        let tools = ToolsConfig {
            disabled: true,
            ..Default::default()
        };
        let out = dir.path().join("raw");
        let outcome = EngineAdapter::new(Engine::MySql, &tools)
            .backup(&server_config(), BackupType::Schema, ArtifactFormat::Native, &out, &local(&dir))
            .unwrap();
        assert_eq!(outcome.format, ArtifactFormat::Sql);
        assert!(std::fs::read_to_string(&out).unwrap().contains("CREATE TABLE"));
    }

    #[test]
    fn test_interchange_skips_native_tools() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("raw");
        let outcome = EngineAdapter::new(Engine::Postgres, &ToolsConfig::default())
            .backup(&server_config(), BackupType::Data, ArtifactFormat::Interchange, &out, &local(&dir))
            .unwrap();
        assert_eq!(outcome.format, ArtifactFormat::Interchange);
        assert!(outcome.fallback_reason.is_none());
    }
}
