use crate::vault::artifact::ArtifactFormat;
use crate::vault::engine::tool::{connection_args, Tool, ToolsConfig};
use crate::vault::engine::NativeRestore;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use std::path::Path;

/// `pg_dump`, `pg_restore` and `psql` driven with ownership and privileges
/// left out, so an archive taken as one role applies cleanly as another.
#[derive(Clone, Debug)]
pub struct PostgresAdapter {
    tools: ToolsConfig,
}

impl PostgresAdapter {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    pub fn native_backup(
        &self,
        config: &ConnectionConfig,
        backup_type: BackupType,
        format: ArtifactFormat,
        out: &Path,
    ) -> Result<String> {
        let mut cmd = connection_args(&self.tools, Tool::PgDump, config)
            .arg(match format {
                ArtifactFormat::Native => "--format=custom",
                _ => "--format=plain",
            })
            .args(["--no-owner", "--no-privileges"]);
        match backup_type {
            BackupType::Schema => cmd = cmd.arg("--schema-only"),
            BackupType::Data => cmd = cmd.arg("--data-only"),
            BackupType::Full => {}
        }
        if format == ArtifactFormat::Sql && backup_type.has_schema() {
            cmd = cmd.args(["--clean", "--if-exists"]);
        }
        let cmd = cmd
            .args(["--file", out.to_string_lossy().as_ref()])
            .args(["--dbname", config.database.as_str()]);
        let output = cmd.run()?;
        log_stderr(&output.stderr);
        Ok(cmd.display())
    }

    pub fn native_restore(&self, config: &ConnectionConfig, restore: &NativeRestore) -> Result<String> {
        let path = restore.artifact.to_string_lossy();
        let cmd = match restore.format {
            ArtifactFormat::Native => {
                if restore.source_engine != Some(Engine::Postgres) {
                    return Err(Error::tool_unavailable(
                        Tool::PgRestore.binary(),
                        "artifact is not a Postgres archive",
                    ));
                }
                let mut cmd = connection_args(&self.tools, Tool::PgRestore, config).args([
                    "--no-owner",
                    "--no-privileges",
                    "--single-transaction",
                    "--exit-on-error",
                ]);
                if restore.clean {
                    cmd = cmd.args(["--clean", "--if-exists"]);
                }
                cmd.args(["--dbname", config.database.as_str(), path.as_ref()])
            }
            ArtifactFormat::Sql => connection_args(&self.tools, Tool::Psql, config)
                .args([
                    "--no-psqlrc",
                    "--quiet",
                    "--single-transaction",
                    "--set",
                    "ON_ERROR_STOP=1",
                ])
                .args(["--dbname", config.database.as_str(), "--file", path.as_ref()]),
            ArtifactFormat::Interchange => {
                return Err(Error::tool_unavailable(
                    Tool::PgRestore.binary(),
                    "interchange artifacts have no native loader",
                ))
            }
        };
        let output = cmd.run()?;
        log_stderr(&output.stderr);
        Ok(cmd.display())
    }
}

fn log_stderr(stderr: &str) {
    if !stderr.trim().is_empty() {
        tracing::debug!("Tool stderr:\n{stderr}");
    }
}

/// Tables with definitions or data in a custom-format archive, read from the
/// archive's table of contents.
pub fn archive_tables(tools: &ToolsConfig, archive: &Path) -> Result<Vec<String>> {
    let output = tools
        .command(Tool::PgRestore)
        .args(["--list", archive.to_string_lossy().as_ref()])
        .run()?;
    Ok(parse_toc(&output.stdout))
}

/// Converts a custom-format archive to plain SQL text without touching any
/// database, for the record loader.
pub fn archive_to_sql(tools: &ToolsConfig, archive: &Path, out: &Path) -> Result<()> {
    tools
        .command(Tool::PgRestore)
        .args(["--no-owner", "--no-privileges"])
        .args(["--file", out.to_string_lossy().as_ref()])
        .arg(archive.to_string_lossy())
        .run()?;
    Ok(())
}

/// Entries look like `215; 1259 16386 TABLE public customers app` or
/// `3301; 0 16386 TABLE DATA public customers app`.
fn parse_toc(toc: &str) -> Vec<String> {
    let mut tables: Vec<String> = vec![];
    for line in toc.lines() {
        if line.starts_with(';') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let name = match tokens.as_slice() {
            [id, _, _, "TABLE", "DATA", _schema, name, ..] if id.ends_with(';') => name,
            [id, _, _, "TABLE", _schema, name, ..] if id.ends_with(';') => name,
            _ => continue,
        };
        if !tables.iter().any(|t| t == name) {
            tables.push(name.to_string());
        }
    }
    tables
}
