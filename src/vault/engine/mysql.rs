use crate::vault::artifact::ArtifactFormat;
use crate::vault::engine::tool::{connection_args, Tool, ToolsConfig};
use crate::vault::engine::NativeRestore;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::ConnectionConfig;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use std::path::Path;

/// `mysqldump` and the `mysql` client. There is no binary dump format, the
/// native artifact is SQL text.
#[derive(Clone, Debug)]
pub struct MySqlAdapter {
    tools: ToolsConfig,
}

impl MySqlAdapter {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    pub fn native_backup(
        &self,
        config: &ConnectionConfig,
        backup_type: BackupType,
        out: &Path,
    ) -> Result<String> {
        let mut cmd = connection_args(&self.tools, Tool::MySqlDump, config).args([
            "--single-transaction",
            "--skip-lock-tables",
            "--no-tablespaces",
        ]);
        match backup_type {
            BackupType::Schema => cmd = cmd.arg("--no-data"),
            BackupType::Data => cmd = cmd.arg("--no-create-info"),
            BackupType::Full => {}
        }
        let cmd = cmd
            .arg(format!("--result-file={}", out.display()))
            .arg(config.database.as_str());
        cmd.run()?;
        Ok(cmd.display())
    }

    pub fn native_restore(&self, config: &ConnectionConfig, restore: &NativeRestore) -> Result<String> {
        if restore.format != ArtifactFormat::Sql {
            return Err(Error::tool_unavailable(
                Tool::MySql.binary(),
                format!("the mysql client only loads SQL text, not {} artifacts", restore.format),
            ));
        }
        let cmd = connection_args(&self.tools, Tool::MySql, config)
            .arg(config.database.as_str())
            .stdin_file(restore.artifact);
        cmd.run()?;
        Ok(cmd.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::model::connection::Engine;
    use crate::vault::result_error::error::ErrorKind;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_only_sql_text_has_a_native_loader() {
        let config = ConnectionConfig {
            id: Uuid::new_v4(),
            name: "my".into(),
            engine: Engine::MySql,
            host: Some("127.0.0.1".into()),
            port: None,
            username: Some("root".into()),
            password: Some("pw".into()),
            database: "shop".into(),
            is_active: false,
            is_default: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let err = MySqlAdapter::new(ToolsConfig::default())
            .native_restore(
                &config,
                &NativeRestore {
                    artifact: Path::new("shop.sqlite3"),
                    format: ArtifactFormat::Native,
                    source_engine: Some(Engine::Sqlite),
                    clean: false,
                    whole_database: false,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
    }
}
