//! `connections.yml`: every connection config with its credentials. This file,
//! not the catalog, decides which connection is active.

use crate::vault::model::connection::ConnectionConfig;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

static SETTINGS_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Clone, Debug)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty registry.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let file = File::open(&self.path)?;
        serde_yml::from_reader(BufReader::new(file))
            .map_err(Error::from)
            .with_msg(format!("Parse connection settings failed: {:?}", self.path))
    }

    /// Replaces the file atomically. The content is written to a sibling temp
    /// file readable by the owner only, then renamed over the old one.
    pub fn store(&self, connections: &[ConnectionConfig]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let settings = Settings {
            version: SETTINGS_VERSION,
            connections: connections.to_vec(),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        serde_yml::to_writer(&mut tmp, &settings)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::from(e.error))
            .with_msg(format!("Write connection settings failed: {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::model::connection::Engine;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            id: Uuid::new_v4(),
            name: "main".into(),
            engine: Engine::MySql,
            host: Some("db".into()),
            port: Some(3307),
            username: Some("app".into()),
            password: Some("hunter22".into()),
            database: "shop".into(),
            is_active: true,
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(dir.path().join("connections.yml"));
        assert!(file.load().unwrap().connections.is_empty());
    }

    #[test]
    fn test_store_keeps_credentials() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(dir.path().join("nested/connections.yml"));
        let c = config();
        file.store(std::slice::from_ref(&c)).unwrap();

        let loaded = file.load().unwrap();
        assert_eq!(loaded.version, SETTINGS_VERSION);
        assert_eq!(loaded.connections, vec![c]);
        assert_eq!(loaded.connections[0].password_str(), Some("hunter22"));
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(dir.path().join("connections.yml"));
        file.store(&[config()]).unwrap();
        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
