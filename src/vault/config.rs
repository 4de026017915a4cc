use crate::vault::admin_account::AdminAccountConfig;
use crate::vault::compress::CompressorConfig;
use crate::vault::encrypt::EncryptorConfig;
use crate::vault::engine::tool::ToolsConfig;
use crate::vault::import::table_groups::TableGroups;
use crate::vault::maintenance::ScheduleConfig;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use crate::vault::retention::RetentionConfig;
use crate::vault::validate::{validate_file_name, validate_writable_dir};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

fn default_workers() -> usize {
    2
}

fn default_setup_token_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_catalog_file() -> String {
    "catalog.sqlite3".to_owned()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Catalog, connection settings and scratch files
    #[validate(custom(function = validate_writable_dir))]
    pub data_dir: PathBuf,
    /// Artifacts, `<data_dir>/backups` when unset
    #[validate(custom(function = validate_writable_dir))]
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_catalog_file")]
    #[validate(custom(function = validate_file_name))]
    pub catalog_file: String,
    /// Size of the restore/import and backup worker pools
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    #[validate(nested)]
    pub encryptor: EncryptorConfig,
    #[serde(default)]
    #[validate(nested)]
    pub tools: ToolsConfig,
    #[serde(default)]
    #[validate(nested)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub table_groups: TableGroups,
    /// Account reset after every restore and created by the bootstrap wizard
    #[validate(nested)]
    pub admin_account: Option<AdminAccountConfig>,
    #[serde(default = "default_setup_token_ttl", with = "humantime_serde")]
    pub setup_token_ttl: Duration,
    #[serde(default = "default_bcrypt_cost")]
    #[validate(range(min = 4, max = 31))]
    pub bcrypt_cost: u32,
}

impl VaultConfig {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<VaultConfig> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .with_msg(format!("Open config failed: {path:?}"))
            .and_then(|f| {
                serde_yml::from_reader::<_, VaultConfig>(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {path:?}"))
            })
            .and_then(|config| {
                config
                    .validate()
                    .map_err(Error::from)
                    .map(|_| config)
                    .with_msg(format!("Config validation failed: {path:?}"))
            })
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(&self.catalog_file)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("connections.yml")
    }

    /// Decoded artifacts and other scratch files of running jobs.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }
}
