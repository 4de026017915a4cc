//! The administrative surface: one [`Vault`] wires every service from a
//! [`VaultConfig`] and is what the CLI talks to.

use crate::vault::admin_account::AdminAccount;
use crate::vault::backup_service::BackupService;
use crate::vault::catalog::Catalog;
use crate::vault::config::VaultConfig;
use crate::vault::import::ImportEngine;
use crate::vault::jobs::ImportJobTracker;
use crate::vault::maintenance::MaintenanceScheduler;
use crate::vault::registry::settings_file::SettingsFile;
use crate::vault::registry::ConnectionRegistry;
use crate::vault::restore::RestoreService;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use crate::vault::setup::SetupService;
use getset::Getters;
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use tracing::info;

#[derive(Getters)]
#[getset(get = "pub")]
pub struct Vault {
    config: VaultConfig,
    catalog: Arc<Catalog>,
    registry: Arc<ConnectionRegistry>,
    restore: Arc<RestoreService>,
    imports: Arc<ImportEngine>,
    jobs: ImportJobTracker,
    backups: Arc<BackupService>,
    setup: SetupService,
    maintenance: MaintenanceScheduler,
}

impl Vault {
    /// Opens the catalog and the connection settings, adopts a connection from
    /// the environment when none exists yet and fails jobs and backups a
    /// previous process left unfinished.
    pub fn open(config: VaultConfig) -> Result<Self> {
        let backup_dir = config.backup_dir();
        let work_dir = config.work_dir();
        for dir in [&backup_dir, &work_dir] {
            std::fs::create_dir_all(dir)
                .map_err(Error::from)
                .with_msg(format!("Creating {dir:?} failed"))?;
        }

        let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
        let registry = Arc::new(
            ConnectionRegistry::new(SettingsFile::new(config.settings_path()), catalog.clone())?
                .with_pool_size(config.workers as u32 + 1),
        );
        registry.on_switch(Box::new(|previous, next| {
            info!(
                "Active connection switched from {} to {}",
                previous.map(|c| c.label()).unwrap_or_else(|| "none".to_owned()),
                next.label()
            );
        }))?;
        registry.discover_from_env()?;

        let admin = config
            .admin_account
            .as_ref()
            .map(|a| AdminAccount::new(a, config.bcrypt_cost));
        let restore = Arc::new(
            RestoreService::builder()
                .opener(registry.clone())
                .tools(config.tools.clone())
                .encryptor(config.encryptor.clone())
                .work_dir(work_dir)
                .maybe_admin(admin)
                .build(),
        );
        let imports = Arc::new(ImportEngine::new(restore.clone(), config.table_groups.clone()));
        let jobs = ImportJobTracker::new(
            catalog.clone(),
            registry.clone(),
            restore.clone(),
            imports.clone(),
            config.workers,
        )?;
        jobs.fail_interrupted()?;

        let backup_pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("k_dbvault-backup-{i}"))
            .build()?;
        let backups = Arc::new(BackupService::new(
            catalog.clone(),
            registry.clone(),
            config.tools.clone(),
            config.compressor.clone(),
            config.encryptor.clone(),
            backup_dir,
            Arc::new(backup_pool),
        ));
        backups.fail_interrupted()?;
        let setup = SetupService::new(
            catalog.clone(),
            registry.clone(),
            config.setup_token_ttl,
            config.admin_account.clone().unwrap_or_default(),
            config.bcrypt_cost,
        );
        let maintenance = MaintenanceScheduler::new(
            catalog.clone(),
            backups.clone(),
            config.schedule.clone(),
            config.retention.clone(),
        );

        info!("Vault opened with data in {:?}", config.data_dir);
        Ok(Self {
            config,
            catalog,
            registry,
            restore,
            imports,
            jobs,
            backups,
            setup,
            maintenance,
        })
    }
}
