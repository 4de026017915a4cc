//! Backups as audited events: every request leaves a [`BackupRecord`], failed
//! ones included, and a record only reaches `completed` once its artifact is on
//! disk with a checksum.

use crate::vault::artifact::{artifact_file_name, encode_artifact, ArtifactFormat};
use crate::vault::catalog::Catalog;
use crate::vault::checksum::{sha256_file, verify_file};
use crate::vault::compress::CompressorConfig;
use crate::vault::encrypt::EncryptorConfig;
use crate::vault::engine::tool::ToolsConfig;
use crate::vault::engine::EngineAdapter;
use crate::vault::function_path;
use crate::vault::model::backup_record::{BackupRecord, BackupStatus, BackupType};
use crate::vault::model::connection::ConnectionConfig;
use crate::vault::registry::ConnectionRegistry;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::{WithDebugObjectAndFnName, WithMsg};
use bon::Builder;
use chrono::Utc;
use function_name::named;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, Builder)]
pub struct BackupRequest {
    /// Active connection when unset
    pub connection_id: Option<Uuid>,
    #[builder(default = BackupType::Full)]
    pub backup_type: BackupType,
    /// Engine default for the backup type when unset
    pub format: Option<ArtifactFormat>,
    #[builder(default)]
    pub compress: bool,
    #[builder(default)]
    pub encrypt: bool,
    #[builder(into, default = "admin".to_owned())]
    pub actor: String,
}

pub struct BackupService {
    catalog: Arc<Catalog>,
    registry: Arc<ConnectionRegistry>,
    tools: ToolsConfig,
    compressor: CompressorConfig,
    encryptor: EncryptorConfig,
    backup_dir: PathBuf,
    pool: Arc<ThreadPool>,
}

impl BackupService {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ConnectionRegistry>,
        tools: ToolsConfig,
        compressor: CompressorConfig,
        encryptor: EncryptorConfig,
        backup_dir: PathBuf,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            catalog,
            registry,
            tools,
            compressor,
            encryptor,
            backup_dir,
            pool,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Runs a backup to the end. Failures after the record exists are stored
    /// in it and returned as a `failed` record, not as an error.
    pub fn create_backup(&self, request: &BackupRequest) -> Result<BackupRecord> {
        let (target, record) = self.open_record(request)?;
        Ok(self.run(&target, request, record))
    }

    /// Stores a `pending` record and leaves the work to the worker pool.
    pub fn request_backup(self: &Arc<Self>, request: BackupRequest) -> Result<Uuid> {
        let (target, record) = self.open_record(&request)?;
        let id = record.id;
        let service = self.clone();
        self.pool.spawn(move || {
            service.run(&target, &request, record);
        });
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        self.catalog.list_backups()
    }

    pub fn get(&self, id: Uuid) -> Result<BackupRecord> {
        self.catalog
            .get_backup(id)?
            .ok_or_else(|| Error::not_found("backup", id.to_string()))
    }

    /// Location of a finished artifact, for download.
    pub fn artifact_path(&self, id: Uuid) -> Result<PathBuf> {
        let record = self.get(id)?;
        if !record.status.is_restorable() {
            return Err(Error::invalid_state(format!(
                "backup {id} is {}, it has no artifact",
                record.status
            )));
        }
        let path = record
            .location
            .ok_or_else(|| Error::not_found("artifact of backup", id.to_string()))?;
        if !path.is_file() {
            return Err(Error::not_found("artifact file", path.to_string_lossy()));
        }
        Ok(path)
    }

    /// Removes the record, then its artifact. Records still being written and
    /// backups an unfinished restore job reads from are refused.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let record = self.get(id)?;
        if self.catalog.backups_in_use()?.contains(&id) {
            return Err(Error::invalid_state(format!(
                "backup {id} is read by a restore job that has not finished"
            )));
        }
        if !self.catalog.delete_backup(id)? {
            return Err(Error::invalid_state(format!(
                "backup {id} is {}, it cannot be deleted yet",
                record.status
            )));
        }
        if let Some(path) = record.location.filter(|p| p.exists()) {
            std::fs::remove_file(&path)
                .map_err(Error::from)
                .with_msg(format!("Deleting artifact {path:?} failed"))?;
        }
        info!("Deleted backup {id}");
        Ok(())
    }

    /// Moves backups a previous process left `pending` or `in_progress` to `failed`.
    pub fn fail_interrupted(&self) -> Result<Vec<Uuid>> {
        let failed = self
            .catalog
            .fail_unfinished_backups("backup was interrupted before it finished; the engine restarted")?;
        if !failed.is_empty() {
            warn!("Marked {} interrupted backup(s) as failed", failed.len());
        }
        Ok(failed)
    }

    /// Recomputes the artifact checksum; a mismatch is a `Format` error.
    pub fn verify(&self, id: Uuid) -> Result<BackupRecord> {
        let path = self.artifact_path(id)?;
        let record = self.get(id)?;
        let expected = record
            .checksum
            .as_deref()
            .ok_or_else(|| Error::format(format!("backup {id} has no recorded checksum")))?;
        verify_file(&path, expected)?;
        Ok(record)
    }

    fn open_record(&self, request: &BackupRequest) -> Result<(ConnectionConfig, BackupRecord)> {
        let target = match request.connection_id {
            Some(id) => self.registry.get(id)?,
            None => self.registry.require_active()?,
        };
        let record = BackupRecord {
            id: Uuid::new_v4(),
            connection_id: Some(target.id),
            backup_type: request.backup_type,
            engine: target.engine,
            format: request
                .format
                .unwrap_or_else(|| ArtifactFormat::default_for(target.engine, request.backup_type))
                .supported_by(target.engine),
            location: None,
            size_bytes: None,
            checksum: None,
            compressed: false,
            encrypted: false,
            status: BackupStatus::Pending,
            error_message: None,
            created_by: request.actor.clone(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.catalog.insert_backup(&record)?;
        Ok((target, record))
    }

    fn run(&self, target: &ConnectionConfig, request: &BackupRequest, mut record: BackupRecord) -> BackupRecord {
        let id = record.id;
        let result = self
            .catalog
            .set_backup_status(id, BackupStatus::InProgress, None)
            .and_then(|moved| {
                if moved {
                    Ok(())
                } else {
                    Err(Error::invalid_state(format!("backup {id} is no longer pending")))
                }
            })
            .and_then(|_| self.write_artifact(target, request, &mut record));

        match result {
            Ok(()) => {
                info!(
                    "Backup {} of {} completed: {:?}",
                    record.id,
                    target.label(),
                    record.location
                );
                record
            }
            Err(e) => {
                error!("Backup {} of {} failed: {e}", record.id, target.label());
                let message = e.to_string();
                if let Err(e2) = self
                    .catalog
                    .set_backup_status(record.id, BackupStatus::Failed, Some(&message))
                {
                    error!("Recording failure of backup {} failed: {e2}", record.id);
                }
                record.status = BackupStatus::Failed;
                record.error_message = Some(message);
                record.completed_at = Some(Utc::now());
                record
            }
        }
    }

    #[named]
    fn write_artifact(
        &self,
        target: &ConnectionConfig,
        request: &BackupRequest,
        record: &mut BackupRecord,
    ) -> Result<()> {
        let raw = tempfile::Builder::new()
            .prefix(".raw-")
            .suffix(".tmp")
            .tempfile_in(&self.backup_dir)?
            .into_temp_path();
        let outcome = EngineAdapter::new(target.engine, &self.tools)
            .backup(target, record.backup_type, record.format, &raw, self.registry.as_ref())
            .with_debug_object_and_fn_name(target.label(), function_path!())?;
        if let Some(reason) = &outcome.fallback_reason {
            warn!(
                "Backup {} written as {} instead of {}: {reason}",
                record.id, outcome.format, record.format
            );
        }

        let compressor = self.compressor.effective(request.compress);
        let encryptor = if request.encrypt && self.encryptor.is_none() {
            warn!(
                "Encryption requested for backup {} but no passphrase is configured, writing it unencrypted",
                record.id
            );
            EncryptorConfig::None
        } else {
            self.encryptor.effective(request.encrypt)
        };

        let out = self.backup_dir.join(artifact_file_name(
            target.engine,
            record.backup_type,
            outcome.format,
            record.created_at,
            &compressor,
            &encryptor,
        ));
        encode_artifact(&raw, &out, &compressor, &encryptor)?;

        record.format = outcome.format;
        record.size_bytes = Some(std::fs::metadata(&out)?.len());
        record.checksum = Some(sha256_file(&out)?);
        record.location = Some(out);
        record.compressed = !compressor.is_none();
        record.encrypted = !encryptor.is_none();
        record.completed_at = Some(Utc::now());
        if !self.catalog.complete_backup(record)? {
            return Err(Error::invalid_state(format!(
                "backup {} changed status while it was written",
                record.id
            )));
        }
        record.status = BackupStatus::Completed;
        info!("Backup {} used {}", record.id, outcome.method);
        Ok(())
    }
}
