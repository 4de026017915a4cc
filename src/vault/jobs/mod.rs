//! Restore and import jobs: queued on the bounded worker pool, one per target,
//! progress persisted in the catalog so any process can poll it.

pub mod progress;

use crate::vault::catalog::Catalog;
use crate::vault::import::{ImportEngine, ImportRequest};
use crate::vault::jobs::progress::{progress_from_log, JobReporter, JobStep};
use crate::vault::model::backup_record::BackupStatus;
use crate::vault::model::connection::ConnectionConfig;
use crate::vault::model::import_job::{
    ConflictResolution, ErrorDetails, ImportJob, ImportMode, ImportStats, JobKind, JobSource,
    JobStatus,
};
use crate::vault::registry::locks::TargetGuard;
use crate::vault::registry::ConnectionRegistry;
use crate::vault::restore::{RestoreOutcome, RestorePlan, RestoreService, RestoreSource};
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::{unpoison, Result};
use chrono::Utc;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What a poller sees of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_step: JobStep,
    pub log: String,
    pub stats: ImportStats,
    pub error_details: Option<ErrorDetails>,
}

/// Persists one job's log and progress. Percentages never go backwards.
struct CatalogReporter {
    catalog: Arc<Catalog>,
    job_id: Uuid,
    cancelled: Arc<AtomicBool>,
    percent: AtomicU8,
}

impl JobReporter for CatalogReporter {
    fn log(&self, line: &str) {
        info!("[job {}] {}", self.job_id, line);
        if let Err(e) = self.catalog.append_job_log(self.job_id, line) {
            warn!("Appending to log of job {} failed: {}", self.job_id, e);
        }
    }

    fn step(&self, step: JobStep, percent: u8) {
        let percent = percent.min(100);
        if self.percent.fetch_max(percent, Ordering::SeqCst) > percent {
            return;
        }
        if let Err(e) = self
            .catalog
            .insert_progress(self.job_id, step, percent, step.milestone())
        {
            warn!("Recording progress of job {} failed: {}", self.job_id, e);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

type JobBody = Box<dyn FnOnce(&dyn JobReporter) -> Result<RestoreOutcome> + Send>;

pub struct ImportJobTracker {
    catalog: Arc<Catalog>,
    registry: Arc<ConnectionRegistry>,
    restore: Arc<RestoreService>,
    imports: Arc<ImportEngine>,
    pool: ThreadPool,
    cancel_flags: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl ImportJobTracker {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ConnectionRegistry>,
        restore: Arc<RestoreService>,
        imports: Arc<ImportEngine>,
        workers: usize,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("k_dbvault-job-{i}"))
            .build()?;
        Ok(Self {
            catalog,
            registry,
            restore,
            imports,
            pool,
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Moves jobs a previous process left unfinished to `failed`.
    pub fn fail_interrupted(&self) -> Result<Vec<Uuid>> {
        let details = ErrorDetails::from(&Error::invalid_state(
            "job was interrupted before it finished; the engine restarted",
        ));
        let failed = self.catalog.fail_unfinished_jobs(&details)?;
        if !failed.is_empty() {
            warn!("Marked {} interrupted job(s) as failed", failed.len());
        }
        Ok(failed)
    }

    /// Queues a restore of a backup into `target` (the active connection
    /// when `None`) and returns the job id.
    pub fn submit_restore(
        &self,
        backup_id: Uuid,
        target: Option<Uuid>,
        clear_data: bool,
    ) -> Result<Uuid> {
        let record = self
            .catalog
            .get_backup(backup_id)?
            .ok_or_else(|| Error::not_found("backup", backup_id.to_string()))?;
        if !record.status.is_restorable() {
            return Err(Error::invalid_state(format!(
                "backup {} is {}, only completed backups can be restored",
                record.id, record.status
            )));
        }
        let target = self.target(target)?;
        let guard = self.registry.lock_target(&target)?;

        let job = new_job(
            JobKind::Restore,
            JobSource::Backup { backup_id },
            &target,
            ImportMode::Full,
            clear_data,
            vec![],
            ConflictResolution::Overwrite,
        );
        let restore = self.restore.clone();
        let config = target.clone();
        let body: JobBody = Box::new(move |reporter: &dyn JobReporter| {
            restore.restore(
                &RestoreSource::Backup(record),
                &config,
                &RestorePlan::restore(clear_data),
                reporter,
            )
        });
        self.spawn(job, guard, body, Some(backup_id))
    }

    /// Queues an import of an uploaded file.
    pub fn submit_import(&self, request: ImportRequest, target: Option<Uuid>) -> Result<Uuid> {
        if !request.file.is_file() {
            return Err(Error::not_found("file", request.file.display().to_string()));
        }
        self.imports.plan(&request)?;
        let target = self.target(target)?;
        let guard = self.registry.lock_target(&target)?;

        let job = new_job(
            JobKind::Import,
            JobSource::File {
                path: request.file.clone(),
            },
            &target,
            request.mode,
            request.clear_data,
            request.table_groups.clone(),
            request.conflict_resolution,
        );
        let imports = self.imports.clone();
        let config = target.clone();
        let body: JobBody = Box::new(move |reporter: &dyn JobReporter| {
            imports.import(&request, &config, reporter)
        });
        self.spawn(job, guard, body, None)
    }

    fn target(&self, id: Option<Uuid>) -> Result<ConnectionConfig> {
        match id {
            Some(id) => self.registry.get(id),
            None => self.registry.require_active(),
        }
    }

    fn spawn(
        &self,
        job: ImportJob,
        guard: TargetGuard,
        body: JobBody,
        restored_backup: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = job.id;
        self.catalog.insert_job(&job)?;
        let cancelled = Arc::new(AtomicBool::new(false));
        unpoison(self.cancel_flags.lock(), "job cancel flags")?.insert(id, cancelled.clone());

        let reporter = CatalogReporter {
            catalog: self.catalog.clone(),
            job_id: id,
            cancelled,
            percent: AtomicU8::new(0),
        };
        reporter.enter(JobStep::Queued);

        let catalog = self.catalog.clone();
        let flags = self.cancel_flags.clone();
        self.pool.spawn(move || {
            run_job(&catalog, &reporter, body, restored_backup);
            match flags.lock() {
                Ok(mut flags) => {
                    flags.remove(&id);
                }
                Err(e) => error!("Cancel flags lock poisoned: {e}"),
            }
            drop(guard);
        });
        info!("Queued {} job {}", job.kind, id);
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Result<JobStatusView> {
        let job = self
            .catalog
            .get_job(id)?
            .ok_or_else(|| Error::not_found("job", id.to_string()))?;
        let (step, percent) = match self.catalog.latest_progress(id)? {
            Some(event) => (event.step, event.percent),
            None => progress_from_log(&job.log),
        };
        let (current_step, progress_percent) = match job.status {
            JobStatus::Completed => (JobStep::Finished, 100),
            _ => (step, percent),
        };
        Ok(JobStatusView {
            id,
            kind: job.kind,
            status: job.status,
            progress_percent,
            current_step,
            log: job.log,
            stats: job.stats,
            error_details: job.error_details,
        })
    }

    pub fn list(&self, limit: usize) -> Result<Vec<ImportJob>> {
        self.catalog.list_jobs(limit)
    }

    /// Asks a queued or running job to stop. It fails as cancelled at its
    /// next checkpoint.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        if let Some(flag) = unpoison(self.cancel_flags.lock(), "job cancel flags")?.get(&id) {
            flag.store(true, Ordering::SeqCst);
            info!("Cancellation requested for job {id}");
            return Ok(());
        }
        match self.catalog.get_job(id)? {
            None => Err(Error::not_found("job", id.to_string())),
            Some(job) => Err(Error::invalid_state(format!(
                "job {id} is already {}",
                job.status
            ))),
        }
    }

    /// Polls until the job finished.
    pub fn wait(&self, id: Uuid, poll: Duration) -> Result<JobStatusView> {
        loop {
            let view = self.status(id)?;
            if view.status.is_finished() {
                return Ok(view);
            }
            std::thread::sleep(poll);
        }
    }
}

fn new_job(
    kind: JobKind,
    source: JobSource,
    target: &ConnectionConfig,
    mode: ImportMode,
    clear_data: bool,
    table_groups: Vec<String>,
    conflict_resolution: ConflictResolution,
) -> ImportJob {
    ImportJob {
        id: Uuid::new_v4(),
        kind,
        source,
        target_id: target.id,
        mode,
        clear_data,
        table_groups,
        conflict_resolution,
        status: JobStatus::Pending,
        log: String::new(),
        stats: ImportStats::default(),
        error_details: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

fn run_job(
    catalog: &Catalog,
    reporter: &CatalogReporter,
    body: JobBody,
    restored_backup: Option<Uuid>,
) {
    let id = reporter.job_id;
    let result = reporter.check_cancelled().and_then(|_| {
        if catalog.transition_job(id, JobStatus::Processing, None, None)? {
            Ok(())
        } else {
            Err(Error::invalid_state(format!("job {id} is no longer pending")))
        }
    });
    let result = result.and_then(|_| {
        catch_unwind(AssertUnwindSafe(|| body(reporter))).unwrap_or_else(|payload| {
            Err(Error::invalid_state(format!(
                "job worker panicked: {}",
                panic_message(payload)
            )))
        })
    });

    let finished = match result {
        Ok(outcome) => {
            for warning in &outcome.warnings {
                reporter.log(&format!("WARNING: {warning}"));
            }
            if let Some(backup_id) = restored_backup {
                if let Err(e) = catalog.set_backup_status(backup_id, BackupStatus::Restored, None) {
                    warn!("Marking backup {backup_id} restored failed: {e}");
                }
            }
            reporter.enter(JobStep::Finished);
            catalog.transition_job(id, JobStatus::Completed, Some(&outcome.stats), None)
        }
        Err(e) => {
            error!("Job {id} failed: {e}");
            let details = ErrorDetails::from(&e);
            reporter.log(&format!("ERROR: {e}"));
            catalog.transition_job(id, JobStatus::Failed, None, Some(&details))
        }
    };
    match finished {
        Ok(true) => {}
        Ok(false) => warn!("Job {id} was already finished"),
        Err(e) => error!("Recording the end of job {id} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::checksum::sha256_file;
    use crate::vault::engine::export::export_interchange;
    use crate::vault::engine::tool::ToolsConfig;
    use crate::vault::import::table_groups::TableGroups;
    use crate::vault::model::backup_record::{BackupRecord, BackupType};
    use crate::vault::model::connection::{Engine, NewConnection};
    use crate::vault::driver::sqlite::SqliteDriver;
    use crate::vault::artifact::ArtifactFormat;
    use crate::vault::registry::settings_file::SettingsFile;
    use crate::vault::result_error::error::ErrorKind;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<Catalog>,
        registry: Arc<ConnectionRegistry>,
        tracker: ImportJobTracker,
        target: PathBuf,
        artifact: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let registry = Arc::new(
            ConnectionRegistry::new(
                SettingsFile::new(dir.path().join("connections.yml")),
                catalog.clone(),
            )
            .unwrap(),
        );
        let target = dir.path().join("app.db");
        registry
            .add(
                NewConnection::builder()
                    .name("app")
                    .engine(Engine::Sqlite)
                    .database(target.to_string_lossy().to_string())
                    .build(),
            )
            .unwrap();

        let src = dir.path().join("src.db");
        rusqlite::Connection::open(&src)
            .unwrap()
            .execute_batch(
                "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO customers VALUES (1, 'Ada'), (2, 'Grace');",
            )
            .unwrap();
        let artifact = dir.path().join("full.jsonl");
        export_interchange(&mut SqliteDriver::open(&src).unwrap(), BackupType::Full, &artifact)
            .unwrap();

        let restore = Arc::new(
            RestoreService::builder()
                .opener(registry.clone())
                .tools(ToolsConfig {
                    disabled: true,
                    ..Default::default()
                })
                .work_dir(dir.path())
                .build(),
        );
        let imports = Arc::new(ImportEngine::new(restore.clone(), TableGroups::default()));
        let tracker =
            ImportJobTracker::new(catalog.clone(), registry.clone(), restore, imports, 2).unwrap();
        Fixture {
            _dir: dir,
            catalog,
            registry,
            tracker,
            target,
            artifact,
        }
    }

    fn completed_backup(f: &Fixture) -> BackupRecord {
        let record = BackupRecord {
            id: Uuid::new_v4(),
            connection_id: None,
            backup_type: BackupType::Full,
            engine: Engine::Sqlite,
            format: ArtifactFormat::Interchange,
            location: Some(f.artifact.clone()),
            size_bytes: None,
            checksum: Some(sha256_file(&f.artifact).unwrap()),
            compressed: false,
            encrypted: false,
            status: BackupStatus::Completed,
            error_message: None,
            created_by: "test".into(),
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        f.catalog.insert_backup(&record).unwrap();
        record
    }

    fn customers(path: &Path) -> i64 {
        rusqlite::Connection::open(path)
            .unwrap()
            .query_row("SELECT count(*) FROM customers", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_restore_job_completes_and_marks_backup() {
        let f = fixture();
        let record = completed_backup(&f);
        let id = f.tracker.submit_restore(record.id, None, true).unwrap();
        let view = f.tracker.wait(id, Duration::from_millis(20)).unwrap();
        assert_eq!(view.status, JobStatus::Completed, "{}", view.log);
        assert_eq!(view.progress_percent, 100);
        assert_eq!(view.stats.imported, 2);
        assert!(view.log.contains(JobStep::Queued.milestone()));
        assert_eq!(customers(&f.target), 2);
        assert_eq!(
            f.catalog.get_backup(record.id).unwrap().unwrap().status,
            BackupStatus::Restored
        );
        assert!(!f.registry.locks().is_locked(f.registry.require_active().unwrap().id).unwrap());
    }

    #[test]
    fn test_failed_job_keeps_error_details() {
        let f = fixture();
        let record = completed_backup(&f);
        std::fs::write(&f.artifact, "tampered").unwrap();
        let id = f.tracker.submit_restore(record.id, None, false).unwrap();
        let view = f.tracker.wait(id, Duration::from_millis(20)).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        let details = view.error_details.unwrap();
        assert_eq!(details.kind, ErrorKind::Format);
        assert!(!details.suggestions.is_empty());
        assert!(view.log.contains("ERROR:"));
    }

    #[test]
    fn test_second_job_on_target_is_busy() {
        let f = fixture();
        let target = f.registry.require_active().unwrap();
        let _held = f.registry.lock_target(&target).unwrap();
        let err = f
            .tracker
            .submit_import(
                ImportRequest {
                    file: f.artifact.clone(),
                    mode: ImportMode::Merge,
                    clear_data: false,
                    table_groups: vec![],
                    conflict_resolution: ConflictResolution::Skip,
                },
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(f.tracker.list(10).unwrap().is_empty());
    }

    #[test]
    fn test_import_job_status_only_moves_forward() {
        let f = fixture();
        let id = f
            .tracker
            .submit_import(
                ImportRequest {
                    file: f.artifact.clone(),
                    mode: ImportMode::Full,
                    clear_data: true,
                    table_groups: vec![],
                    conflict_resolution: ConflictResolution::Skip,
                },
                None,
            )
            .unwrap();
        let mut seen = vec![];
        loop {
            let view = f.tracker.status(id).unwrap();
            if seen.last() != Some(&(view.status, view.progress_percent)) {
                seen.push((view.status, view.progress_percent));
            }
            if view.status.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(seen
            .windows(2)
            .all(|w| w[0].0 == w[1].0 || w[0].0.can_transition_to(w[1].0)));
        assert_eq!(seen.last().map(|s| s.0), Some(JobStatus::Completed));
    }

    #[test]
    fn test_cancel_and_interrupted_jobs() {
        let f = fixture();
        assert_eq!(
            f.tracker.cancel(Uuid::new_v4()).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let target = f.registry.require_active().unwrap();
        let stale = new_job(
            JobKind::Import,
            JobSource::File {
                path: f.artifact.clone(),
            },
            &target,
            ImportMode::Merge,
            false,
            vec![],
            ConflictResolution::Skip,
        );
        f.catalog.insert_job(&stale).unwrap();
        assert_eq!(f.tracker.fail_interrupted().unwrap(), vec![stale.id]);
        let view = f.tracker.status(stale.id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error_details.unwrap().message.contains("interrupted"));
        assert_eq!(
            f.tracker.cancel(stale.id).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let f = fixture();
        let reporter = CatalogReporter {
            catalog: f.catalog.clone(),
            job_id: Uuid::new_v4(),
            cancelled: Arc::new(AtomicBool::new(true)),
            percent: AtomicU8::new(0),
        };
        let target = f.registry.require_active().unwrap();
        let mut job = new_job(
            JobKind::Import,
            JobSource::File {
                path: f.artifact.clone(),
            },
            &target,
            ImportMode::Merge,
            false,
            vec![],
            ConflictResolution::Skip,
        );
        job.id = reporter.job_id;
        f.catalog.insert_job(&job).unwrap();
        run_job(
            &f.catalog,
            &reporter,
            Box::new(|_: &dyn JobReporter| -> Result<RestoreOutcome> { panic!("body must not run") }),
            None,
        );
        let view = f.tracker.status(job.id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error_details.unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_panicking_job_fails() {
        let f = fixture();
        let target = f.registry.require_active().unwrap();
        let job = new_job(
            JobKind::Restore,
            JobSource::Backup {
                backup_id: Uuid::new_v4(),
            },
            &target,
            ImportMode::Full,
            false,
            vec![],
            ConflictResolution::Overwrite,
        );
        f.catalog.insert_job(&job).unwrap();
        let reporter = CatalogReporter {
            catalog: f.catalog.clone(),
            job_id: job.id,
            cancelled: Arc::new(AtomicBool::new(false)),
            percent: AtomicU8::new(0),
        };
        run_job(
            &f.catalog,
            &reporter,
            Box::new(|_: &dyn JobReporter| -> Result<RestoreOutcome> { panic!("boom") }),
            None,
        );
        let view = f.tracker.status(job.id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error_details.unwrap().message.contains("boom"));
    }
}
