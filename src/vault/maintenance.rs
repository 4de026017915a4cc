//! Periodic upkeep that runs independently of request traffic: the daily
//! backup, the retention sweep, pruning of job bookkeeping and removal of
//! abandoned temp files. Every run is recorded in the catalog, and a task is
//! due again from its last recorded start, so a failed run never blocks the
//! next one.

use crate::vault::backup_service::{BackupRequest, BackupService};
use crate::vault::catalog::{Catalog, JobExecution};
use crate::vault::function_path;
use crate::vault::model::backup_record::{BackupStatus, BackupType};
use crate::vault::model::text_enum;
use crate::vault::result_error::error::{Error, ErrorKind};
use crate::vault::result_error::result::{convert_error_vec, Result};
use crate::vault::result_error::WithFnName;
use crate::vault::retention::RetentionConfig;
use crate::vault::validate::validate_cron_str;
use chrono::{DateTime, Utc};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};
use validator::Validate;
use walkdir::WalkDir;

static MAX_SLEEP: std::time::Duration = std::time::Duration::from_secs(3600);

fn default_backup_cron() -> String {
    "0 3 * * *".to_owned()
}

fn default_retention_cron() -> String {
    "30 3 * * *".to_owned()
}

fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_true() -> bool {
    true
}

fn default_prune_interval() -> std::time::Duration {
    std::time::Duration::from_secs(24 * 3600)
}

fn default_history_window() -> std::time::Duration {
    std::time::Duration::from_secs(30 * 24 * 3600)
}

fn default_stale_tmp_age() -> std::time::Duration {
    std::time::Duration::from_secs(24 * 3600)
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default = "default_backup_cron")]
    #[validate(custom(function = validate_cron_str))]
    pub backup_cron: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Only effective with a configured encryptor
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default = "default_retention_cron")]
    #[validate(custom(function = validate_cron_str))]
    pub retention_cron: String,
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: std::time::Duration,
    /// Executions and progress events older than this are pruned
    #[serde(default = "default_history_window", with = "humantime_serde")]
    pub history_window: std::time::Duration,
    /// Minimum age of a `*.tmp` file in the backup directory before it is removed
    #[serde(default = "default_stale_tmp_age", with = "humantime_serde")]
    pub stale_tmp_age: std::time::Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup_cron: default_backup_cron(),
            backup_type: default_backup_type(),
            compress: true,
            encrypt: true,
            retention_cron: default_retention_cron(),
            prune_interval: default_prune_interval(),
            history_window: default_history_window(),
            stale_tmp_age: default_stale_tmp_age(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaintenanceTask {
    DailyBackup,
    RetentionSweep,
    PruneHistory,
    StaleTempCleanup,
}

text_enum!(MaintenanceTask {
    DailyBackup => "daily_backup",
    RetentionSweep => "retention_sweep",
    PruneHistory => "prune_history",
    StaleTempCleanup => "stale_temp_cleanup",
});

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        MaintenanceTask::DailyBackup,
        MaintenanceTask::RetentionSweep,
        MaintenanceTask::PruneHistory,
        MaintenanceTask::StaleTempCleanup,
    ];
}

pub struct MaintenanceScheduler {
    catalog: Arc<Catalog>,
    backups: Arc<BackupService>,
    schedule: ScheduleConfig,
    retention: RetentionConfig,
}

impl MaintenanceScheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        backups: Arc<BackupService>,
        schedule: ScheduleConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            catalog,
            backups,
            schedule,
            retention,
        }
    }

    /// First time at or after the last recorded start the task is due. A task
    /// that never ran is due at once.
    pub fn next_due(&self, task: MaintenanceTask) -> Result<DateTime<Utc>> {
        let last = self
            .catalog
            .last_execution(task.as_str())?
            .map(|e| e.started_at)
            .unwrap_or(DateTime::UNIX_EPOCH);
        match task {
            MaintenanceTask::DailyBackup => next_cron(&self.schedule.backup_cron, &last),
            MaintenanceTask::RetentionSweep => next_cron(&self.schedule.retention_cron, &last),
            MaintenanceTask::PruneHistory | MaintenanceTask::StaleTempCleanup => {
                Ok(last + to_chrono(self.schedule.prune_interval)?)
            }
        }
    }

    /// Runs every task due at `now` and records each run.
    pub fn run_pending(&self, now: DateTime<Utc>) -> Vec<JobExecution> {
        let mut executions = vec![];
        for task in MaintenanceTask::ALL {
            match self.next_due(task) {
                Ok(due) if due <= now => executions.push(self.run_task(task, now)),
                Ok(due) => debug!("{task} not due before {due}"),
                Err(e) => error!("Scheduling {task} failed: {e}"),
            }
        }
        executions
    }

    pub fn run_task(&self, task: MaintenanceTask, now: DateTime<Utc>) -> JobExecution {
        info!("Running maintenance task {task}");
        let result = match task {
            MaintenanceTask::DailyBackup => self.daily_backup(),
            MaintenanceTask::RetentionSweep => self.retention_sweep(now),
            MaintenanceTask::PruneHistory => self.prune_history(now),
            MaintenanceTask::StaleTempCleanup => self.clean_stale_temp_files(),
        };
        let execution = JobExecution {
            task: task.to_string(),
            started_at: now,
            finished_at: Utc::now(),
            success: result.is_ok(),
            message: Some(match &result {
                Ok(msg) => msg.clone(),
                Err(e) => e.to_string(),
            }),
        };
        match &result {
            Ok(msg) => info!("Maintenance task {task} finished: {msg}"),
            Err(e) => error!("Maintenance task {task} failed: {e}"),
        }
        if let Err(e) = self.catalog.record_execution(&execution) {
            error!("Recording run of {task} failed: {e}");
        }
        execution
    }

    /// Earliest time any task is due.
    pub fn next_wakeup(&self) -> Result<DateTime<Utc>> {
        MaintenanceTask::ALL
            .iter()
            .map(|t| self.next_due(*t))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .min()
            .ok_or_else(|| Error::invalid_state("no maintenance task is defined"))
    }

    /// Runs due tasks until a message arrives on `shutdown` or its sender is dropped.
    pub fn run_forever(&self, shutdown: Receiver<()>) -> Result<()> {
        loop {
            self.run_pending(Utc::now());
            let now = Utc::now();
            let wait = match self.next_wakeup() {
                Ok(wake) => {
                    info!("Sleeping until {wake}");
                    (wake - now).to_std().unwrap_or_default().min(MAX_SLEEP)
                }
                Err(e) => {
                    warn!("Computing next maintenance run failed, retrying later: {e}");
                    MAX_SLEEP
                }
            };
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    info!("Maintenance scheduler stopped");
                    return Ok(());
                }
            }
        }
    }

    fn daily_backup(&self) -> Result<String> {
        let request = BackupRequest::builder()
            .backup_type(self.schedule.backup_type)
            .compress(self.schedule.compress)
            .encrypt(self.schedule.encrypt)
            .actor("scheduler")
            .build();
        let record = match self.backups.create_backup(&request) {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok("skipped, no active connection".to_owned())
            }
            Err(e) => return Err(e),
        };
        match record.status {
            BackupStatus::Completed => Ok(format!("backup {} completed", record.id)),
            _ => Err(Error::invalid_state(format!(
                "backup {} failed: {}",
                record.id,
                record.error_message.unwrap_or_default()
            ))),
        }
    }

    fn retention_sweep(&self, now: DateTime<Utc>) -> Result<String> {
        let records = self.backups.list()?;
        let in_use = self.catalog.backups_in_use()?;
        let expired = self.retention.select_expired(&records, &in_use, now)?;
        let mut deleted = 0;
        let errors: Vec<Error> = expired
            .iter()
            .filter_map(|r| {
                info!("Removing out of retention backup {} ({:?})", r.id, r.location);
                match self.backups.delete(r.id) {
                    Ok(()) => {
                        deleted += 1;
                        None
                    }
                    Err(e) => Some(e),
                }
            })
            .collect();
        convert_error_vec(errors)?;
        Ok(format!("deleted {deleted} of {} backup(s)", records.len()))
    }

    /// Keeps the latest execution of every task so pruning never makes a task due early.
    fn prune_history(&self, now: DateTime<Utc>) -> Result<String> {
        let mut cutoff = now - to_chrono(self.schedule.history_window)?;
        for task in MaintenanceTask::ALL {
            if let Some(last) = self.catalog.last_execution(task.as_str())? {
                cutoff = cutoff.min(last.started_at);
            }
        }
        let executions = self.catalog.prune_executions(cutoff)?;
        let events = self.catalog.prune_progress(cutoff)?;
        Ok(format!(
            "pruned {executions} execution(s) and {events} progress event(s) before {cutoff}"
        ))
    }

    fn clean_stale_temp_files(&self) -> Result<String> {
        let mut removed = 0;
        let errors: Vec<Error> = self
            .stale_temp_files()?
            .map(|res| {
                res.and_then(|p| {
                    std::fs::remove_file(&p)?;
                    Ok(p)
                })
            })
            .filter_map(|res| match res {
                Ok(p) => {
                    info!("Removed stale temp file {p:?}");
                    removed += 1;
                    None
                }
                Err(e) => Some(e),
            })
            .collect();
        convert_error_vec(errors)?;
        Ok(format!("removed {removed} stale temp file(s)"))
    }

    #[named]
    fn stale_temp_files<'a>(&self) -> Result<DynIter<'a, Result<PathBuf>>> {
        let matcher: GlobMatcher = Glob::new("*.tmp")?.compile_matcher();
        let max_age = self.schedule.stale_tmp_age;
        let now = SystemTime::now();
        let files = WalkDir::new(self.backups.backup_dir())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(move |res| {
                let entry = match res {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(Error::from(e))),
                };
                if !entry.file_type().is_file() || !matcher.is_match(entry.file_name()) {
                    return None;
                }
                let modified = match entry.metadata() {
                    Ok(md) => md.modified().unwrap_or(now),
                    Err(e) => return Some(Err(Error::from(e))),
                };
                let age = now.duration_since(modified).unwrap_or_default();
                (age >= max_age).then(|| Ok(entry.into_path()))
            })
            .map(move |res| res.with_fn_name(function_path!()));
        Ok(files.into_dyn_iter())
    }
}

fn next_cron(cron: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron_parser::parse(cron, after)
        .map_err(|e| Error::invalid_state(format!("Invalid cron string {cron:?}: {e}")))
}

fn to_chrono(d: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::invalid_state(format!("duration {d:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::artifact::ArtifactFormat;
    use crate::vault::compress::CompressorConfig;
    use crate::vault::encrypt::EncryptorConfig;
    use crate::vault::engine::tool::ToolsConfig;
    use crate::vault::model::backup_record::BackupRecord;
    use crate::vault::model::connection::{Engine, NewConnection};
    use crate::vault::registry::settings_file::SettingsFile;
    use crate::vault::registry::ConnectionRegistry;
    use chrono::{Duration, TimeZone};
    use rayon::ThreadPoolBuilder;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        dir: TempDir,
        catalog: Arc<Catalog>,
        scheduler: MaintenanceScheduler,
    }

    fn fixture(schedule: ScheduleConfig, retention: RetentionConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let registry = Arc::new(
            ConnectionRegistry::new(
                SettingsFile::new(dir.path().join("connections.yml")),
                catalog.clone(),
            )
            .unwrap(),
        );
        let db = dir.path().join("app.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        registry
            .add(
                NewConnection::builder()
                    .name("app")
                    .engine(Engine::Sqlite)
                    .database(db.to_string_lossy().to_string())
                    .build(),
            )
            .unwrap();
        let backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&backup_dir).unwrap();
        let backups = Arc::new(BackupService::new(
            catalog.clone(),
            registry,
            ToolsConfig::default(),
            CompressorConfig::None,
            EncryptorConfig::None,
            backup_dir,
            Arc::new(ThreadPoolBuilder::new().num_threads(1).build().unwrap()),
        ));
        let scheduler = MaintenanceScheduler::new(catalog.clone(), backups, schedule, retention);
        Fixture {
            dir,
            catalog,
            scheduler,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 30, 12, 0, 0).unwrap()
    }

    fn old_backup(catalog: &Catalog, days: i64) -> BackupRecord {
        let created_at = now() - Duration::days(days);
        let record = BackupRecord {
            id: Uuid::new_v4(),
            connection_id: None,
            backup_type: BackupType::Full,
            engine: Engine::Sqlite,
            format: ArtifactFormat::Native,
            location: None,
            size_bytes: None,
            checksum: None,
            compressed: false,
            encrypted: false,
            status: BackupStatus::Completed,
            error_message: None,
            created_by: "scheduler".into(),
            created_at,
            completed_at: Some(created_at),
        };
        catalog.insert_backup(&record).unwrap();
        record
    }

    #[test]
    fn test_first_run_executes_every_task_once() {
        let f = fixture(ScheduleConfig::default(), RetentionConfig::default());
        let executions = f.scheduler.run_pending(now());
        assert_eq!(executions.len(), MaintenanceTask::ALL.len());
        assert!(executions.iter().all(|e| e.success), "{executions:?}");
        assert_eq!(
            f.catalog
                .list_backups()
                .unwrap()
                .iter()
                .filter(|r| r.status == BackupStatus::Completed)
                .count(),
            1
        );

        assert!(f.scheduler.run_pending(now()).is_empty());
        let next = f.scheduler.next_due(MaintenanceTask::DailyBackup).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 1, 3, 0, 0).unwrap());
        assert!(f.scheduler.next_wakeup().unwrap() <= next);
    }

    #[test]
    fn test_failed_run_does_not_block_the_next() {
        let f = fixture(ScheduleConfig::default(), RetentionConfig::default());
        std::fs::remove_file(f.dir.path().join("app.db")).unwrap();
        let run = f.scheduler.run_task(MaintenanceTask::DailyBackup, now());
        assert!(!run.success);
        let last = f.catalog.last_execution("daily_backup").unwrap().unwrap();
        assert!(!last.success);

        let next = f.scheduler.next_due(MaintenanceTask::DailyBackup).unwrap();
        let executions = f.scheduler.run_pending(next);
        assert!(executions.iter().any(|e| e.task == "daily_backup"));
    }

    #[test]
    fn test_retention_sweep_keeps_floor() {
        let retention: RetentionConfig =
            serde_yml::from_str("keep_last: 2\ndefault_retention: 1day\n").unwrap();
        let f = fixture(ScheduleConfig::default(), retention);
        let records: Vec<_> = (10..15).map(|d| old_backup(&f.catalog, d)).collect();
        let run = f.scheduler.run_task(MaintenanceTask::RetentionSweep, now());
        assert!(run.success, "{run:?}");
        let left: Vec<_> = f.catalog.list_backups().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(left, vec![records[0].id, records[1].id]);
    }

    #[test]
    fn test_stale_temp_files_are_removed() {
        let schedule = ScheduleConfig {
            stale_tmp_age: std::time::Duration::ZERO,
            ..Default::default()
        };
        let f = fixture(schedule, RetentionConfig::default());
        let backups = f.dir.path().join("backups");
        std::fs::write(backups.join("postgres-full-x.dump.tmp"), b"partial").unwrap();
        std::fs::write(backups.join("sqlite-full-x.sqlite3"), b"done").unwrap();
        let run = f.scheduler.run_task(MaintenanceTask::StaleTempCleanup, now());
        assert!(run.success);
        assert!(!backups.join("postgres-full-x.dump.tmp").exists());
        assert!(backups.join("sqlite-full-x.sqlite3").exists());
    }

    #[test]
    fn test_prune_keeps_latest_execution() {
        let schedule = ScheduleConfig {
            history_window: std::time::Duration::from_secs(3600),
            ..Default::default()
        };
        let f = fixture(schedule, RetentionConfig::default());
        let long_ago = now() - Duration::days(40);
        f.scheduler.run_task(MaintenanceTask::StaleTempCleanup, long_ago - Duration::days(1));
        f.scheduler.run_task(MaintenanceTask::StaleTempCleanup, long_ago);
        f.scheduler.run_task(MaintenanceTask::PruneHistory, now());
        let last = f.catalog.last_execution("stale_temp_cleanup").unwrap().unwrap();
        assert_eq!(last.started_at, long_ago);
    }

    #[test]
    fn test_schedule_config_defaults_and_validation() {
        let schedule: ScheduleConfig = serde_yml::from_str("backup_cron: '0 1 * * *'\n").unwrap();
        assert!(schedule.validate().is_ok());
        assert_eq!(schedule.retention_cron, default_retention_cron());
        let bad: ScheduleConfig = serde_yml::from_str("retention_cron: nightly\n").unwrap();
        assert!(bad.validate().is_err());
    }
}
