//! Embedded SQLite store of everything the vault owns: connection rows,
//! backup records, jobs with their progress events, setup tokens and the
//! scheduler's execution history. It lives outside the managed databases so
//! it is readable before any of them is reachable.
//!
//! Status changes are guarded `UPDATE`s that only match rows whose current
//! status is an allowed predecessor, so no caller can move a record backwards.

use crate::vault::jobs::progress::{JobStep, ProgressEvent};
use crate::vault::model::backup_record::{BackupRecord, BackupStatus};
use crate::vault::model::connection::ConnectionConfig;
use crate::vault::model::import_job::{ErrorDetails, ImportJob, ImportStats, JobSource, JobStatus};
use crate::vault::model::setup_token::SetupToken;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::{unpoison, Result};
use crate::vault::result_error::WithMsg;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

static SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS connection_configs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    engine TEXT NOT NULL,
    host TEXT,
    port INTEGER,
    username TEXT,
    database TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS backup_records (
    id TEXT PRIMARY KEY,
    connection_id TEXT,
    backup_type TEXT NOT NULL,
    engine TEXT NOT NULL,
    format TEXT NOT NULL,
    location TEXT,
    size_bytes INTEGER,
    checksum TEXT,
    compressed INTEGER NOT NULL DEFAULT 0,
    encrypted INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_message TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS backup_records_created_at ON backup_records (created_at);
CREATE TABLE IF NOT EXISTS import_jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    target_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    clear_data INTEGER NOT NULL,
    table_groups TEXT NOT NULL,
    conflict_resolution TEXT NOT NULL,
    status TEXT NOT NULL,
    log TEXT NOT NULL DEFAULT '',
    stats TEXT NOT NULL,
    error_details TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE TABLE IF NOT EXISTS job_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES import_jobs (id) ON DELETE CASCADE,
    step TEXT NOT NULL,
    percent INTEGER NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS job_progress_job ON job_progress (job_id, id);
CREATE TABLE IF NOT EXISTS setup_tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL UNIQUE,
    is_used INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS job_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    success INTEGER NOT NULL,
    message TEXT
);
CREATE INDEX IF NOT EXISTS job_executions_task ON job_executions (task, started_at);
";

/// One scheduler run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobExecution {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub message: Option<String>,
}

pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

fn conversion_error<E: std::error::Error + Send + Sync + 'static>(idx: usize, e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| serde_json::from_str(&text).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Quoted status literals for an `IN (...)` list.
fn status_list<I: IntoIterator<Item = &'static str>>(statuses: I) -> String {
    statuses
        .into_iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

static CONNECTION_COLUMNS: &str =
    "id, name, engine, host, port, username, database, is_active, is_default, created_at, updated_at";

fn connection_from_row(row: &Row) -> rusqlite::Result<ConnectionConfig> {
    Ok(ConnectionConfig {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        engine: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        username: row.get(5)?,
        password: None,
        database: row.get(6)?,
        is_active: row.get(7)?,
        is_default: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

static BACKUP_COLUMNS: &str = "id, connection_id, backup_type, engine, format, location, size_bytes, \
     checksum, compressed, encrypted, status, error_message, created_by, created_at, completed_at";

fn backup_from_row(row: &Row) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: uuid_at(row, 0)?,
        connection_id: opt_uuid_at(row, 1)?,
        backup_type: row.get(2)?,
        engine: row.get(3)?,
        format: row.get(4)?,
        location: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        size_bytes: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        checksum: row.get(7)?,
        compressed: row.get(8)?,
        encrypted: row.get(9)?,
        status: row.get(10)?,
        error_message: row.get(11)?,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

static JOB_COLUMNS: &str = "id, kind, source, target_id, mode, clear_data, table_groups, \
     conflict_resolution, status, log, stats, error_details, created_at, started_at, completed_at";

fn job_from_row(row: &Row) -> rusqlite::Result<ImportJob> {
    Ok(ImportJob {
        id: uuid_at(row, 0)?,
        kind: row.get(1)?,
        source: json_at(row, 2)?,
        target_id: uuid_at(row, 3)?,
        mode: row.get(4)?,
        clear_data: row.get(5)?,
        table_groups: json_at(row, 6)?,
        conflict_resolution: row.get(7)?,
        status: row.get(8)?,
        log: row.get(9)?,
        stats: json_at(row, 10)?,
        error_details: opt_json_at(row, 11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

fn token_from_row(row: &Row) -> rusqlite::Result<SetupToken> {
    Ok(SetupToken {
        id: uuid_at(row, 0)?,
        token_hash: row.get(1)?,
        is_used: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(Error::from)
            .with_msg(format!("Opening catalog {path:?} failed"))?;
        Self::init(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        unpoison(self.conn.lock(), "catalog connection")
    }

    // connections

    /// Replaces every connection row in one transaction.
    pub fn replace_connections(&self, configs: &[ConnectionConfig]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM connection_configs", [])?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO connection_configs ({CONNECTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ))?;
            for c in configs {
                insert.execute(params![
                    c.id.to_string(),
                    c.name,
                    c.engine,
                    c.host,
                    c.port,
                    c.username,
                    c.database,
                    c.is_active,
                    c.is_default,
                    c.created_at,
                    c.updated_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Connection rows, without passwords.
    pub fn list_connections(&self) -> Result<Vec<ConnectionConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM connection_configs ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], connection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // backups

    pub fn insert_backup(&self, r: &BackupRecord) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO backup_records ({BACKUP_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                r.id.to_string(),
                r.connection_id.map(|id| id.to_string()),
                r.backup_type,
                r.engine,
                r.format,
                r.location.as_ref().map(|p| p.to_string_lossy().into_owned()),
                r.size_bytes.map(|n| n as i64),
                r.checksum,
                r.compressed,
                r.encrypted,
                r.status,
                r.error_message,
                r.created_by,
                r.created_at,
                r.completed_at
            ],
        )?;
        Ok(())
    }

    pub fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self
            .conn()?
            .query_row(
                &format!("SELECT {BACKUP_COLUMNS} FROM backup_records WHERE id = ?1"),
                [id.to_string()],
                backup_from_row,
            )
            .optional()?)
    }

    /// Newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map([], backup_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Moves a record to `status`; `false` when its current status does not allow it.
    pub fn set_backup_status(
        &self,
        id: Uuid,
        status: BackupStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let completed_at = matches!(status, BackupStatus::Failed).then(Utc::now);
        let n = self.conn()?.execute(
            &format!(
                "UPDATE backup_records \
                 SET status = ?2, error_message = COALESCE(?3, error_message), \
                     completed_at = COALESCE(?4, completed_at) \
                 WHERE id = ?1 AND status IN ({})",
                status_list(status.predecessors().iter().map(|s| s.as_str()))
            ),
            params![id.to_string(), status, error_message, completed_at],
        )?;
        Ok(n == 1)
    }

    /// Stores the finished artifact of a record and marks it completed.
    pub fn complete_backup(&self, r: &BackupRecord) -> Result<bool> {
        let n = self.conn()?.execute(
            &format!(
                "UPDATE backup_records \
                 SET status = 'completed', format = ?2, location = ?3, size_bytes = ?4, \
                     checksum = ?5, compressed = ?6, encrypted = ?7, completed_at = ?8 \
                 WHERE id = ?1 AND status IN ({})",
                status_list(BackupStatus::Completed.predecessors().iter().map(|s| s.as_str()))
            ),
            params![
                r.id.to_string(),
                r.format,
                r.location.as_ref().map(|p| p.to_string_lossy().into_owned()),
                r.size_bytes.map(|n| n as i64),
                r.checksum,
                r.compressed,
                r.encrypted,
                r.completed_at.unwrap_or_else(Utc::now)
            ],
        )?;
        Ok(n == 1)
    }

    /// Refuses records still being written and backups an unfinished restore
    /// job reads from.
    pub fn delete_backup(&self, id: Uuid) -> Result<bool> {
        let n = self.conn()?.execute(
            "DELETE FROM backup_records WHERE id = ?1 AND status != 'in_progress' \
             AND NOT EXISTS (SELECT 1 FROM import_jobs \
                 WHERE status IN ('pending', 'processing') \
                 AND json_extract(source, '$.backup_id') = ?1)",
            [id.to_string()],
        )?;
        Ok(n == 1)
    }

    /// Fails every backup a previous process left unfinished and returns their ids.
    pub fn fail_unfinished_backups(&self, message: &str) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM backup_records WHERE status IN ('pending', 'in_progress')",
            )?;
            let rows = stmt.query_map([], |row| uuid_at(row, 0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut failed = vec![];
        for id in ids {
            if self.set_backup_status(id, BackupStatus::Failed, Some(message))? {
                failed.push(id);
            }
        }
        Ok(failed)
    }

    // jobs

    pub fn insert_job(&self, job: &ImportJob) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO import_jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                job.id.to_string(),
                job.kind,
                to_json(&job.source)?,
                job.target_id.to_string(),
                job.mode,
                job.clear_data,
                to_json(&job.table_groups)?,
                job.conflict_resolution,
                job.status,
                job.log,
                to_json(&job.stats)?,
                job.error_details.as_ref().map(to_json).transpose()?,
                job.created_at,
                job.started_at,
                job.completed_at
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        Ok(self
            .conn()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?1"),
                [id.to_string()],
                job_from_row,
            )
            .optional()?)
    }

    /// Newest first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<ImportJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY created_at DESC, id LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Moves a job forward to `status`; `false` when that would not be forward.
    pub fn transition_job(
        &self,
        id: Uuid,
        status: JobStatus,
        stats: Option<&ImportStats>,
        error_details: Option<&ErrorDetails>,
    ) -> Result<bool> {
        let now = Utc::now();
        let started_at = (status == JobStatus::Processing).then_some(now);
        let completed_at = status.is_finished().then_some(now);
        let n = self.conn()?.execute(
            &format!(
                "UPDATE import_jobs \
                 SET status = ?2, started_at = COALESCE(?3, started_at), \
                     completed_at = COALESCE(?4, completed_at), stats = COALESCE(?5, stats), \
                     error_details = COALESCE(?6, error_details) \
                 WHERE id = ?1 AND status IN ({})",
                status_list(status.predecessors().iter().map(|s| s.as_str()))
            ),
            params![
                id.to_string(),
                status,
                started_at,
                completed_at,
                stats.map(to_json).transpose()?,
                error_details.map(to_json).transpose()?
            ],
        )?;
        Ok(n == 1)
    }

    pub fn append_job_log(&self, id: Uuid, line: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE import_jobs SET log = log || ?2 || char(10) WHERE id = ?1",
            params![id.to_string(), line],
        )?;
        Ok(())
    }

    pub fn insert_progress(&self, job_id: Uuid, step: JobStep, percent: u8, message: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO job_progress (job_id, step, percent, message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id.to_string(), step, percent, message, Utc::now()],
        )?;
        Ok(())
    }

    pub fn latest_progress(&self, job_id: Uuid) -> Result<Option<ProgressEvent>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT step, percent, message, created_at FROM job_progress \
                 WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                [job_id.to_string()],
                |row| {
                    Ok(ProgressEvent {
                        step: row.get(0)?,
                        percent: row.get(1)?,
                        message: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Fails every job a previous process left unfinished and returns their ids.
    pub fn fail_unfinished_jobs(&self, details: &ErrorDetails) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM import_jobs WHERE status IN ('pending', 'processing')",
            )?;
            let rows = stmt.query_map([], |row| uuid_at(row, 0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut failed = vec![];
        for id in ids {
            if self.transition_job(id, JobStatus::Failed, None, Some(details))? {
                self.append_job_log(id, &format!("ERROR: {}", details.message))?;
                failed.push(id);
            }
        }
        Ok(failed)
    }

    /// Backups read by restore jobs that have not finished yet.
    pub fn backups_in_use(&self) -> Result<HashSet<Uuid>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source FROM import_jobs WHERE status IN ('pending', 'processing')",
        )?;
        let rows = stmt.query_map([], |row| json_at::<JobSource>(row, 0))?;
        let mut ids = HashSet::new();
        for source in rows {
            if let JobSource::Backup { backup_id } = source? {
                ids.insert(backup_id);
            }
        }
        Ok(ids)
    }

    /// Drops progress events of jobs finished before `before`.
    pub fn prune_progress(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn()?.execute(
            "DELETE FROM job_progress WHERE job_id IN \
             (SELECT id FROM import_jobs WHERE completed_at IS NOT NULL AND completed_at < ?1)",
            [before],
        )?)
    }

    // setup tokens

    pub fn insert_token(&self, token: &SetupToken) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO setup_tokens (id, token_hash, is_used, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.id.to_string(),
                token.token_hash,
                token.is_used,
                token.expires_at,
                token.created_at
            ],
        )?;
        Ok(())
    }

    pub fn find_token(&self, token_hash: &str) -> Result<Option<SetupToken>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT id, token_hash, is_used, expires_at, created_at \
                 FROM setup_tokens WHERE token_hash = ?1",
                [token_hash],
                token_from_row,
            )
            .optional()?)
    }

    /// Marks a valid token used; `false` when it is unknown, used or expired.
    pub fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self.conn()?.execute(
            "UPDATE setup_tokens SET is_used = 1 \
             WHERE token_hash = ?1 AND is_used = 0 AND expires_at > ?2",
            params![token_hash, now],
        )?;
        Ok(n == 1)
    }

    pub fn delete_stale_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn()?.execute(
            "DELETE FROM setup_tokens WHERE is_used = 1 OR expires_at <= ?1",
            [now],
        )?)
    }

    // scheduler bookkeeping

    pub fn record_execution(&self, e: &JobExecution) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO job_executions (task, started_at, finished_at, success, message) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![e.task, e.started_at, e.finished_at, e.success, e.message],
        )?;
        Ok(())
    }

    pub fn last_execution(&self, task: &str) -> Result<Option<JobExecution>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT task, started_at, finished_at, success, message FROM job_executions \
                 WHERE task = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                [task],
                |row| {
                    Ok(JobExecution {
                        task: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        success: row.get(3)?,
                        message: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn()?.execute(
            "DELETE FROM job_executions WHERE started_at < ?1",
            [before],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::artifact::ArtifactFormat;
    use crate::vault::model::backup_record::BackupType;
    use crate::vault::model::connection::Engine;
    use crate::vault::model::import_job::{ConflictResolution, ImportMode, JobKind};
    use crate::vault::result_error::error::ErrorKind;
    use chrono::Duration as ChronoDuration;

    fn backup(status: BackupStatus) -> BackupRecord {
        BackupRecord {
            id: Uuid::new_v4(),
            connection_id: Some(Uuid::new_v4()),
            backup_type: BackupType::Full,
            engine: Engine::Sqlite,
            format: ArtifactFormat::Native,
            location: None,
            size_bytes: None,
            checksum: None,
            compressed: false,
            encrypted: false,
            status,
            error_message: None,
            created_by: "tester".into(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn job(source: JobSource) -> ImportJob {
        ImportJob {
            id: Uuid::new_v4(),
            kind: JobKind::Restore,
            source,
            target_id: Uuid::new_v4(),
            mode: ImportMode::Full,
            clear_data: true,
            table_groups: vec!["customers".into()],
            conflict_resolution: ConflictResolution::Overwrite,
            status: JobStatus::Pending,
            log: String::new(),
            stats: ImportStats::default(),
            error_details: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_backup_lifecycle() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut r = backup(BackupStatus::Pending);
        catalog.insert_backup(&r).unwrap();
        assert!(catalog
            .set_backup_status(r.id, BackupStatus::InProgress, None)
            .unwrap());
        assert!(!catalog.delete_backup(r.id).unwrap());

        r.location = Some(PathBuf::from("/backups/a.sqlite3"));
        r.size_bytes = Some(4096);
        r.checksum = Some("abc".into());
        assert!(catalog.complete_backup(&r).unwrap());
        // completed records cannot go back to in_progress or fail
        assert!(!catalog
            .set_backup_status(r.id, BackupStatus::InProgress, None)
            .unwrap());
        assert!(!catalog
            .set_backup_status(r.id, BackupStatus::Failed, Some("late"))
            .unwrap());

        let stored = catalog.get_backup(r.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Completed);
        assert_eq!(stored.size_bytes, Some(4096));
        assert_eq!(stored.location, r.location);
        assert!(stored.completed_at.is_some());
        assert!(catalog.delete_backup(r.id).unwrap());
        assert!(catalog.get_backup(r.id).unwrap().is_none());
    }

    #[test]
    fn test_job_transitions_are_guarded() {
        let catalog = Catalog::open_in_memory().unwrap();
        let j = job(JobSource::File {
            path: "/tmp/dump.sql".into(),
        });
        catalog.insert_job(&j).unwrap();
        assert!(!catalog
            .transition_job(j.id, JobStatus::Completed, None, None)
            .unwrap());
        assert!(catalog
            .transition_job(j.id, JobStatus::Processing, None, None)
            .unwrap());
        let stats = ImportStats {
            total: 3,
            imported: 3,
            ..Default::default()
        };
        assert!(catalog
            .transition_job(j.id, JobStatus::Completed, Some(&stats), None)
            .unwrap());
        assert!(!catalog
            .transition_job(j.id, JobStatus::Processing, None, None)
            .unwrap());
        assert!(!catalog
            .transition_job(j.id, JobStatus::Failed, None, None)
            .unwrap());

        let stored = catalog.get_job(j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.stats, stats);
        assert_eq!(stored.table_groups, vec!["customers"]);
        assert!(stored.started_at.is_some() && stored.completed_at.is_some());
    }

    #[test]
    fn test_log_and_progress() {
        let catalog = Catalog::open_in_memory().unwrap();
        let j = job(JobSource::File { path: "x".into() });
        catalog.insert_job(&j).unwrap();
        catalog.append_job_log(j.id, "first").unwrap();
        catalog.append_job_log(j.id, "second").unwrap();
        assert_eq!(catalog.get_job(j.id).unwrap().unwrap().log, "first\nsecond\n");

        assert!(catalog.latest_progress(j.id).unwrap().is_none());
        catalog.insert_progress(j.id, JobStep::Preparing, 10, "a").unwrap();
        catalog.insert_progress(j.id, JobStep::RecordLoad, 60, "b").unwrap();
        let latest = catalog.latest_progress(j.id).unwrap().unwrap();
        assert_eq!((latest.step, latest.percent), (JobStep::RecordLoad, 60));
    }

    #[test]
    fn test_interrupted_jobs_and_backups_in_use() {
        let catalog = Catalog::open_in_memory().unwrap();
        let backup_id = Uuid::new_v4();
        let running = job(JobSource::Backup { backup_id });
        let done = job(JobSource::Backup {
            backup_id: Uuid::new_v4(),
        });
        catalog.insert_job(&running).unwrap();
        catalog.insert_job(&done).unwrap();
        catalog
            .transition_job(done.id, JobStatus::Failed, None, None)
            .unwrap();

        assert_eq!(catalog.backups_in_use().unwrap(), HashSet::from([backup_id]));
        let mut read = backup(BackupStatus::Completed);
        read.id = backup_id;
        catalog.insert_backup(&read).unwrap();
        assert!(!catalog.delete_backup(backup_id).unwrap());

        let details = ErrorDetails {
            kind: ErrorKind::Cancelled,
            message: "interrupted".into(),
            details: String::new(),
            suggestions: vec![],
        };
        assert_eq!(catalog.fail_unfinished_jobs(&details).unwrap(), vec![running.id]);
        let stored = catalog.get_job(running.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.log.contains("interrupted"));
        assert!(catalog.backups_in_use().unwrap().is_empty());
        assert!(catalog.delete_backup(backup_id).unwrap());
    }

    #[test]
    fn test_interrupted_backups_are_failed() {
        let catalog = Catalog::open_in_memory().unwrap();
        let pending = backup(BackupStatus::Pending);
        let running = backup(BackupStatus::Pending);
        let mut done = backup(BackupStatus::Pending);
        for r in [&pending, &running, &done] {
            catalog.insert_backup(r).unwrap();
        }
        catalog
            .set_backup_status(running.id, BackupStatus::InProgress, None)
            .unwrap();
        done.checksum = Some("abc".into());
        catalog.complete_backup(&done).unwrap();

        let failed: HashSet<Uuid> = catalog
            .fail_unfinished_backups("interrupted")
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(failed, HashSet::from([pending.id, running.id]));
        let stored = catalog.get_backup(running.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("interrupted"));
        assert!(catalog.delete_backup(running.id).unwrap());
        assert_eq!(
            catalog.get_backup(done.id).unwrap().unwrap().status,
            BackupStatus::Completed
        );
    }

    #[test]
    fn test_tokens_are_single_use() {
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Utc::now();
        let token = SetupToken {
            id: Uuid::new_v4(),
            token_hash: "hash".into(),
            is_used: false,
            expires_at: now + ChronoDuration::minutes(10),
            created_at: now,
        };
        catalog.insert_token(&token).unwrap();
        assert!(!catalog
            .consume_token("hash", now + ChronoDuration::minutes(11))
            .unwrap());
        assert!(catalog.consume_token("hash", now).unwrap());
        assert!(!catalog.consume_token("hash", now).unwrap());
        assert!(catalog.find_token("hash").unwrap().unwrap().is_used);
        assert_eq!(catalog.delete_stale_tokens(now).unwrap(), 1);
    }

    #[test]
    fn test_executions() {
        let catalog = Catalog::open_in_memory().unwrap();
        let now = Utc::now();
        for (i, success) in [true, false].into_iter().enumerate() {
            catalog
                .record_execution(&JobExecution {
                    task: "backup".into(),
                    started_at: now - ChronoDuration::days(2 - i as i64),
                    finished_at: now,
                    success,
                    message: None,
                })
                .unwrap();
        }
        assert!(!catalog.last_execution("backup").unwrap().unwrap().success);
        assert_eq!(
            catalog.prune_executions(now - ChronoDuration::days(1)).unwrap(),
            1
        );
        assert!(catalog.last_execution("retention").unwrap().is_none());
    }
}
