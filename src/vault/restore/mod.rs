//! Restores an artifact into a target connection through an ordered fallback
//! chain: the engine's native tool, then the dump's statements over the driver,
//! then the generic record loader. The first step that succeeds wins; if none
//! does, every step's error is reported together.

pub mod loader;

use crate::vault::admin_account::{AdminAccount, AdminReset};
use crate::vault::artifact::interchange::InterchangeReader;
use crate::vault::artifact::records::{row_object, RecordEvent, RecordSource};
use crate::vault::artifact::sql_script::{
    copy_columns, parse_copy_line, split_statements, Dialect, SqlScriptSource, StatementKind,
};
use crate::vault::artifact::{decode_artifact, ArtifactFormat, DecodedArtifact};
use crate::vault::checksum::verify_file;
use crate::vault::driver::sqlite::SqliteDriver;
use crate::vault::driver::{DriverOpener, InsertOutcome, SqlDriver};
use crate::vault::encrypt::EncryptorConfig;
use crate::vault::engine::postgres::{archive_tables, archive_to_sql};
use crate::vault::engine::tool::ToolsConfig;
use crate::vault::engine::{EngineAdapter, NativeRestore};
use crate::vault::jobs::progress::{JobReporter, JobStep};
use crate::vault::model::backup_record::{BackupRecord, BackupType};
use crate::vault::model::connection::{ConnectionConfig, Engine};
use crate::vault::model::import_job::{ConflictResolution, ImportMode, ImportStats, JobKind};
use crate::vault::model::text_enum;
use crate::vault::restore::loader::{relax_or_warn, DriverSource, LoadOptions, RecordLoader};
use crate::vault::result_error::error::{Error, ErrorKind};
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use bon::Builder;
use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};

static SCRIPT_HEAD_LEN: u64 = 8192;

/// Tables a restore may touch.
#[derive(Clone, Default)]
pub enum TableScope {
    #[default]
    All,
    Only(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl TableScope {
    pub fn only<F: Fn(&str) -> bool + Send + Sync + 'static>(f: F) -> Self {
        TableScope::Only(Arc::new(f))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TableScope::All)
    }

    pub fn contains(&self, table: &str) -> bool {
        match self {
            TableScope::All => true,
            TableScope::Only(f) => f(table),
        }
    }

    fn predicate(&self) -> impl Fn(&str) -> bool + Send + 'static {
        let scope = self.clone();
        move |t: &str| scope.contains(t)
    }
}

impl Debug for TableScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TableScope::All => f.write_str("All"),
            TableScope::Only(_) => f.write_str("Only(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum RestoreSource {
    Backup(BackupRecord),
    File {
        path: PathBuf,
        /// SHA-256 the upload must match
        checksum: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct RestorePlan {
    pub kind: JobKind,
    pub mode: ImportMode,
    pub clear_data: bool,
    pub conflict: ConflictResolution,
    pub scope: TableScope,
}

impl RestorePlan {
    /// Plain restore: everything in the artifact, existing rows overwritten.
    pub fn restore(clear_data: bool) -> Self {
        Self {
            kind: JobKind::Restore,
            mode: ImportMode::Full,
            clear_data,
            conflict: ConflictResolution::Overwrite,
            scope: TableScope::All,
        }
    }

    /// Dump replay by the native tool or the driver only fits a full load
    /// into tables that are empty or missing.
    fn is_plain_replay(&self) -> bool {
        self.mode == ImportMode::Full && self.scope.is_all()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreStrategy {
    NativeTool,
    DriverStatements,
    RecordLoader,
}

text_enum!(RestoreStrategy {
    NativeTool => "native tool",
    DriverStatements => "driver statements",
    RecordLoader => "record loader",
});

/// A restore that succeeded with degraded guarantees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreWarning(pub String);

impl Display for RestoreWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct RestoreOutcome {
    pub strategy: RestoreStrategy,
    pub format: ArtifactFormat,
    pub stats: ImportStats,
    pub cleared_tables: Vec<String>,
    pub warnings: Vec<RestoreWarning>,
}

/// What is known about an artifact before anything is written.
struct ArtifactInfo {
    tables: Vec<String>,
    source_engine: Option<Engine>,
    dialect: Dialect,
    backup_type: Option<BackupType>,
}

#[derive(Builder)]
pub struct RestoreService {
    opener: Arc<dyn DriverOpener>,
    #[builder(default)]
    tools: ToolsConfig,
    #[builder(default)]
    encryptor: EncryptorConfig,
    #[builder(into)]
    work_dir: PathBuf,
    admin: Option<AdminAccount>,
}

impl RestoreService {
    pub fn restore(
        &self,
        source: &RestoreSource,
        target: &ConnectionConfig,
        plan: &RestorePlan,
        reporter: &dyn JobReporter,
    ) -> Result<RestoreOutcome> {
        reporter.enter(JobStep::Preparing);
        let path = verify_source(source)?;
        let decoded = decode_artifact(&path, &self.encryptor, &self.work_dir)?;
        let info = self.inspect(source, &decoded)?;
        reporter.log(&format!(
            "Artifact is {} (compressed: {}, encrypted: {}), {} table(s)",
            decoded.format,
            decoded.was_compressed,
            decoded.was_encrypted,
            info.tables.len()
        ));
        reporter.check_cancelled()?;

        let mut driver = self.opener.open_driver(target)?;
        driver.ping()?;
        let target_tables = driver.list_tables()?;

        let mut warnings: Vec<RestoreWarning> = vec![];
        let cleared = clear_scope(plan, &info, &target_tables);
        if plan.clear_data && !plan.mode.allows_clearing() {
            reporter.log(&format!("clear_data is ignored in {} mode", plan.mode));
        }
        if !cleared.is_empty() {
            reporter.enter(JobStep::Clearing);
            clear_tables(driver.as_mut(), &cleared, &mut warnings)?;
            reporter.log(&format!("Cleared {} table(s): {}", cleared.len(), cleared.join(", ")));
        }
        reporter.check_cancelled()?;

        let target_empty = !info.tables.iter().any(|t| target_tables.contains(t));
        let replay = plan.is_plain_replay() && (!cleared.is_empty() || target_empty);
        let clear_all = plan.clear_data && clears_everything(plan, &info);
        let mut errors: Vec<Error> = vec![];
        let mut done: Option<(RestoreStrategy, ImportStats)> = None;

        if replay {
            reporter.enter(JobStep::NativeRestore);
            let native = NativeRestore {
                artifact: decoded.path(),
                format: decoded.format,
                source_engine: decoded.native_engine.or(info.source_engine),
                clean: plan.clear_data,
                whole_database: clear_all || target_tables.is_empty(),
            };
            match EngineAdapter::new(target.engine, &self.tools).native_restore(target, &native) {
                Ok(method) => {
                    reporter.log(&format!("Native restore finished: {method}"));
                    done = Some((
                        RestoreStrategy::NativeTool,
                        estimate_rows(driver.as_mut(), &info.tables)?,
                    ));
                }
                Err(e) => step_failed("Native restore", e, &mut errors, reporter)?,
            }

            if done.is_none() && decoded.format == ArtifactFormat::Sql {
                reporter.check_cancelled()?;
                reporter.enter(JobStep::DriverStatements);
                match run_statements(driver.as_mut(), decoded.path(), info.dialect) {
                    Ok(dropped) => {
                        if dropped > 0 {
                            warnings.push(RestoreWarning(format!(
                                "{dropped} ownership, privilege or transaction statement(s) were not applied"
                            )));
                        }
                        done = Some((
                            RestoreStrategy::DriverStatements,
                            estimate_rows(driver.as_mut(), &info.tables)?,
                        ));
                    }
                    Err(e) => {
                        step_failed("Statement replay", e, &mut errors, reporter)?;
                        if !cleared.is_empty() {
                            clear_tables(driver.as_mut(), &cleared, &mut warnings)?;
                        }
                    }
                }
            }
        }

        if done.is_none() {
            reporter.check_cancelled()?;
            reporter.enter(JobStep::RecordLoad);
            let options = LoadOptions {
                conflict: plan.conflict,
                update_only: plan.mode == ImportMode::Update,
                create_missing: info.source_engine == Some(target.engine),
            };
            let loaded = self
                .record_source(&decoded, &info, &plan.scope)
                .and_then(|mut source| {
                    RecordLoader::new(driver.as_mut(), reporter, options).load(source.as_mut())
                });
            match loaded {
                Ok(summary) => {
                    reporter.log(&format!(
                        "Loaded {} of {} record(s), {} skipped, {} failed",
                        summary.stats.imported,
                        summary.stats.total,
                        summary.stats.skipped,
                        summary.stats.failed
                    ));
                    if summary.stats.failed > 0 {
                        warnings.push(RestoreWarning(format!(
                            "{} record(s) could not be loaded",
                            summary.stats.failed
                        )));
                    }
                    for warning in summary.warnings {
                        push_warning(&mut warnings, warning);
                    }
                    done = Some((RestoreStrategy::RecordLoader, summary.stats));
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    reporter.log(&format!("Record loader failed: {e}"));
                    errors.push(e);
                }
            }
        }

        let Some((strategy, stats)) = done else {
            return Err(Error::from(errors).with_msg(format!(
                "Every restore strategy failed for {}",
                target.label()
            )));
        };
        reporter.log(&format!("Restored through {strategy}"));
        if !errors.is_empty() {
            warnings.push(RestoreWarning(format!(
                "restored through {strategy} after {} earlier step(s) failed; source ownership and privileges were not applied",
                errors.len()
            )));
        }

        self.reset_admin(driver.as_mut(), reporter, &mut warnings);
        info!(
            "Restore into {} finished through {}: {:?}",
            target.label(),
            strategy,
            stats
        );
        Ok(RestoreOutcome {
            strategy,
            format: decoded.format,
            stats,
            cleared_tables: cleared,
            warnings,
        })
    }

    fn inspect(&self, source: &RestoreSource, decoded: &DecodedArtifact) -> Result<ArtifactInfo> {
        let (recorded_engine, backup_type) = match source {
            RestoreSource::Backup(r) => (Some(r.engine), Some(r.backup_type)),
            RestoreSource::File { .. } => (None, None),
        };
        let path = decoded.path();
        let info = match decoded.format {
            ArtifactFormat::Interchange => {
                let mut reader = InterchangeReader::open(BufReader::new(File::open(path)?))?;
                let header_engine = reader.header().engine;
                let header_type = reader.header().backup_type;
                let mut tables = vec![];
                while let Some(event) = reader.next_event()? {
                    if let RecordEvent::Table(t) = event {
                        if !tables.contains(&t.name) {
                            tables.push(t.name);
                        }
                    }
                }
                ArtifactInfo {
                    tables,
                    source_engine: recorded_engine.or(Some(header_engine)),
                    dialect: Dialect::for_engine(header_engine),
                    backup_type: backup_type.or(Some(header_type)),
                }
            }
            ArtifactFormat::Sql => {
                let dialect = match recorded_engine {
                    Some(engine) => Dialect::for_engine(engine),
                    None => Dialect::sniff(&script_head(path)?),
                };
                let mut tables = vec![];
                for stmt in split_statements(&std::fs::read_to_string(path)?, dialect)? {
                    let carries_table = matches!(
                        stmt.kind,
                        StatementKind::CreateTable | StatementKind::Insert | StatementKind::Copy
                    );
                    if let (true, Some(t)) = (carries_table, stmt.table) {
                        if !tables.contains(&t) {
                            tables.push(t);
                        }
                    }
                }
                ArtifactInfo {
                    tables,
                    source_engine: recorded_engine
                        .or((dialect == Dialect::MySql).then_some(Engine::MySql)),
                    dialect,
                    backup_type,
                }
            }
            ArtifactFormat::Native => {
                let engine = decoded.native_engine.or(recorded_engine);
                let tables = match engine {
                    Some(Engine::Sqlite) => SqliteDriver::open_read_only(path)?.list_tables()?,
                    Some(Engine::Postgres) => archive_tables(&self.tools, path)?,
                    _ => {
                        return Err(Error::format(format!(
                            "{path:?} is not a native dump of a supported engine"
                        )))
                    }
                };
                ArtifactInfo {
                    tables,
                    source_engine: engine,
                    dialect: Dialect::Standard,
                    backup_type,
                }
            }
        };
        Ok(info)
    }

    fn record_source(
        &self,
        decoded: &DecodedArtifact,
        info: &ArtifactInfo,
        scope: &TableScope,
    ) -> Result<Box<dyn RecordSource>> {
        let path = decoded.path();
        match decoded.format {
            ArtifactFormat::Interchange => Ok(Box::new(
                InterchangeReader::open(BufReader::new(File::open(path)?))?
                    .with_table_filter(scope.predicate()),
            )),
            ArtifactFormat::Sql => script_source(path, info.dialect, scope),
            ArtifactFormat::Native => match info.source_engine {
                Some(Engine::Sqlite) => Ok(Box::new(DriverSource::new(
                    SqliteDriver::open_read_only(path)?,
                    scope.predicate(),
                )?)),
                Some(Engine::Postgres) => {
                    let script = NamedTempFile::new_in(&self.work_dir)?.into_temp_path();
                    archive_to_sql(&self.tools, path, &script)?;
                    script_source(&script, Dialect::Standard, scope)
                }
                _ => Err(Error::format(format!(
                    "no record reader for native dump {path:?}"
                ))),
            },
        }
    }

    fn reset_admin(
        &self,
        driver: &mut dyn SqlDriver,
        reporter: &dyn JobReporter,
        warnings: &mut Vec<RestoreWarning>,
    ) {
        let Some(admin) = &self.admin else {
            return;
        };
        reporter.enter(JobStep::AdminReset);
        match admin.reset(driver) {
            Ok(AdminReset::NoAccountTable) => reporter.log(&format!(
                "No {} table in the target, administrator account left alone",
                admin.table
            )),
            Ok(outcome) => reporter.log(&format!(
                "Administrator account {}: {:?}",
                admin.username, outcome
            )),
            Err(e) => {
                warn!("Administrator reset failed: {e}");
                reporter.log(&format!("Administrator reset failed: {e}"));
                warnings.push(RestoreWarning(format!(
                    "administrator account could not be reset: {}",
                    e.summary()
                )));
            }
        }
    }
}

/// Path of the artifact to read, after its checksum was checked.
fn verify_source(source: &RestoreSource) -> Result<PathBuf> {
    match source {
        RestoreSource::Backup(record) => {
            if !record.status.is_restorable() {
                return Err(Error::invalid_state(format!(
                    "backup {} is {}, only completed backups can be restored",
                    record.id, record.status
                )));
            }
            let path = record
                .location
                .clone()
                .ok_or_else(|| Error::not_found("backup artifact", record.id.to_string()))?;
            if !path.exists() {
                return Err(Error::not_found("backup artifact", path.display().to_string()));
            }
            let checksum = record.checksum.as_deref().ok_or_else(|| {
                Error::format(format!("backup {} has no recorded checksum", record.id))
            })?;
            verify_file(&path, checksum)?;
            Ok(path)
        }
        RestoreSource::File { path, checksum } => {
            if !path.exists() {
                return Err(Error::not_found("file", path.display().to_string()));
            }
            if let Some(checksum) = checksum {
                verify_file(path, checksum)?;
            }
            Ok(path.clone())
        }
    }
}

fn clears_everything(plan: &RestorePlan, info: &ArtifactInfo) -> bool {
    plan.mode == ImportMode::Full
        && plan.scope.is_all()
        && match plan.kind {
            JobKind::Import => true,
            JobKind::Restore => info.backup_type == Some(BackupType::Full),
        }
}

/// Target tables to empty before loading: everything for a full load of a
/// full artifact, otherwise the artifact's tables inside the plan's scope.
fn clear_scope(plan: &RestorePlan, info: &ArtifactInfo, target_tables: &[String]) -> Vec<String> {
    if !plan.clear_data || !plan.mode.allows_clearing() {
        return vec![];
    }
    if clears_everything(plan, info) {
        return target_tables.to_vec();
    }
    let artifact: HashSet<&str> = info.tables.iter().map(String::as_str).collect();
    target_tables
        .iter()
        .filter(|t| artifact.contains(t.as_str()) && plan.scope.contains(t))
        .cloned()
        .collect()
}

fn push_warning(warnings: &mut Vec<RestoreWarning>, warning: String) {
    if !warnings.iter().any(|w| w.0 == warning) {
        warnings.push(RestoreWarning(warning));
    }
}

fn clear_tables(
    driver: &mut dyn SqlDriver,
    tables: &[String],
    warnings: &mut Vec<RestoreWarning>,
) -> Result<()> {
    let relaxed = match relax_or_warn(driver)? {
        None => true,
        Some(warning) => {
            warn!("{warning}");
            push_warning(warnings, warning);
            false
        }
    };
    let res = driver.begin().and_then(|_| {
        tables.iter().try_for_each(|t| {
            driver
                .clear_table(t)
                .map(|_| ())
                .with_msg(format!("Clearing table {t} failed"))
        })
    });
    let res = res.and_then(|_| driver.commit());
    if res.is_err() {
        if let Err(e) = driver.rollback() {
            warn!("Rollback after failed clear failed: {e}");
        }
    }
    if !relaxed {
        return res;
    }
    let restored = driver.relax_constraints(false);
    res.and(restored)
}

/// Row counts of the restored tables, for paths that load whole files.
fn estimate_rows(driver: &mut dyn SqlDriver, tables: &[String]) -> Result<ImportStats> {
    let present = driver.list_tables()?;
    let mut rows = 0;
    for table in present
        .iter()
        .filter(|t| tables.is_empty() || tables.contains(t))
    {
        rows += driver.count_rows(table)?;
    }
    Ok(ImportStats {
        total: rows,
        imported: rows,
        estimated: true,
        ..Default::default()
    })
}

/// Non-fatal step errors are kept for the final report and the chain moves
/// on. An unreachable target or a cancelled job stops it.
fn step_failed(
    step: &str,
    e: Error,
    errors: &mut Vec<Error>,
    reporter: &dyn JobReporter,
) -> Result<()> {
    match e.kind() {
        ErrorKind::Connectivity | ErrorKind::Cancelled => {
            errors.push(e);
            Err(Error::from(std::mem::take(errors)))
        }
        ErrorKind::ToolUnavailable => {
            reporter.log(&format!("{step} unavailable, falling back: {e}"));
            errors.push(e);
            Ok(())
        }
        _ => {
            warn!("{step} failed: {e}");
            reporter.log(&format!("{step} failed, falling back: {e}"));
            errors.push(e);
            Ok(())
        }
    }
}

/// Executes the dump's statements over the driver. Returns how many
/// statements were dropped as not executable.
fn run_statements(driver: &mut dyn SqlDriver, script: &Path, dialect: Dialect) -> Result<u64> {
    let target_dialect = Dialect::for_engine(driver.engine());
    if dialect != target_dialect {
        return Err(Error::format(format!(
            "script is written for the {dialect:?} dialect, target {} expects {target_dialect:?}",
            driver.engine()
        )));
    }
    let statements = split_statements(&std::fs::read_to_string(script)?, dialect)?;
    let mut dropped = 0;
    driver.begin()?;
    let res = statements.iter().enumerate().try_for_each(|(i, stmt)| {
        if !stmt.is_executable() {
            dropped += 1;
            return Ok(());
        }
        if stmt.kind == StatementKind::Copy {
            let table = stmt.table.as_deref().unwrap_or_default();
            let columns = copy_columns(stmt);
            for line in &stmt.copy_data {
                let row = row_object(&columns, parse_copy_line(line));
                if driver.insert_row(table, &row)? == InsertOutcome::Conflict {
                    return Err(Error::conflict(table, "duplicate key in COPY data"));
                }
            }
            return Ok(());
        }
        driver.execute(&stmt.text).map(|_| ()).with_msg(format!(
            "Statement {} failed: {}",
            i + 1,
            stmt.text.chars().take(120).collect::<String>()
        ))
    });
    match res.and_then(|_| driver.commit()) {
        Ok(()) => Ok(dropped),
        Err(e) => {
            if let Err(e2) = driver.rollback() {
                warn!("Rollback after failed statement replay failed: {e2}");
            }
            Err(e)
        }
    }
}

fn script_head(path: &Path) -> Result<String> {
    let mut head = vec![];
    File::open(path)?.take(SCRIPT_HEAD_LEN).read_to_end(&mut head)?;
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn script_source(path: &Path, dialect: Dialect, scope: &TableScope) -> Result<Box<dyn RecordSource>> {
    let statements = split_statements(&std::fs::read_to_string(path)?, dialect)?;
    Ok(Box::new(
        SqlScriptSource::new(statements, dialect).with_table_filter(scope.predicate()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::admin_account::AdminAccountConfig;
    use crate::vault::artifact::encode_artifact;
    use crate::vault::encrypt::age::AgeEncryptorConfig;
    use crate::vault::compress::CompressorConfig;
    use crate::vault::driver::testing::Refusing;
    use crate::vault::engine::export::{export_interchange, export_sql};
    use crate::vault::jobs::progress::NoopReporter;
    use crate::vault::model::backup_record::BackupStatus;
    use crate::vault::checksum::sha256_file;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Files;

    impl DriverOpener for Files {
        fn open_driver(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>> {
            Ok(Box::new(SqliteDriver::open_or_create(Path::new(&config.database))?))
        }
    }

    /// Hands out targets whose session refuses what `Refusing` is told to.
    struct RefusingFiles {
        relax: bool,
        begin: bool,
    }

    impl DriverOpener for RefusingFiles {
        fn open_driver(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>> {
            let inner = SqliteDriver::open_or_create(Path::new(&config.database))?;
            Ok(Box::new(Refusing {
                relax: self.relax,
                begin: self.begin,
                ..Refusing::new(inner)
            }))
        }
    }

    /// Keeps the job log in memory.
    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn text(&self) -> String {
            self.lines.lock().unwrap().join("\n")
        }
    }

    impl JobReporter for Recorder {
        fn log(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_owned());
        }
        fn step(&self, _step: JobStep, _percent: u8) {}
        fn check_cancelled(&self) -> Result<()> {
            Ok(())
        }
    }

    fn config(path: &Path) -> ConnectionConfig {
        ConnectionConfig {
            id: Uuid::new_v4(),
            name: "target".into(),
            engine: Engine::Sqlite,
            host: None,
            port: None,
            username: None,
            password: None,
            database: path.to_string_lossy().to_string(),
            is_active: true,
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn seed(path: &Path) {
        rusqlite::Connection::open(path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT UNIQUE, password_hash TEXT, role TEXT);
                 CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE items (id INTEGER PRIMARY KEY, sku TEXT);
                 INSERT INTO users VALUES (1, 'admin', 'x', 'admin');
                 INSERT INTO customers VALUES (1, 'Ada'), (2, 'Grace');
                 INSERT INTO items VALUES (1, 'A-1');",
            )
            .unwrap();
    }

    fn service(dir: &TempDir, tools: ToolsConfig) -> RestoreService {
        RestoreService::builder()
            .opener(Arc::new(Files))
            .tools(tools)
            .work_dir(dir.path())
            .build()
    }

    fn no_tools() -> ToolsConfig {
        ToolsConfig {
            disabled: true,
            ..Default::default()
        }
    }

    fn record(path: &Path, backup_type: BackupType, format: ArtifactFormat) -> BackupRecord {
        BackupRecord {
            id: Uuid::new_v4(),
            connection_id: None,
            backup_type,
            engine: Engine::Sqlite,
            format,
            location: Some(path.to_path_buf()),
            size_bytes: None,
            checksum: Some(sha256_file(path).unwrap()),
            compressed: false,
            encrypted: false,
            status: BackupStatus::Completed,
            error_message: None,
            created_by: "test".into(),
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    fn interchange_of(dir: &TempDir, src: &Path) -> PathBuf {
        let out = dir.path().join("full.jsonl");
        let mut d = SqliteDriver::open(src).unwrap();
        export_interchange(&mut d, BackupType::Full, &out).unwrap();
        out
    }

    fn count(path: &Path, table: &str) -> i64 {
        rusqlite::Connection::open(path)
            .unwrap()
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_interchange_restore_falls_back_to_record_loader() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = interchange_of(&dir, &src);
        let dst = dir.path().join("dst.db");
        let recorder = Recorder::default();

        let outcome = service(&dir, no_tools())
            .restore(
                &RestoreSource::Backup(record(&artifact, BackupType::Full, ArtifactFormat::Interchange)),
                &config(&dst),
                &RestorePlan::restore(true),
                &recorder,
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::RecordLoader);
        assert_eq!(outcome.stats.imported, 4);
        assert_eq!(count(&dst, "customers"), 2);
        let log = recorder.text();
        assert!(log.contains("Native restore unavailable, falling back"));
        assert!(log.contains(JobStep::RecordLoad.milestone()));
        assert!(log.contains("Restored through record loader"));
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn test_tampered_artifact_fails_closed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = interchange_of(&dir, &src);
        let rec = record(&artifact, BackupType::Full, ArtifactFormat::Interchange);
        let mut text = std::fs::read_to_string(&artifact).unwrap();
        text = text.replace("Grace", "Mallory");
        std::fs::write(&artifact, text).unwrap();

        let dst = dir.path().join("dst.db");
        let err = service(&dir, no_tools())
            .restore(
                &RestoreSource::Backup(rec),
                &config(&dst),
                &RestorePlan::restore(true),
                &NoopReporter::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(!dst.exists() || count_tables(&dst) == 0);
    }

    fn count_tables(path: &Path) -> usize {
        SqliteDriver::open(path).unwrap().list_tables().unwrap().len()
    }

    #[test]
    fn test_native_sqlite_file_restores_whole_database() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = dir.path().join("copy.sqlite3");
        std::fs::copy(&src, &artifact).unwrap();
        let dst = dir.path().join("dst.db");
        rusqlite::Connection::open(&dst)
            .unwrap()
            .execute_batch("CREATE TABLE stale (id INTEGER); INSERT INTO stale VALUES (1);")
            .unwrap();

        let outcome = service(&dir, ToolsConfig::default())
            .restore(
                &RestoreSource::Backup(record(&artifact, BackupType::Full, ArtifactFormat::Native)),
                &config(&dst),
                &RestorePlan::restore(true),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::NativeTool);
        assert!(outcome.stats.estimated);
        assert_eq!(outcome.stats.total, 4);
        assert_eq!(count(&dst, "items"), 1);
        assert_eq!(count_tables(&dst), 3);
    }

    #[test]
    fn test_sql_dump_replayed_through_driver() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = dir.path().join("dump.sql");
        export_sql(&mut SqliteDriver::open(&src).unwrap(), BackupType::Full, &[], &artifact).unwrap();
        let dst = dir.path().join("dst.db");

        let outcome = service(&dir, no_tools())
            .restore(
                &RestoreSource::File {
                    path: artifact.clone(),
                    checksum: Some(sha256_file(&artifact).unwrap()),
                },
                &config(&dst),
                &RestorePlan::restore(false),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::DriverStatements);
        assert_eq!(count(&dst, "customers"), 2);
    }

    #[test]
    fn test_clearing_is_limited_to_artifact_tables() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        rusqlite::Connection::open(&src)
            .unwrap()
            .execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT); INSERT INTO customers VALUES (9, 'Linus');")
            .unwrap();
        let out = dir.path().join("customers.jsonl");
        export_interchange(&mut SqliteDriver::open(&src).unwrap(), BackupType::Data, &out).unwrap();

        let dst = dir.path().join("dst.db");
        seed(&dst);
        let outcome = service(&dir, no_tools())
            .restore(
                &RestoreSource::File {
                    path: out,
                    checksum: None,
                },
                &config(&dst),
                &RestorePlan::restore(true),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.cleared_tables, vec!["customers".to_owned()]);
        assert_eq!(count(&dst, "customers"), 1);
        assert_eq!(count(&dst, "items"), 1);
        assert_eq!(count(&dst, "users"), 1);
    }

    #[test]
    fn test_encrypted_compressed_artifact_and_admin_reset() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let raw = interchange_of(&dir, &src);
        let encryptor = EncryptorConfig::Age(AgeEncryptorConfig::passphrase("restore-test-secret"));
        let artifact = dir.path().join("full.jsonl.xz.age");
        encode_artifact(&raw, &artifact, &CompressorConfig::None.effective(true), &encryptor).unwrap();

        let admin_config: AdminAccountConfig =
            serde_yml::from_str("username: admin\npassword: recovered-pw\nattributes:\n  role: admin\n").unwrap();
        let dst = dir.path().join("dst.db");
        let outcome = RestoreService::builder()
            .opener(Arc::new(Files))
            .tools(no_tools())
            .encryptor(encryptor)
            .work_dir(dir.path())
            .admin(AdminAccount::new(&admin_config, 4))
            .build()
            .restore(
                &RestoreSource::Backup(record(&artifact, BackupType::Full, ArtifactFormat::Interchange)),
                &config(&dst),
                &RestorePlan::restore(true),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.format, ArtifactFormat::Interchange);
        let mut d = SqliteDriver::open(&dst).unwrap();
        assert!(AdminAccount::new(&admin_config, 4)
            .verify(&mut d, "recovered-pw")
            .unwrap());
    }

    #[test]
    fn test_every_failed_step_is_reported() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("broken.sql");
        std::fs::write(&artifact, "CREATE TABLE t (id INTEGER);\nINSERT INTO missing_table VALUES (1);\n").unwrap();
        let dst = dir.path().join("dst.db");
        let mut plan = RestorePlan::restore(false);
        plan.conflict = ConflictResolution::Skip;
        let outcome = service(&dir, no_tools()).restore(
            &RestoreSource::File {
                path: artifact,
                checksum: None,
            },
            &config(&dst),
            &plan,
            &NoopReporter::default(),
        );
        // The loader still succeeds: rows of the unknown table are skipped.
        let outcome = outcome.unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::RecordLoader);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.0.contains("2 earlier step(s) failed")));
    }

    #[test]
    fn test_all_strategies_failing_reports_each_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = dir.path().join("dump.sql");
        export_sql(&mut SqliteDriver::open(&src).unwrap(), BackupType::Full, &[], &artifact).unwrap();
        let dst = dir.path().join("dst.db");
        let recorder = Recorder::default();

        let err = RestoreService::builder()
            .opener(Arc::new(RefusingFiles {
                relax: false,
                begin: true,
            }))
            .tools(no_tools())
            .work_dir(dir.path())
            .build()
            .restore(
                &RestoreSource::File {
                    path: artifact,
                    checksum: None,
                },
                &config(&dst),
                &RestorePlan::restore(false),
                &recorder,
            )
            .unwrap_err();

        let Error::WithMsg { msg, error } = &err else {
            panic!("expected a wrapped error, got {err:?}");
        };
        assert!(msg.starts_with("Every restore strategy failed for"));
        let Error::LotsOfError(steps) = error.as_ref() else {
            panic!("expected every step's error, got {error:?}");
        };
        let kinds: Vec<ErrorKind> = steps.iter().map(Error::kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::ToolUnavailable, ErrorKind::InvalidState, ErrorKind::InvalidState]
        );
        assert!(recorder.text().contains("Statement replay failed, falling back"));
        assert!(recorder.text().contains("Record loader failed"));
        assert_eq!(count_tables(&dst), 0);
    }

    #[test]
    fn test_schema_then_data_backups_rebuild_an_empty_target() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let schema = dir.path().join("schema.sql");
        export_sql(&mut SqliteDriver::open(&src).unwrap(), BackupType::Schema, &[], &schema).unwrap();
        let data = dir.path().join("data.jsonl");
        export_interchange(&mut SqliteDriver::open(&src).unwrap(), BackupType::Data, &data).unwrap();
        let dst = dir.path().join("dst.db");
        let restore = service(&dir, no_tools());

        let outcome = restore
            .restore(
                &RestoreSource::Backup(record(&schema, BackupType::Schema, ArtifactFormat::Sql)),
                &config(&dst),
                &RestorePlan::restore(false),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::DriverStatements);
        assert_eq!(count_tables(&dst), 3);
        assert_eq!(count(&dst, "customers"), 0);

        let outcome = restore
            .restore(
                &RestoreSource::Backup(record(&data, BackupType::Data, ArtifactFormat::Interchange)),
                &config(&dst),
                &RestorePlan::restore(false),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::RecordLoader);
        assert_eq!((outcome.stats.imported, outcome.stats.failed), (4, 0));
        assert_eq!(count(&dst, "customers"), 2);
        assert_eq!(count(&dst, "users"), 1);
    }

    #[test]
    fn test_data_backup_rebuilds_an_empty_target() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let data = dir.path().join("data.jsonl");
        export_interchange(&mut SqliteDriver::open(&src).unwrap(), BackupType::Data, &data).unwrap();
        let dst = dir.path().join("dst.db");
        let recorder = Recorder::default();

        let outcome = service(&dir, no_tools())
            .restore(
                &RestoreSource::Backup(record(&data, BackupType::Data, ArtifactFormat::Interchange)),
                &config(&dst),
                &RestorePlan::restore(false),
                &recorder,
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::RecordLoader);
        assert_eq!((outcome.stats.imported, outcome.stats.skipped), (4, 0));
        assert!(recorder.text().contains("Created missing table customers"));
        assert_eq!(count_tables(&dst), 3);
        assert_eq!(count(&dst, "items"), 1);
    }

    #[test]
    fn test_refused_constraint_relaxing_still_clears_and_loads() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.db");
        seed(&src);
        let artifact = interchange_of(&dir, &src);
        let dst = dir.path().join("dst.db");
        seed(&dst);
        rusqlite::Connection::open(&dst)
            .unwrap()
            .execute_batch("INSERT INTO customers VALUES (3, 'Linus');")
            .unwrap();

        let outcome = RestoreService::builder()
            .opener(Arc::new(RefusingFiles {
                relax: true,
                begin: false,
            }))
            .tools(no_tools())
            .work_dir(dir.path())
            .build()
            .restore(
                &RestoreSource::Backup(record(&artifact, BackupType::Full, ArtifactFormat::Interchange)),
                &config(&dst),
                &RestorePlan::restore(true),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.strategy, RestoreStrategy::RecordLoader);
        assert_eq!(count(&dst, "customers"), 2);
        let refused = outcome
            .warnings
            .iter()
            .filter(|w| w.0.starts_with("Constraint checks stay on"))
            .count();
        assert_eq!(refused, 1);
    }
}
