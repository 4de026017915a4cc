//! Imports of uploaded dump files. An import is a restore from a file with a
//! caller-chosen mode, table-group selection and conflict policy.

pub mod table_groups;

use crate::vault::import::table_groups::TableGroups;
use crate::vault::jobs::progress::JobReporter;
use crate::vault::model::connection::ConnectionConfig;
use crate::vault::model::import_job::{ConflictResolution, ImportMode, JobKind};
use crate::vault::restore::{RestoreOutcome, RestorePlan, RestoreService, RestoreSource, TableScope};
use crate::vault::result_error::result::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub file: PathBuf,
    pub mode: ImportMode,
    pub clear_data: bool,
    /// Only read by `selective` imports
    #[serde(default)]
    pub table_groups: Vec<String>,
    pub conflict_resolution: ConflictResolution,
}

pub struct ImportEngine {
    restore: Arc<RestoreService>,
    groups: TableGroups,
}

impl ImportEngine {
    pub fn new(restore: Arc<RestoreService>, groups: TableGroups) -> Self {
        Self { restore, groups }
    }

    pub fn groups(&self) -> &TableGroups {
        &self.groups
    }

    /// Resolves the request into a restore plan. Fails before anything is read
    /// when a selective import names no group or an unknown one.
    pub fn plan(&self, request: &ImportRequest) -> Result<RestorePlan> {
        let scope = match request.mode {
            ImportMode::Selective => self.groups.scope(&request.table_groups)?,
            _ => TableScope::All,
        };
        Ok(RestorePlan {
            kind: JobKind::Import,
            mode: request.mode,
            clear_data: request.clear_data,
            conflict: request.conflict_resolution,
            scope,
        })
    }

    pub fn import(
        &self,
        request: &ImportRequest,
        target: &ConnectionConfig,
        reporter: &dyn JobReporter,
    ) -> Result<RestoreOutcome> {
        let plan = self.plan(request)?;
        if request.mode != ImportMode::Selective && !request.table_groups.is_empty() {
            reporter.log(&format!(
                "Table groups {:?} are ignored in {} mode",
                request.table_groups, request.mode
            ));
        }
        reporter.log(&format!(
            "Importing {:?} into {} (mode {}, conflicts: {})",
            request.file,
            target.label(),
            request.mode,
            request.conflict_resolution
        ));
        let source = RestoreSource::File {
            path: request.file.clone(),
            checksum: None,
        };
        self.restore.restore(&source, target, &plan, reporter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::driver::sqlite::SqliteDriver;
    use crate::vault::driver::{DriverOpener, SqlDriver};
    use crate::vault::engine::export::export_interchange;
    use crate::vault::engine::tool::ToolsConfig;
    use crate::vault::jobs::progress::NoopReporter;
    use crate::vault::model::backup_record::BackupType;
    use crate::vault::model::connection::Engine;
    use crate::vault::result_error::error::ErrorKind;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Files;

    impl DriverOpener for Files {
        fn open_driver(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>> {
            Ok(Box::new(SqliteDriver::open_or_create(Path::new(&config.database))?))
        }
    }

    fn engine(dir: &TempDir) -> ImportEngine {
        let restore = RestoreService::builder()
            .opener(Arc::new(Files))
            .tools(ToolsConfig {
                disabled: true,
                ..Default::default()
            })
            .work_dir(dir.path())
            .build();
        ImportEngine::new(Arc::new(restore), TableGroups::default())
    }

    fn target(path: &Path) -> ConnectionConfig {
        ConnectionConfig {
            id: Uuid::new_v4(),
            name: "app".into(),
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

    fn db(path: &Path, sql: &str) {
        rusqlite::Connection::open(path).unwrap().execute_batch(sql).unwrap();
    }

    fn names(path: &Path, table: &str) -> Vec<String> {
        let conn = rusqlite::Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM {table} ORDER BY id"))
            .unwrap();
        let rows = stmt.query_map([], |r| r.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    /// Source holds one customer and one catalog item; the target has others.
    fn fixture(dir: &TempDir) -> (PathBuf, PathBuf) {
        let src = dir.path().join("src.db");
        db(
            &src,
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO customers VALUES (1, 'Imported customer');
             INSERT INTO items VALUES (1, 'Imported item');",
        );
        let file = dir.path().join("upload.jsonl");
        export_interchange(&mut SqliteDriver::open(&src).unwrap(), BackupType::Full, &file).unwrap();

        let dst = dir.path().join("dst.db");
        db(
            &dst,
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE notes (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO customers VALUES (7, 'Existing customer');
             INSERT INTO items VALUES (7, 'Existing item');
             INSERT INTO notes VALUES (1, 'note');",
        );
        (file, dst)
    }

    fn request(file: PathBuf, mode: ImportMode, clear_data: bool, groups: &[&str]) -> ImportRequest {
        ImportRequest {
            file,
            mode,
            clear_data,
            table_groups: groups.iter().map(|g| g.to_string()).collect(),
            conflict_resolution: ConflictResolution::Skip,
        }
    }

    #[test]
    fn test_selective_import_touches_only_selected_groups() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        let outcome = engine(&dir)
            .import(
                &request(file, ImportMode::Selective, true, &["customers"]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(names(&dst, "customers"), vec!["Imported customer"]);
        assert_eq!(names(&dst, "items"), vec!["Existing item"]);
        assert_eq!(names(&dst, "notes"), vec!["note"]);
        assert_eq!(outcome.stats.total, 1);
        assert_eq!(outcome.cleared_tables, vec!["customers".to_owned()]);
    }

    #[test]
    fn test_selective_clear_skips_group_tables_missing_from_file() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        db(
            &dst,
            "CREATE TABLE customer_notes (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO customer_notes VALUES (1, 'call back'), (2, 'vip');",
        );
        let outcome = engine(&dir)
            .import(
                &request(file, ImportMode::Selective, true, &["customers"]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(outcome.cleared_tables, vec!["customers".to_owned()]);
        assert_eq!(names(&dst, "customer_notes"), vec!["call back", "vip"]);
        assert_eq!(names(&dst, "customers"), vec!["Imported customer"]);
    }

    #[test]
    fn test_full_import_clears_every_table() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        engine(&dir)
            .import(
                &request(file, ImportMode::Full, true, &[]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(names(&dst, "customers"), vec!["Imported customer"]);
        assert_eq!(names(&dst, "items"), vec!["Imported item"]);
        assert!(names(&dst, "notes").is_empty());
    }

    #[test]
    fn test_merge_keeps_existing_rows() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        let outcome = engine(&dir)
            .import(
                &request(file, ImportMode::Merge, true, &["customers"]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap();
        assert!(outcome.cleared_tables.is_empty());
        assert_eq!(
            names(&dst, "customers"),
            vec!["Imported customer", "Existing customer"]
        );
        assert_eq!(outcome.stats.imported, 2);
    }

    #[test]
    fn test_update_mode_only_touches_existing_rows() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        db(&dst, "INSERT INTO items VALUES (1, 'Old name');");
        let outcome = engine(&dir)
            .import(
                &request(file, ImportMode::Update, false, &[]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap();
        assert_eq!(names(&dst, "items"), vec!["Imported item", "Existing item"]);
        assert_eq!(names(&dst, "customers"), vec!["Existing customer"]);
        assert_eq!(outcome.stats.imported, 1);
        assert_eq!(outcome.stats.skipped, 1);
    }

    #[test]
    fn test_selective_without_groups_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (file, dst) = fixture(&dir);
        let err = engine(&dir)
            .import(
                &request(file, ImportMode::Selective, false, &[]),
                &target(&dst),
                &NoopReporter::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(names(&dst, "customers"), vec!["Existing customer"]);
    }
}
