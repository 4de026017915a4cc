//! Generic record loader: replays a [`RecordSource`] into any [`SqlDriver`]
//! target, row by row, applying the conflict policy.

use crate::vault::artifact::records::{RecordEvent, RecordSource, TableDescriptor};
use crate::vault::driver::{Column, InsertOutcome, SqlDriver};
use crate::vault::engine::export::PAGE_SIZE;
use crate::vault::jobs::progress::JobReporter;
use crate::vault::model::import_job::{ConflictResolution, ImportStats};
use crate::vault::result_error::error::{Error, ErrorKind};
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

static BATCH_SIZE: u64 = 500;
static MAX_ROW_WARNINGS: usize = 10;

#[derive(Clone, Copy, Debug)]
pub struct LoadOptions {
    pub conflict: ConflictResolution,
    /// Only rows that already exist in the target (by primary key) are
    /// written; everything else is skipped.
    pub update_only: bool,
    /// Tables missing in the target may be created from the carried DDL.
    pub create_missing: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LoadSummary {
    pub stats: ImportStats,
    /// Target tables that received rows, in load order
    pub tables: Vec<String>,
    pub warnings: Vec<String>,
}

struct Binding {
    table: String,
    /// Incoming position and name of every column the target also has
    columns: Vec<(usize, String)>,
    key: Vec<String>,
    /// Single integer primary key, dropped when a row is kept as a copy
    surrogate_key: Option<String>,
}

enum RowOutcome {
    Imported,
    Skipped,
}

pub struct RecordLoader<'a> {
    driver: &'a mut dyn SqlDriver,
    reporter: &'a dyn JobReporter,
    options: LoadOptions,
    target_tables: HashSet<String>,
    binding: Option<Binding>,
    warned_tables: HashSet<String>,
    row_warnings: usize,
    since_commit: u64,
    summary: LoadSummary,
}

impl<'a> RecordLoader<'a> {
    pub fn new(
        driver: &'a mut dyn SqlDriver,
        reporter: &'a dyn JobReporter,
        options: LoadOptions,
    ) -> Self {
        Self {
            driver,
            reporter,
            options,
            target_tables: HashSet::new(),
            binding: None,
            warned_tables: HashSet::new(),
            row_warnings: 0,
            since_commit: 0,
            summary: LoadSummary::default(),
        }
    }

    /// Loads every event of `source`. Foreign key checks are off for the
    /// duration when the target role may turn them off; rows are committed in
    /// batches.
    pub fn load(mut self, source: &mut dyn RecordSource) -> Result<LoadSummary> {
        self.target_tables = self.driver.list_tables()?.into_iter().collect();
        let relaxed = match relax_or_warn(&mut *self.driver) {
            Ok(None) => true,
            Ok(Some(warning)) => {
                self.warn(warning);
                false
            }
            Err(e) => return Err(e),
        };
        let res = self.driver.begin().and_then(|_| self.drain(source));
        let res = res.and_then(|_| self.driver.commit());
        if let Err(e) = res {
            if let Err(e2) = self.driver.rollback() {
                warn!("Rollback after failed load failed: {e2}");
            }
            if relaxed {
                if let Err(e2) = self.driver.relax_constraints(false) {
                    warn!("Re-enabling constraint checks failed: {e2}");
                }
            }
            return Err(e);
        }
        if relaxed {
            self.driver.relax_constraints(false)?;
        }
        debug!("Record load finished: {:?}", self.summary.stats);
        Ok(self.summary)
    }

    fn drain(&mut self, source: &mut dyn RecordSource) -> Result<()> {
        while let Some(event) = source.next_event()? {
            match event {
                RecordEvent::Table(descriptor) => {
                    self.reporter.check_cancelled()?;
                    self.bind(descriptor)?
                }
                RecordEvent::Row(values) => self.load_row(values)?,
            }
        }
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.reporter.log(&message);
        self.summary.warnings.push(message);
    }

    fn bind(&mut self, descriptor: TableDescriptor) -> Result<()> {
        self.binding = None;
        let name = descriptor.name;
        if !self.target_tables.contains(&name) {
            match descriptor.ddl.as_deref() {
                Some(ddl) if self.options.create_missing => {
                    self.driver
                        .execute(ddl)
                        .with_msg(format!("Creating table {name} failed"))?;
                    self.target_tables.insert(name.clone());
                    self.reporter.log(&format!("Created missing table {name}"));
                }
                _ => {
                    if self.warned_tables.insert(name.clone()) {
                        self.warn(format!(
                            "Table {name} does not exist in the target, its rows are skipped"
                        ));
                    }
                    return Ok(());
                }
            }
        }

        let target: Vec<Column> = self.driver.columns(&name)?;
        let incoming = if descriptor.columns.is_empty() {
            target.iter().map(|c| c.name.clone()).collect()
        } else {
            descriptor.columns
        };
        let (columns, dropped): (Vec<_>, Vec<_>) = incoming
            .into_iter()
            .enumerate()
            .partition(|(_, c)| target.iter().any(|t| &t.name == c));
        if !dropped.is_empty() && self.warned_tables.insert(format!("{name}.columns")) {
            let names: Vec<String> = dropped.into_iter().map(|(_, c)| c).collect();
            self.warn(format!(
                "Columns {} of {name} are not in the target and were dropped",
                names.join(", ")
            ));
        }

        let key: Vec<String> = target
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        let surrogate_key = match key.as_slice() {
            [k] if target.iter().any(|c| &c.name == k && c.is_integer()) => Some(k.clone()),
            _ => None,
        };
        if !self.summary.tables.contains(&name) {
            self.summary.tables.push(name.clone());
        }
        self.binding = Some(Binding {
            table: name,
            columns,
            key,
            surrogate_key,
        });
        Ok(())
    }

    fn load_row(&mut self, values: Vec<Value>) -> Result<()> {
        self.summary.stats.total += 1;
        let Some(binding) = self.binding.as_ref() else {
            self.summary.stats.skipped += 1;
            return Ok(());
        };
        let row: Map<String, Value> = binding
            .columns
            .iter()
            .filter_map(|(i, name)| values.get(*i).map(|v| (name.clone(), v.clone())))
            .collect();

        match apply_row(&mut *self.driver, binding, &self.options, row) {
            Ok(RowOutcome::Imported) => self.summary.stats.imported += 1,
            Ok(RowOutcome::Skipped) => self.summary.stats.skipped += 1,
            Err(e) if matches!(e.kind(), ErrorKind::Connectivity | ErrorKind::Cancelled) => {
                return Err(e)
            }
            Err(e) => {
                self.summary.stats.failed += 1;
                if self.row_warnings < MAX_ROW_WARNINGS {
                    self.row_warnings += 1;
                    let message = format!("Row {} of {} failed: {}", self.summary.stats.total, binding.table, e.summary());
                    self.warn(message);
                }
            }
        }

        self.since_commit += 1;
        if self.since_commit >= BATCH_SIZE {
            self.since_commit = 0;
            self.driver.commit()?;
            self.reporter.check_cancelled()?;
            self.driver.begin()?;
        }
        Ok(())
    }
}

/// Turns constraint checks off. A refusal, such as a role without the
/// privilege, becomes a warning; an unreachable target stays an error.
pub fn relax_or_warn(driver: &mut dyn SqlDriver) -> Result<Option<String>> {
    match driver.relax_constraints(true) {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == ErrorKind::Connectivity => Err(e),
        Err(e) => Ok(Some(format!(
            "Constraint checks stay on, turning them off was refused: {}",
            e.summary()
        ))),
    }
}

fn has_key(binding: &Binding, row: &Map<String, Value>) -> bool {
    !binding.key.is_empty() && binding.key.iter().all(|k| row.contains_key(k))
}

fn apply_row(
    driver: &mut dyn SqlDriver,
    binding: &Binding,
    options: &LoadOptions,
    mut row: Map<String, Value>,
) -> Result<RowOutcome> {
    let table = binding.table.as_str();
    if options.update_only {
        if !has_key(binding, &row) {
            return Ok(RowOutcome::Skipped);
        }
        return Ok(match driver.update_row(table, &binding.key, &row)? {
            0 => RowOutcome::Skipped,
            _ => RowOutcome::Imported,
        });
    }

    if driver.insert_row(table, &row)? == InsertOutcome::Inserted {
        return Ok(RowOutcome::Imported);
    }
    match options.conflict {
        ConflictResolution::Skip => Ok(RowOutcome::Skipped),
        ConflictResolution::Overwrite => {
            if has_key(binding, &row) && driver.update_row(table, &binding.key, &row)? > 0 {
                Ok(RowOutcome::Imported)
            } else {
                Err(Error::conflict(
                    table,
                    "row collides on a unique key other than the primary key",
                ))
            }
        }
        ConflictResolution::KeepBoth => {
            let Some(key) = &binding.surrogate_key else {
                return Err(Error::conflict(
                    table,
                    "keep_both needs a single integer primary key to assign a new one",
                ));
            };
            row.remove(key);
            match driver.insert_row(table, &row)? {
                InsertOutcome::Inserted => Ok(RowOutcome::Imported),
                InsertOutcome::Conflict => Err(Error::conflict(
                    table,
                    "row still collides after dropping its primary key",
                )),
            }
        }
    }
}

/// Every table of a live database as records. Used for artifacts that are
/// database files themselves.
pub struct DriverSource<D: SqlDriver> {
    driver: D,
    tables: VecDeque<String>,
    current: Option<(String, Vec<Column>)>,
    offset: u64,
    exhausted: bool,
    rows: VecDeque<Vec<Value>>,
}

impl<D: SqlDriver> DriverSource<D> {
    pub fn new<F: Fn(&str) -> bool>(mut driver: D, filter: F) -> Result<Self> {
        let tables = driver
            .list_tables()?
            .into_iter()
            .filter(|t| filter(t))
            .collect();
        Ok(Self {
            driver,
            tables,
            current: None,
            offset: 0,
            exhausted: true,
            rows: VecDeque::new(),
        })
    }
}

impl<D: SqlDriver> RecordSource for DriverSource<D> {
    fn next_event(&mut self) -> Result<Option<RecordEvent>> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Ok(Some(RecordEvent::Row(row)));
            }
            if let (Some((table, columns)), false) = (&self.current, self.exhausted) {
                let page = self
                    .driver
                    .fetch_rows(table, columns, self.offset, PAGE_SIZE)?;
                let n = page.len() as u64;
                self.offset += n;
                self.exhausted = n < PAGE_SIZE;
                self.rows.extend(page);
                continue;
            }

            let Some(table) = self.tables.pop_front() else {
                return Ok(None);
            };
            let columns = self.driver.columns(&table)?;
            let descriptor = TableDescriptor {
                name: table.clone(),
                columns: columns.iter().map(|c| c.name.clone()).collect(),
                primary_key: columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| c.name.clone())
                    .collect(),
                ddl: self.driver.table_ddl(&table)?,
                row_count: Some(self.driver.count_rows(&table)?),
            };
            self.current = Some((table, columns));
            self.offset = 0;
            self.exhausted = false;
            return Ok(Some(RecordEvent::Table(descriptor)));
        }
    }
}
