//! Interchange artifacts: JSON Lines with one header line, then for every table a
//! descriptor object followed by one array per row.
//!
//! ```text
//! {"format":"k_dbvault.interchange","version":1,"engine":"sqlite",...}
//! {"name":"customers","columns":["id","name"],"primary_key":["id"],"ddl":"CREATE TABLE ..."}
//! [1,"Ada"]
//! [2,"Grace"]
//! ```

use crate::vault::artifact::records::{RecordEvent, RecordSource, TableDescriptor};
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};

pub const INTERCHANGE_FORMAT: &str = "k_dbvault.interchange";
pub const INTERCHANGE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeHeader {
    pub format: String,
    pub version: u32,
    pub engine: Engine,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
}

impl InterchangeHeader {
    pub fn new(engine: Engine, backup_type: BackupType) -> Self {
        Self {
            format: INTERCHANGE_FORMAT.to_owned(),
            version: INTERCHANGE_VERSION,
            engine,
            backup_type,
            created_at: Utc::now(),
        }
    }
}

/// Whether the first line of `head` is an interchange header.
pub fn is_interchange_head(head: &[u8]) -> bool {
    let first_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let Ok(line) = std::str::from_utf8(first_line) else {
        return false;
    };
    let line = line.trim_start_matches('\u{feff}').trim();
    if !line.starts_with('{') {
        return false;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(v) => v.get("format").and_then(Value::as_str) == Some(INTERCHANGE_FORMAT),
        // header longer than the sniffed prefix
        Err(_) => line.contains(&format!("\"format\":\"{INTERCHANGE_FORMAT}\"")),
    }
}

pub struct InterchangeWriter<W: Write> {
    writer: W,
    columns: Option<usize>,
    rows: u64,
}

impl<W: Write> InterchangeWriter<W> {
    pub fn new(mut writer: W, header: &InterchangeHeader) -> Result<Self> {
        serde_json::to_writer(&mut writer, header)?;
        writer.write_all(b"\n")?;
        Ok(Self {
            writer,
            columns: None,
            rows: 0,
        })
    }

    pub fn begin_table(&mut self, table: &TableDescriptor) -> Result<()> {
        serde_json::to_writer(&mut self.writer, table)?;
        self.writer.write_all(b"\n")?;
        self.columns = Some(table.columns.len());
        Ok(())
    }

    pub fn write_row(&mut self, row: &[Value]) -> Result<()> {
        match self.columns {
            None => return Err(Error::invalid_state("row written before its table")),
            Some(n) if n != row.len() => {
                return Err(Error::invalid_state(format!(
                    "row has {} values, table has {} columns",
                    row.len(),
                    n
                )))
            }
            _ => {}
        }
        serde_json::to_writer(&mut self.writer, row)?;
        self.writer.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

type TableFilter = Box<dyn Fn(&str) -> bool + Send>;

/// Streams an interchange artifact as [`RecordEvent`]s. Rows of tables rejected by
/// the filter are skipped without being parsed.
pub struct InterchangeReader<R: BufRead> {
    reader: R,
    header: InterchangeHeader,
    filter: Option<TableFilter>,
    skipping: bool,
    line_no: u64,
    line: String,
}

impl<R: BufRead> InterchangeReader<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let header: InterchangeHeader = serde_json::from_str(line.trim_start_matches('\u{feff}'))
            .map_err(|e| Error::format(format!("interchange header: {e}")))?;
        if header.format != INTERCHANGE_FORMAT {
            return Err(Error::format(format!(
                "unexpected interchange format {:?}",
                header.format
            )));
        }
        if header.version > INTERCHANGE_VERSION {
            return Err(Error::format(format!(
                "interchange version {} is newer than supported {}",
                header.version, INTERCHANGE_VERSION
            )));
        }
        Ok(Self {
            reader,
            header,
            filter: None,
            skipping: false,
            line_no: 1,
            line,
        })
    }

    pub fn with_table_filter<F: Fn(&str) -> bool + Send + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn header(&self) -> &InterchangeHeader {
        &self.header
    }

    fn selected(&self, table: &str) -> bool {
        self.filter.as_ref().map(|f| f(table)).unwrap_or(true)
    }
}

impl<R: BufRead> RecordSource for InterchangeReader<R> {
    fn next_event(&mut self) -> Result<Option<RecordEvent>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('{') {
                let table: TableDescriptor = serde_json::from_str(line).map_err(|e| {
                    Error::format(format!("line {}: bad table descriptor: {e}", self.line_no))
                })?;
                self.skipping = !self.selected(&table.name);
                if self.skipping {
                    tracing::debug!("Skipping table {} from interchange artifact", table.name);
                    continue;
                }
                return Ok(Some(RecordEvent::Table(table)));
            }

            if self.skipping {
                continue;
            }
            let row: Vec<Value> = serde_json::from_str(line)
                .map_err(|e| Error::format(format!("line {}: bad row: {e}", self.line_no)))?;
            return Ok(Some(RecordEvent::Row(row)));
        }
    }
}
