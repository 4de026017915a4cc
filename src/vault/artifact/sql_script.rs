//! SQL dump text: statement splitting, classification and conversion of data
//! statements (`INSERT ... VALUES`, `COPY ... FROM stdin`) into records.

use crate::vault::artifact::records::{
    blob_value, decode_hex, RecordEvent, RecordSource, TableDescriptor,
};
use crate::vault::model::connection::Engine;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use serde_json::{Number, Value};
use std::collections::VecDeque;

/// String literal rules. MySQL treats a backslash inside quotes as an escape,
/// standard SQL does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Standard,
    MySql,
}

impl Dialect {
    pub fn for_engine(engine: Engine) -> Dialect {
        match engine {
            Engine::MySql => Dialect::MySql,
            _ => Dialect::Standard,
        }
    }

    /// Guesses the dialect of a script of unknown origin from its beginning.
    pub fn sniff(head: &str) -> Dialect {
        let mysql_markers = ["-- MySQL dump", "-- MariaDB dump", "/*!40", "ENGINE=", "CREATE TABLE `"];
        if mysql_markers.iter().any(|m| head.contains(m)) {
            Dialect::MySql
        } else {
            Dialect::Standard
        }
    }

    fn backslash_escapes(self) -> bool {
        self == Dialect::MySql
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    CreateTable,
    Insert,
    /// `COPY ... FROM stdin` with its data block
    Copy,
    /// `OWNER TO`, `GRANT`, `REVOKE`, `SET ROLE` and friends
    Ownership,
    /// `BEGIN`, `COMMIT`, `ROLLBACK`
    Transaction,
    /// psql backslash command
    MetaCommand,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub text: String,
    pub kind: StatementKind,
    pub table: Option<String>,
    /// Raw data lines of a `COPY ... FROM stdin`, without the `\.` terminator.
    pub copy_data: Vec<String>,
}

impl Statement {
    fn new(text: String) -> Self {
        let (kind, table) = classify(&text);
        Self {
            text,
            kind,
            table,
            copy_data: vec![],
        }
    }

    /// Statements a plain driver connection can execute.
    pub fn is_executable(&self) -> bool {
        !matches!(
            self.kind,
            StatementKind::Ownership | StatementKind::Transaction | StatementKind::MetaCommand
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment(u32),
    Dollar,
}

/// Splits a script into statements. Quotes, dollar quotes, comments and
/// `COPY ... FROM stdin` data blocks are honoured. Comments are dropped.
pub fn split_statements(script: &str, dialect: Dialect) -> Result<Vec<Statement>> {
    let chars: Vec<char> = script.chars().collect();
    let mut out = vec![];
    let mut current = String::new();
    let mut state = State::Normal;
    let mut dollar_tag = String::new();
    let mut i = 0;
    let mut at_line_start = true;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Normal => {
                if at_line_start && c == '\\' && current.trim().is_empty() {
                    let end = line_end(&chars, i);
                    let line: String = chars[i..end].iter().collect();
                    out.push(Statement {
                        text: line.trim().to_owned(),
                        kind: StatementKind::MetaCommand,
                        table: None,
                        copy_data: vec![],
                    });
                    current.clear();
                    i = end;
                    continue;
                }
                match c {
                    '\'' => state = State::SingleQuote,
                    '"' => state = State::DoubleQuote,
                    '`' => state = State::Backtick,
                    '-' if next == Some('-') => {
                        state = State::LineComment;
                        i += 2;
                        continue;
                    }
                    '#' if current.trim().is_empty() => {
                        state = State::LineComment;
                        i += 1;
                        continue;
                    }
                    '/' if next == Some('*') => {
                        state = State::BlockComment(1);
                        i += 2;
                        continue;
                    }
                    '$' => {
                        if let Some(tag) = dollar_tag_at(&chars, i) {
                            current.push_str(&tag);
                            i += tag.chars().count();
                            dollar_tag = tag;
                            state = State::Dollar;
                            continue;
                        }
                    }
                    ';' => {
                        let text = current.trim().to_owned();
                        current.clear();
                        i += 1;
                        if text.is_empty() {
                            continue;
                        }
                        let mut stmt = Statement::new(text);
                        if stmt.kind == StatementKind::Copy && is_copy_from_stdin(&stmt.text) {
                            i = line_end(&chars, i);
                            if i < chars.len() {
                                i += 1;
                            }
                            i = read_copy_data(&chars, i, &mut stmt.copy_data)?;
                            at_line_start = true;
                        } else {
                            at_line_start = false;
                        }
                        out.push(stmt);
                        continue;
                    }
                    _ => {}
                }
                current.push(c);
            }
            State::SingleQuote => {
                current.push(c);
                if c == '\\' && dialect.backslash_escapes() {
                    if let Some(n) = next {
                        current.push(n);
                        i += 2;
                        continue;
                    }
                }
                if c == '\'' {
                    if next == Some('\'') {
                        current.push('\'');
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
                i += 1;
                continue;
            }
            State::DoubleQuote | State::Backtick => {
                current.push(c);
                let close = if state == State::DoubleQuote { '"' } else { '`' };
                if c == close {
                    if next == Some(close) {
                        current.push(close);
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
                i += 1;
                continue;
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    current.push('\n');
                    at_line_start = true;
                }
                i += 1;
                continue;
            }
            State::BlockComment(depth) => {
                if c == '*' && next == Some('/') {
                    state = if depth == 1 {
                        current.push(' ');
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    i += 2;
                } else if c == '/' && next == Some('*') {
                    state = State::BlockComment(depth + 1);
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            State::Dollar => {
                if c == '$' && starts_with_at(&chars, i, &dollar_tag) {
                    current.push_str(&dollar_tag);
                    i += dollar_tag.chars().count();
                    state = State::Normal;
                } else {
                    current.push(c);
                    i += 1;
                }
                continue;
            }
        }
        at_line_start = c == '\n';
        i += 1;
    }

    match state {
        State::SingleQuote | State::DoubleQuote | State::Backtick | State::Dollar => {
            return Err(Error::format("unterminated quoted text at end of script"))
        }
        _ => {}
    }
    let rest = current.trim();
    if !rest.is_empty() {
        out.push(Statement::new(rest.to_owned()));
    }
    Ok(out)
}

fn line_end(chars: &[char], from: usize) -> usize {
    chars[from..]
        .iter()
        .position(|c| *c == '\n')
        .map(|p| from + p)
        .unwrap_or(chars.len())
}

fn starts_with_at(chars: &[char], at: usize, s: &str) -> bool {
    let mut idx = at;
    for c in s.chars() {
        if chars.get(idx) != Some(&c) {
            return false;
        }
        idx += 1;
    }
    true
}

/// `$$` or `$tag$` starting at `at`.
fn dollar_tag_at(chars: &[char], at: usize) -> Option<String> {
    if at > 0 && (chars[at - 1].is_alphanumeric() || chars[at - 1] == '_') {
        return None;
    }
    let mut tag = String::from('$');
    for c in chars.iter().skip(at + 1) {
        match c {
            '$' => {
                tag.push('$');
                return Some(tag);
            }
            c if c.is_alphanumeric() || *c == '_' => tag.push(*c),
            _ => return None,
        }
    }
    None
}

fn read_copy_data(chars: &[char], mut i: usize, data: &mut Vec<String>) -> Result<usize> {
    while i < chars.len() {
        let end = line_end(chars, i);
        let line: String = chars[i..end].iter().collect();
        i = (end + 1).min(chars.len());
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if line == "\\." {
            return Ok(i);
        }
        data.push(line.to_owned());
    }
    Err(Error::format("COPY data block without terminating \\."))
}

fn is_copy_from_stdin(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.contains("FROM STDIN")
}

fn keywords(text: &str, n: usize) -> Vec<String> {
    text.split_whitespace()
        .take(n)
        .map(|w| w.trim_end_matches('(').to_ascii_uppercase())
        .collect()
}

fn classify(text: &str) -> (StatementKind, Option<String>) {
    let words = keywords(text, 6);
    let w = |i: usize| words.get(i).map(String::as_str).unwrap_or_default();
    let upper = text.to_ascii_uppercase();

    match w(0) {
        "CREATE" => {
            let table_pos = words.iter().position(|k| k == "TABLE");
            match table_pos {
                Some(p) if p <= 3 => (StatementKind::CreateTable, table_after(text, "TABLE")),
                _ => (StatementKind::Other, None),
            }
        }
        "INSERT" | "REPLACE" => (StatementKind::Insert, table_after(text, "INTO")),
        "COPY" => (
            StatementKind::Copy,
            parse_identifier(text.trim_start()[4..].trim_start()).map(|(t, _)| t),
        ),
        "GRANT" | "REVOKE" => (StatementKind::Ownership, None),
        "ALTER" if upper.contains(" OWNER TO ") || w(1) == "DEFAULT" => {
            (StatementKind::Ownership, None)
        }
        "SET" if w(1) == "ROLE" || (w(1) == "SESSION" && w(2) == "AUTHORIZATION") => {
            (StatementKind::Ownership, None)
        }
        "BEGIN" | "COMMIT" | "ROLLBACK" | "END" => (StatementKind::Transaction, None),
        "START" if w(1) == "TRANSACTION" => (StatementKind::Transaction, None),
        _ => (StatementKind::Other, None),
    }
}

/// Table name following the first `keyword` (case-insensitive), skipping
/// `IF NOT EXISTS`.
fn table_after(text: &str, keyword: &str) -> Option<String> {
    let upper = text.to_ascii_uppercase();
    let mut search_from = 0;
    loop {
        let pos = upper[search_from..].find(keyword)? + search_from;
        let before_ok = pos == 0 || !upper.as_bytes()[pos - 1].is_ascii_alphanumeric();
        let end = pos + keyword.len();
        let after_ok = upper
            .as_bytes()
            .get(end)
            .map(|b| b.is_ascii_whitespace())
            .unwrap_or(false);
        if before_ok && after_ok {
            let mut rest = text[end..].trim_start();
            if rest.to_ascii_uppercase().starts_with("IF NOT EXISTS") {
                rest = rest[13..].trim_start();
            }
            return parse_identifier(rest).map(|(name, _)| name);
        }
        search_from = end;
    }
}

/// Parses a possibly qualified and quoted identifier. Returns the last name part
/// and the rest of the text.
pub fn parse_identifier(text: &str) -> Option<(String, &str)> {
    let mut rest = text;
    loop {
        let (part, after) = identifier_part(rest)?;
        match after.strip_prefix('.') {
            Some(after_dot) => rest = after_dot,
            None => return Some((part, after)),
        }
    }
}

fn identifier_part(text: &str) -> Option<(String, &str)> {
    let mut chars = text.char_indices();
    let (_, first) = chars.next()?;
    let close = match first {
        '"' => '"',
        '`' => '`',
        '[' => ']',
        c if c.is_alphanumeric() || c == '_' => {
            let end = text
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '$'))
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            return Some((text[..end].to_owned(), &text[end..]));
        }
        _ => return None,
    };
    let mut name = String::new();
    let mut iter = text[1..].char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if c == close {
            if close != ']' && iter.peek().map(|(_, n)| *n) == Some(close) {
                name.push(c);
                iter.next();
                continue;
            }
            return Some((name, &text[1 + i + c.len_utf8()..]));
        }
        name.push(c);
    }
    None
}

fn parse_column_list(text: &str) -> Option<(Vec<String>, &str)> {
    let mut rest = text.trim_start().strip_prefix('(')?;
    let mut cols = vec![];
    loop {
        let (name, after) = parse_identifier(rest.trim_start())?;
        cols.push(name);
        let after = after.trim_start();
        if let Some(r) = after.strip_prefix(',') {
            rest = r;
        } else {
            return after.strip_prefix(')').map(|r| (cols, r));
        }
    }
}

/// Rows of a literal-only `INSERT ... VALUES (...), (...)`. `None` when the
/// statement uses expressions, subqueries or `ON CONFLICT` clauses that cannot be
/// reduced to plain records.
pub fn parse_insert(
    stmt: &Statement,
    dialect: Dialect,
) -> Option<(TableDescriptor, Vec<Vec<Value>>)> {
    if stmt.kind != StatementKind::Insert {
        return None;
    }
    let upper = stmt.text.to_ascii_uppercase();
    let into = upper.find("INTO")? + 4;
    let (table, rest) = parse_identifier(stmt.text[into..].trim_start())?;
    let (columns, rest) = match parse_column_list(rest) {
        Some((cols, r)) => (cols, r),
        None => (vec![], rest),
    };
    let rest = rest.trim_start();
    if !rest.to_ascii_uppercase().starts_with("VALUES") {
        return None;
    }
    let mut p = LiteralParser {
        chars: rest[6..].chars().collect(),
        pos: 0,
        dialect,
    };
    let mut rows = vec![];
    loop {
        rows.push(p.tuple()?);
        p.skip_ws();
        match p.peek() {
            Some(',') => p.pos += 1,
            None => break,
            Some(_) => return None,
        }
    }
    Some((
        TableDescriptor {
            name: table,
            columns,
            ..Default::default()
        },
        rows,
    ))
}

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    dialect: Dialect,
}

impl LiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn tuple(&mut self) -> Option<Vec<Value>> {
        self.skip_ws();
        if self.peek()? != '(' {
            return None;
        }
        self.pos += 1;
        let mut values = vec![];
        loop {
            self.skip_ws();
            values.push(self.literal()?);
            self.skip_ws();
            match self.peek()? {
                ',' => self.pos += 1,
                ')' => {
                    self.pos += 1;
                    return Some(values);
                }
                _ => return None,
            }
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn quoted(&mut self) -> Option<String> {
        self.pos += 1;
        let mut s = String::new();
        loop {
            let c = self.peek()?;
            self.pos += 1;
            match c {
                '\'' if self.peek() == Some('\'') => {
                    self.pos += 1;
                    s.push('\'');
                }
                '\'' => return Some(s),
                '\\' if self.dialect.backslash_escapes() => {
                    let e = self.peek()?;
                    self.pos += 1;
                    s.push(match e {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                }
                c => s.push(c),
            }
        }
    }

    fn literal(&mut self) -> Option<Value> {
        match self.peek()? {
            '\'' => self.quoted().map(Value::String),
            c if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                let start = self.pos;
                self.pos += 1;
                while self
                    .peek()
                    .map(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
                    .unwrap_or(false)
                {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                number(&text)
            }
            c if c.is_alphabetic() => {
                let word = self.word();
                match word.to_ascii_uppercase().as_str() {
                    "NULL" => Some(Value::Null),
                    "TRUE" => Some(Value::Bool(true)),
                    "FALSE" => Some(Value::Bool(false)),
                    "X" if self.peek() == Some('\'') => {
                        let hex = self.quoted()?;
                        decode_hex(&hex).map(|b| blob_value(&b))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Column names of a `COPY table (a, b) FROM stdin`.
pub fn copy_columns(stmt: &Statement) -> Vec<String> {
    let rest = stmt.text.trim_start()[4..].trim_start();
    parse_identifier(rest)
        .and_then(|(_, rest)| parse_column_list(rest))
        .map(|(cols, _)| cols)
        .unwrap_or_default()
}

/// One tab-separated `COPY` text line. `\N` is NULL, values stay text.
pub fn parse_copy_line(line: &str) -> Vec<Value> {
    line.split('\t')
        .map(|field| {
            if field == "\\N" {
                return Value::Null;
            }
            let mut out = String::with_capacity(field.len());
            let mut chars = field.chars();
            while let Some(c) = chars.next() {
                if c != '\\' {
                    out.push(c);
                    continue;
                }
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('v') => out.push('\u{b}'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            }
            Value::String(out)
        })
        .collect()
}

/// Record view of a SQL script. Statements that do not carry rows are counted
/// in `ignored` and otherwise skipped.
pub struct SqlScriptSource {
    statements: std::vec::IntoIter<Statement>,
    dialect: Dialect,
    pending: VecDeque<RecordEvent>,
    filter: Option<Box<dyn Fn(&str) -> bool + Send>>,
    pub ignored: u64,
}

impl SqlScriptSource {
    pub fn new(statements: Vec<Statement>, dialect: Dialect) -> Self {
        Self {
            statements: statements.into_iter(),
            dialect,
            pending: VecDeque::new(),
            filter: None,
            ignored: 0,
        }
    }

    pub fn with_table_filter<F: Fn(&str) -> bool + Send + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    fn selected(&self, table: &str) -> bool {
        self.filter.as_ref().map(|f| f(table)).unwrap_or(true)
    }
}

impl RecordSource for SqlScriptSource {
    fn next_event(&mut self) -> Result<Option<RecordEvent>> {
        loop {
            if let Some(e) = self.pending.pop_front() {
                return Ok(Some(e));
            }
            let Some(stmt) = self.statements.next() else {
                return Ok(None);
            };
            let Some(table) = stmt.table.clone() else {
                self.ignored += 1;
                continue;
            };
            if !self.selected(&table) {
                continue;
            }
            match stmt.kind {
                StatementKind::CreateTable => {
                    self.pending.push_back(RecordEvent::Table(TableDescriptor {
                        name: table,
                        ddl: Some(stmt.text),
                        ..Default::default()
                    }));
                }
                StatementKind::Insert => match parse_insert(&stmt, self.dialect) {
                    Some((descriptor, rows)) => {
                        self.pending.push_back(RecordEvent::Table(descriptor));
                        self.pending.extend(rows.into_iter().map(RecordEvent::Row));
                    }
                    None => {
                        tracing::warn!("Cannot convert INSERT into {} to records, skipped", table);
                        self.ignored += 1;
                    }
                },
                StatementKind::Copy => {
                    self.pending.push_back(RecordEvent::Table(TableDescriptor {
                        name: table,
                        columns: copy_columns(&stmt),
                        ..Default::default()
                    }));
                    self.pending.extend(
                        stmt.copy_data
                            .iter()
                            .map(|l| RecordEvent::Row(parse_copy_line(l))),
                    );
                }
                _ => self.ignored += 1,
            }
        }
    }
}
