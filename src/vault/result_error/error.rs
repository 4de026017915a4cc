use crate::vault::result_error::{WithDebugObjectAndFnName, WithFnName, WithMsg};
use itertools::Itertools;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::mpsc::SendError;
use thiserror::Error;
use thiserror_ext::Construct;

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    AgeDecrypt(#[from] age::DecryptError),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    Bcrypt(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Uuid(#[from] uuid::Error),
    #[error("cannot reach {target}: {reason}")]
    Connectivity { target: String, reason: String },
    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
    #[error("`{command}` exited with {status}:\n{}", indent::indent_all_with("  ", stderr))]
    ToolFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("invalid artifact: {0}")]
    Format(String),
    #[error("unresolved conflict in table {table}: {detail}")]
    Conflict { table: String, detail: String },
    #[error("{target} already has a restore or import job running")]
    Busy { target: String },
    #[error("{what} {id} not found")]
    NotFound { what: String, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("lock poisoned: {0}")]
    Poisoned(String),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { error: Box<Error>, fn_name: String },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Coarse classification of an [`Error`], used for job failure details and
/// for deciding whether a restore step may fall through to the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    ToolUnavailable,
    ToolFailed,
    Format,
    Conflict,
    Busy,
    NotFound,
    InvalidState,
    Cancelled,
    Internal,
}

impl ErrorKind {
    fn severity(self) -> u8 {
        match self {
            ErrorKind::Connectivity => 9,
            ErrorKind::Format => 8,
            ErrorKind::Cancelled => 7,
            ErrorKind::Conflict => 6,
            ErrorKind::ToolFailed => 5,
            ErrorKind::Internal => 4,
            ErrorKind::InvalidState => 3,
            ErrorKind::Busy => 2,
            ErrorKind::NotFound => 1,
            ErrorKind::ToolUnavailable => 0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "Target database is unreachable",
            ErrorKind::ToolUnavailable => "Required database tool is not installed",
            ErrorKind::ToolFailed => "Database tool reported an error",
            ErrorKind::Format => "Artifact is invalid or corrupted",
            ErrorKind::Conflict => "Conflicting records could not be resolved",
            ErrorKind::Busy => "Another job is already running on this database",
            ErrorKind::NotFound => "Requested item does not exist",
            ErrorKind::InvalidState => "Operation not allowed in the current state",
            ErrorKind::Cancelled => "Operation was cancelled",
            ErrorKind::Internal => "Unexpected internal error",
        }
    }

    pub fn suggestions(self) -> Vec<String> {
        let s: &[&str] = match self {
            ErrorKind::Connectivity => &[
                "Check host, port and credentials of the target connection",
                "Make sure the database server is running and accepts connections",
            ],
            ErrorKind::ToolUnavailable | ErrorKind::ToolFailed => &[
                "Install the database client tools or set their paths under `tools` in the config",
                "Inspect the job log for the command line and stderr of the tool",
            ],
            ErrorKind::Format => &[
                "Make sure the file is a supported backup (native dump, SQL text or interchange)",
                "If the backup was encrypted, check the configured passphrase",
                "Recreate the backup if the checksum does not match",
            ],
            ErrorKind::Conflict => &[
                "Retry with conflict resolution `skip` or `overwrite`",
                "Clear the target tables before importing",
            ],
            ErrorKind::Busy => &["Wait for the running job to finish, then retry"],
            ErrorKind::NotFound => &["List the available items and check the id"],
            ErrorKind::InvalidState => &["Check the current status of the item before retrying"],
            ErrorKind::Cancelled => &["Start the operation again if it is still needed"],
            ErrorKind::Internal => &["Inspect the job log for the full diagnostic"],
        };
        s.iter().map(|s| s.to_string()).collect()
    }
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> WithFnName<S> for Error {
    fn with_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity { .. } => ErrorKind::Connectivity,
            Error::Sqlx(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed => ErrorKind::Connectivity,
                _ => ErrorKind::Internal,
            },
            Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::CannotOpen =>
            {
                ErrorKind::Connectivity
            }
            Error::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            Error::ToolFailed { .. } => ErrorKind::ToolFailed,
            Error::Format(_)
            | Error::LiblzmaStream(_)
            | Error::AgeDecrypt(_)
            | Error::SerdeJson(_) => ErrorKind::Format,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState(_) | Error::ValidationError(_) => ErrorKind::InvalidState,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. }
            | Error::WithFnName { error, .. } => error.kind(),
            Error::LotsOfError(v) => v
                .iter()
                .map(Error::kind)
                .max_by_key(|k| k.severity())
                .unwrap_or(ErrorKind::Internal),
            _ => ErrorKind::Internal,
        }
    }

    /// Innermost error messages, without the context wrappers.
    pub fn root_messages(&self) -> Vec<String> {
        match self {
            Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. }
            | Error::WithFnName { error, .. } => error.root_messages(),
            Error::LotsOfError(v) => v.iter().flat_map(Error::root_messages).collect(),
            e => vec![e.to_string()],
        }
    }

    /// Short caller-facing message. The full `Display` output is kept for the job log.
    pub fn summary(&self) -> String {
        let kind = self.kind();
        let first = self
            .root_messages()
            .into_iter()
            .next()
            .and_then(|m| m.lines().next().map(str::to_owned))
            .unwrap_or_default();
        let first: String = first.chars().take(200).collect();
        if first.is_empty() {
            kind.label().to_owned()
        } else {
            format!("{}: {}", kind.label(), first)
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == ErrorCode::ConstraintViolation
                    && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
            }
            Error::Sqlx(sqlx::Error::Database(e)) => e.is_unique_violation(),
            Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. }
            | Error::WithFnName { error, .. } => error.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn io(kind: std::io::ErrorKind, msg: &str) -> Error {
        Error::Io(std::io::Error::new(kind, msg.to_owned()))
    }

    #[test]
    fn test_error_with_msg() {
        let error = io(std::io::ErrorKind::NotFound, "file not found").with_msg("Custom message");

        match &error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
        let error_str = error.to_string();
        assert!(error_str.contains("Custom message"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_error_with_debug_object_and_fn_name() {
        let error = io(std::io::ErrorKind::NotFound, "file not found")
            .with_debug_object_and_fn_name(42, "test_function");

        let error_str = error.to_string();
        assert!(error_str.contains("test_function"));
        assert!(error_str.contains("failed"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_error_from_send_error() {
        let (tx, rx) = mpsc::channel();
        drop(rx);

        match tx.send("test") {
            Err(send_error) => match Error::from(send_error) {
                Error::ChannelSendError(_) => (),
                _ => panic!("Expected ChannelSendError"),
            },
            Ok(_) => panic!("Expected send error"),
        }
    }

    #[test]
    fn test_error_from_vec_flattens() {
        let nested = io(std::io::ErrorKind::NotFound, "a").chain(io(std::io::ErrorKind::NotFound, "b"));
        let combined = Error::from(vec![nested, io(std::io::ErrorKind::NotFound, "c")]);
        match combined {
            Error::LotsOfError(v) => assert_eq!(v.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let _error = Error::from(Vec::<Error>::new());
    }

    #[test]
    fn test_kind_sees_through_wrappers() {
        let error = Error::format("checksum mismatch")
            .with_msg("Verifying artifact")
            .with_fn_name("restore");
        assert_eq!(error.kind(), ErrorKind::Format);
        assert!(error.summary().starts_with(ErrorKind::Format.label()));
        assert!(error.summary().contains("checksum mismatch"));
    }

    #[test]
    fn test_kind_of_aggregate_uses_most_severe() {
        let error = Error::tool_unavailable("pg_restore", "not found")
            .chain(Error::connectivity("db", "refused"));
        assert_eq!(error.kind(), ErrorKind::Connectivity);

        let error = Error::tool_unavailable("pg_restore", "not found")
            .chain(Error::tool_unavailable("psql", "not found"));
        assert_eq!(error.kind(), ErrorKind::ToolUnavailable);
    }

    #[test]
    fn test_root_messages_keep_every_step() {
        let error = Error::tool_unavailable("sqlite3", "missing")
            .chain(Error::format("bad statement").with_msg("driver"));
        let messages = error.root_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("sqlite3"));
        assert!(messages[1].contains("bad statement"));
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT UNIQUE); INSERT INTO t VALUES (1, 'a');")
            .unwrap();
        let err = Error::from(conn.execute("INSERT INTO t VALUES (1, 'b')", []).unwrap_err());
        assert!(err.is_unique_violation());
        let err = Error::from(conn.execute("INSERT INTO t VALUES (2, 'a')", []).unwrap_err());
        assert!(err.with_msg("insert").is_unique_violation());
        let err = Error::from(conn.execute("INSERT INTO missing VALUES (1)", []).unwrap_err());
        assert!(!err.is_unique_violation());
    }
}
