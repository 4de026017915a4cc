use crate::vault::model::text_enum;
use crate::vault::result_error::error::{Error, ErrorKind};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::ops::AddAssign;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Restore,
    Import,
}

text_enum!(JobKind {
    Restore => "restore",
    Import => "import",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    #[default]
    Full,
    Merge,
    Update,
    Selective,
}

text_enum!(ImportMode {
    Full => "full",
    Merge => "merge",
    Update => "update",
    Selective => "selective",
});

impl ImportMode {
    /// Modes that may clear target tables before loading.
    pub fn allows_clearing(&self) -> bool {
        matches!(self, ImportMode::Full | ImportMode::Selective)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    Skip,
    Overwrite,
    #[serde(alias = "keep-both")]
    #[value(alias = "keep_both")]
    KeepBoth,
}

text_enum!(ConflictResolution {
    Skip => "skip",
    Overwrite => "overwrite",
    KeepBoth => "keep_both",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    /// Statuses only move forward: pending -> processing -> completed | failed.
    /// A pending job may fail directly (cancelled or interrupted before pickup).
    pub fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[],
            JobStatus::Processing => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Processing],
            JobStatus::Failed => &[JobStatus::Pending, JobStatus::Processing],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Row counters of a restore or import. Whole-file loads through native tools
/// only know table row counts afterwards, `estimated` marks those.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub total: u64,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
    #[serde(default)]
    pub estimated: bool,
}

impl AddAssign for ImportStats {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.imported += rhs.imported;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
        self.estimated |= rhs.estimated;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    Backup { backup_id: Uuid },
    File { path: PathBuf },
}

/// What a failed job exposes to operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub message: String,
    pub details: String,
    pub suggestions: Vec<String>,
}

impl From<&Error> for ErrorDetails {
    fn from(e: &Error) -> Self {
        let kind = e.kind();
        Self {
            kind,
            message: e.summary(),
            details: e.to_string(),
            suggestions: kind.suggestions(),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub source: JobSource,
    pub target_id: Uuid,
    pub mode: ImportMode,
    pub clear_data: bool,
    pub table_groups: Vec<String>,
    pub conflict_resolution: ConflictResolution,
    pub status: JobStatus,
    pub log: String,
    pub stats: ImportStats,
    pub error_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_conflict_resolution_accepts_dash_spelling() {
        let c: ConflictResolution = serde_json::from_str("\"keep-both\"").unwrap();
        assert_eq!(c, ConflictResolution::KeepBoth);
        assert_eq!("keep_both".parse::<ConflictResolution>().unwrap(), c);
    }

    #[test]
    fn test_stats_add() {
        let mut a = ImportStats {
            total: 2,
            imported: 1,
            skipped: 1,
            ..Default::default()
        };
        a += ImportStats {
            total: 3,
            failed: 3,
            estimated: true,
            ..Default::default()
        };
        assert_eq!((a.total, a.imported, a.skipped, a.failed), (5, 1, 1, 3));
        assert!(a.estimated);
    }

    #[test]
    fn test_error_details_from_error() {
        let details = ErrorDetails::from(&Error::connectivity("db", "connection refused"));
        assert_eq!(details.kind, ErrorKind::Connectivity);
        assert!(details.details.contains("connection refused"));
        assert!(!details.suggestions.is_empty());
    }
}
