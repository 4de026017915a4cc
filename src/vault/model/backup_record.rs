use crate::vault::artifact::ArtifactFormat;
use crate::vault::model::connection::Engine;
use crate::vault::model::text_enum;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Schema,
    Data,
}

text_enum!(BackupType {
    Full => "full",
    Schema => "schema",
    Data => "data",
});

impl BackupType {
    pub fn has_schema(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Schema)
    }

    pub fn has_data(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Restored,
}

text_enum!(BackupStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Restored => "restored",
});

impl BackupStatus {
    /// Statuses a record may be in before moving to `self`.
    pub fn predecessors(&self) -> &'static [BackupStatus] {
        match self {
            BackupStatus::Pending => &[],
            BackupStatus::InProgress => &[BackupStatus::Pending],
            BackupStatus::Completed | BackupStatus::Failed => {
                &[BackupStatus::Pending, BackupStatus::InProgress]
            }
            BackupStatus::Restored => &[BackupStatus::Completed, BackupStatus::Restored],
        }
    }

    /// Records with a usable artifact.
    pub fn is_restorable(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Restored)
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: Uuid,
    pub connection_id: Option<Uuid>,
    pub backup_type: BackupType,
    pub engine: Engine,
    pub format: ArtifactFormat,
    pub location: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub compressed: bool,
    pub encrypted: bool,
    pub status: BackupStatus,
    pub error_message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
