use crate::vault::model::backup_record::{BackupRecord, BackupStatus};
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use chrono::{DateTime, Datelike, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Reverse;
use std::collections::HashSet;
use uuid::Uuid;
use validator::Validate;

fn default_keep_last() -> usize {
    3
}

fn default_retention() -> std::time::Duration {
    std::time::Duration::from_secs(7 * 24 * 3600)
}

#[skip_serializing_none]
#[derive(Clone, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Newest records kept whatever their age or status. The newest usable
    /// backups are kept on the same count, so failed runs never push them out.
    #[serde(default = "default_keep_last")]
    #[validate(range(min = 1))]
    pub keep_last: usize,
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub default_retention: std::time::Duration,
    #[serde(default, with = "humantime_serde")]
    pub daily_retention: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub monthly_retention: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub yearly_retention: Option<std::time::Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_last: default_keep_last(),
            default_retention: default_retention(),
            daily_retention: None,
            monthly_retention: None,
            yearly_retention: None,
        }
    }
}

type PeriodKey = (i32, u32, u32);

/// Keeps the newest record of each period younger than `retention`.
struct Tier {
    retention: Option<Duration>,
    period: fn(&DateTime<Utc>) -> PeriodKey,
    last_kept: Option<PeriodKey>,
}

impl Tier {
    fn new(retention: Option<std::time::Duration>, period: fn(&DateTime<Utc>) -> PeriodKey) -> Result<Self> {
        Ok(Self {
            retention: retention.map(to_chrono).transpose()?,
            period,
            last_kept: None,
        })
    }

    fn should_keep(&mut self, created_at: &DateTime<Utc>, age: Duration) -> bool {
        match self.retention {
            Some(retention) if age < retention => {
                let key = (self.period)(created_at);
                if self.last_kept == Some(key) {
                    false
                } else {
                    self.last_kept = Some(key);
                    true
                }
            }
            _ => false,
        }
    }
}

fn to_chrono(d: std::time::Duration) -> Result<Duration> {
    Duration::from_std(d).map_err(|e| Error::invalid_state(format!("retention {d:?}: {e}")))
}

impl RetentionConfig {
    /// Records that may be deleted at `now`, newest first. Records still being
    /// written and backups in use by unfinished restore jobs are never chosen.
    pub fn select_expired<'a>(
        &self,
        records: &'a [BackupRecord],
        in_use: &HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<&'a BackupRecord>> {
        let default_retention = to_chrono(self.default_retention)?;
        let mut tiers = [
            Tier::new(self.yearly_retention, |d| (d.year(), 0, 0))?,
            Tier::new(self.monthly_retention, |d| (d.year(), d.month(), 0))?,
            Tier::new(self.daily_retention, |d| (d.year(), d.month(), d.day()))?,
        ];
        let mut usable_seen = 0;

        let expired = records
            .iter()
            .sorted_by_key(|r| Reverse(r.created_at))
            .enumerate()
            .filter(|(position, r)| {
                let age = now.signed_duration_since(r.created_at);
                let within_floor = *position < self.keep_last;
                match r.status {
                    BackupStatus::Pending | BackupStatus::InProgress => false,
                    BackupStatus::Failed => !within_floor && age >= default_retention,
                    BackupStatus::Completed | BackupStatus::Restored => {
                        usable_seen += 1;
                        if within_floor || usable_seen <= self.keep_last || age < default_retention {
                            return false;
                        }
                        // Every tier sees the record so each tracks its own periods.
                        let kept = tiers
                            .iter_mut()
                            .map(|t| t.should_keep(&r.created_at, age))
                            .fold(false, |a, b| a || b);
                        !kept
                    }
                }
            })
            .map(|(_, r)| r)
            .filter(|r| {
                if in_use.contains(&r.id) {
                    tracing::debug!("Backup {} is used by a running restore, kept", r.id);
                    false
                } else {
                    true
                }
            })
            .collect();
        Ok(expired)
    }
}
