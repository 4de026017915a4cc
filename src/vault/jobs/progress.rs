//! Structured job progress. Workers emit a [`JobStep`] with a percentage,
//! persisted as rows; the free-text log is only for humans.

use crate::vault::model::text_enum;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Queued,
    Preparing,
    Clearing,
    NativeRestore,
    DriverStatements,
    RecordLoad,
    AdminReset,
    Finished,
}

text_enum!(JobStep {
    Queued => "queued",
    Preparing => "preparing",
    Clearing => "clearing",
    NativeRestore => "native_restore",
    DriverStatements => "driver_statements",
    RecordLoad => "record_load",
    AdminReset => "admin_reset",
    Finished => "finished",
});

impl JobStep {
    pub const ALL: [JobStep; 8] = [
        JobStep::Queued,
        JobStep::Preparing,
        JobStep::Clearing,
        JobStep::NativeRestore,
        JobStep::DriverStatements,
        JobStep::RecordLoad,
        JobStep::AdminReset,
        JobStep::Finished,
    ];

    /// Phrase written to the job log when the step starts.
    pub fn milestone(&self) -> &'static str {
        match self {
            JobStep::Queued => "Job queued",
            JobStep::Preparing => "Verifying and decoding artifact",
            JobStep::Clearing => "Clearing target tables",
            JobStep::NativeRestore => "Trying native restore tool",
            JobStep::DriverStatements => "Executing dump statements through the driver",
            JobStep::RecordLoad => "Loading records",
            JobStep::AdminReset => "Resetting administrator account",
            JobStep::Finished => "Job finished",
        }
    }

    pub fn default_percent(&self) -> u8 {
        match self {
            JobStep::Queued => 0,
            JobStep::Preparing => 10,
            JobStep::Clearing => 20,
            JobStep::NativeRestore => 30,
            JobStep::DriverStatements => 50,
            JobStep::RecordLoad => 60,
            JobStep::AdminReset => 95,
            JobStep::Finished => 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: JobStep,
    pub percent: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Best-effort progress for jobs without structured events: the furthest
/// milestone phrase found in the log wins. The log is free text, so a phrase
/// quoted inside an error message can move this forward, and it never moves
/// back only because later text was appended.
pub fn progress_from_log(log: &str) -> (JobStep, u8) {
    JobStep::ALL
        .iter()
        .rev()
        .find(|step| log.contains(step.milestone()))
        .map(|step| (*step, step.default_percent()))
        .unwrap_or((JobStep::Queued, 0))
}

/// Sink of a running job's progress and log lines.
pub trait JobReporter: Send + Sync {
    fn log(&self, line: &str);

    fn step(&self, step: JobStep, percent: u8);

    /// Starts `step`: its milestone goes to the log, its default percent to progress.
    fn enter(&self, step: JobStep) {
        self.log(step.milestone());
        self.step(step, step.default_percent());
    }

    /// `Err(Cancelled)` once the job was asked to stop.
    fn check_cancelled(&self) -> Result<()>;
}

/// Reporter that only forwards to `tracing`, for synchronous calls outside jobs.
#[derive(Clone, Debug, Default)]
pub struct NoopReporter {
    cancelled: Arc<AtomicBool>,
}

impl NoopReporter {
    pub fn with_flag(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }
}

impl JobReporter for NoopReporter {
    fn log(&self, line: &str) {
        tracing::info!("{line}");
    }

    fn step(&self, step: JobStep, percent: u8) {
        tracing::debug!("{} ({percent}%)", step.milestone());
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_from_log_takes_furthest_milestone() {
        let log = format!(
            "{}\n{}\nnative tool missing\n{}\n",
            JobStep::Queued.milestone(),
            JobStep::NativeRestore.milestone(),
            JobStep::RecordLoad.milestone()
        );
        assert_eq!(progress_from_log(&log), (JobStep::RecordLoad, 60));
        assert_eq!(progress_from_log(""), (JobStep::Queued, 0));
    }

    #[test]
    fn test_steps_are_ordered() {
        let mut percents = JobStep::ALL.iter().map(JobStep::default_percent);
        let first = percents.next().unwrap();
        percents.try_fold(first, |prev, p| (p > prev).then_some(p)).unwrap();
        assert!(JobStep::Clearing < JobStep::RecordLoad);
    }

    #[test]
    fn test_noop_reporter_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let reporter = NoopReporter::with_flag(flag.clone());
        assert!(reporter.check_cancelled().is_ok());
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(reporter.check_cancelled(), Err(Error::Cancelled)));
    }
}
