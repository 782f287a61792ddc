//! Job dispatch: one run per expanded configuration.
//!
//! - [`Scheduler`] is the seam between sweep bookkeeping and whatever runs the
//!   training step. Two implementations: [`SequentialScheduler`] (blocking, in
//!   enumeration order) and [`BatchScheduler`] (submission scripts handed to a
//!   cluster scheduler, fire-and-forget).
//! - [`Dispatcher`] drives a scheduler over an expansion. Complete runs are
//!   skipped, so a restarted sweep picks up where it stopped. A failed run is
//!   recorded and the sweep moves on.
//! - Completion is judged only from the run directory.

pub mod batch;
pub mod sequential;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sweeplab_core::{
    LayoutError, RunDirectory, RunIdentity, RunLayout, RunRecord, RunStatus, SchemaError,
    SweepExpander,
};
use thiserror::Error;
use tracing::{info, warn};

pub use batch::{BatchScheduler, ClusterResources};
pub use sequential::{CommandTrainer, SequentialScheduler, Trainer};

/// File name of the persisted [`SweepSummary`], at the output root.
pub const SUMMARY_FILE: &str = "sweep_summary.json";

/// Why a single run did not complete. Isolated to that run.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("training failed for {identity}: {message}")]
    Trainer { identity: String, message: String },

    #[error("run {identity} finished without producing {missing:?}")]
    Incomplete {
        identity: String,
        missing: Vec<PathBuf>,
    },

    #[error("submission failed for {identity}: {message}")]
    Submit { identity: String, message: String },
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub identity: RunIdentity,
    pub dir: RunDirectory,
    /// Scheduler-assigned id of a batch job.
    pub job_id: Option<String>,
    /// The job ran to the end inside `submit`.
    pub finished: bool,
}

/// Runs jobs for records.
pub trait Scheduler {
    fn name(&self) -> &str;

    /// Start (or, for blocking schedulers, run) the job of `record`. The run
    /// directory and its config already exist.
    fn submit(&mut self, record: &RunRecord) -> Result<JobHandle, RunFailure>;

    /// Current state of a submitted job, read from its directory.
    fn poll(&self, handle: &JobHandle) -> RunStatus;
}

impl<S: Scheduler + ?Sized> Scheduler for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn submit(&mut self, record: &RunRecord) -> Result<JobHandle, RunFailure> {
        (**self).submit(record)
    }

    fn poll(&self, handle: &JobHandle) -> RunStatus {
        (**self).poll(handle)
    }
}

/// Per-run entry of a [`SweepSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub index: usize,
    pub identity: String,
    pub dir: PathBuf,
    pub status: RunStatus,
    /// Already complete before this sweep started.
    pub skipped: bool,
    pub job_id: Option<String>,
    pub error: Option<String>,
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scheduler: String,
    pub output_dir: PathBuf,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub submitted: usize,
    pub failed: usize,
    pub runs: Vec<RunOutcome>,
}

impl SweepSummary {
    /// Runs complete after this pass, including skipped ones.
    pub fn complete_total(&self) -> usize {
        self.completed + self.skipped
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunOutcome> {
        self.runs.iter().filter(|r| r.status == RunStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Write `sweep_summary.json` into the output root.
    pub fn write(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;
        let path = self.output_dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self).context("failed to serialize sweep summary")?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(SUMMARY_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("malformed {}", path.display()))
    }
}

/// Drives a [`Scheduler`] over an expansion.
pub struct Dispatcher<S> {
    scheduler: S,
}

impl<S: Scheduler> Dispatcher<S> {
    pub fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Dispatch every incomplete run of `expander`.
    ///
    /// Every record is resolved before the first job starts, so schema errors
    /// abort the sweep without side effects. Run failures do not.
    pub fn dispatch(&mut self, expander: &SweepExpander<'_>) -> Result<SweepSummary, SchemaError> {
        let started_at = Utc::now();
        let records = expander.records()?;
        let layout = expander.layout();
        info!(
            runs = records.len(),
            scheduler = self.scheduler.name(),
            output = %layout.root().display(),
            "starting sweep"
        );

        let mut summary = SweepSummary {
            started_at,
            finished_at: started_at,
            scheduler: self.scheduler.name().to_string(),
            output_dir: layout.root().to_path_buf(),
            total: records.len(),
            completed: 0,
            skipped: 0,
            submitted: 0,
            failed: 0,
            runs: Vec::with_capacity(records.len()),
        };

        for record in records {
            let (record, outcome) = self.run_record(layout, record);
            match record.status {
                _ if outcome.skipped => summary.skipped += 1,
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Failed => summary.failed += 1,
                RunStatus::Pending | RunStatus::Running => summary.submitted += 1,
            }
            summary.runs.push(outcome);
        }

        summary.finished_at = Utc::now();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            submitted = summary.submitted,
            failed = summary.failed,
            "sweep finished"
        );
        Ok(summary)
    }

    /// Take one record through its lifecycle and return it with its final
    /// status: `Completed` when already complete, otherwise `Running` while
    /// it is materialized and submitted, then whatever the scheduler reports.
    pub fn run_record(&mut self, layout: &RunLayout, record: RunRecord) -> (RunRecord, RunOutcome) {
        let mut outcome = RunOutcome {
            index: record.index,
            identity: record.identity.to_string(),
            dir: record.dir.path().to_path_buf(),
            status: record.status,
            skipped: false,
            job_id: None,
            error: None,
        };

        if layout.exists_and_complete(&record.identity) {
            info!(run = %record.identity, "already complete, skipping");
            outcome.status = RunStatus::Completed;
            outcome.skipped = true;
            return (record.with_status(RunStatus::Completed), outcome);
        }

        info!(run = %record.identity, index = record.index, "dispatching");
        let record = record.with_status(RunStatus::Running);
        let submitted = layout
            .materialize(&record)
            .map_err(RunFailure::from)
            .and_then(|_| self.scheduler.submit(&record));

        let record = match submitted {
            Ok(handle) => {
                outcome.job_id = handle.job_id.clone();
                record.with_status(self.scheduler.poll(&handle))
            }
            Err(e) => {
                warn!(run = %record.identity, error = %e, "run failed");
                outcome.error = Some(e.to_string());
                record.with_status(RunStatus::Failed)
            }
        };
        if !record.status.is_terminal() {
            info!(run = %record.identity, status = %record.status, "submitted, awaiting completion");
        }
        outcome.status = record.status;
        (record, outcome)
    }
}

/// Directory state of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub index: usize,
    pub identity: RunIdentity,
    pub dir: PathBuf,
    pub started: bool,
    pub missing: Vec<PathBuf>,
}

impl RunState {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Snapshot of every run of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub runs: Vec<RunState>,
}

impl StatusReport {
    pub fn total(&self) -> usize {
        self.runs.len()
    }

    pub fn complete(&self) -> usize {
        self.runs.iter().filter(|r| r.is_complete()).count()
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &RunState> {
        self.runs.iter().filter(|r| !r.is_complete())
    }
}

/// Poll every run directory of an expansion without touching anything.
pub fn sweep_status(expander: &SweepExpander<'_>) -> StatusReport {
    let layout = expander.layout();
    let runs = (0..expander.len())
        .filter_map(|index| expander.identity_at(index).map(|id| (index, id)))
        .map(|(index, identity)| {
            let dir = layout.directory(&identity);
            RunState {
                index,
                dir: dir.path().to_path_buf(),
                started: dir.exists(),
                missing: dir.missing_files(),
                identity,
            }
        })
        .collect();
    StatusReport { runs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweeplab_core::{Checkpoint, ConfigTree, SweepSpec, Value};

    fn sweep() -> (ConfigTree, SweepSpec) {
        let base = ConfigTree::from_leaves([("optimizer.rank", Value::Int(4))]).unwrap();
        let spec = SweepSpec::from_entries([(
            "optimizer.rank",
            Value::List(vec![Value::Int(4), Value::Int(8)]),
        )])
        .unwrap();
        (base, spec)
    }

    fn write_results(_: &RunRecord, dir: &RunDirectory) -> Result<()> {
        for checkpoint in dir.checkpoints() {
            fs::write(dir.result_path(checkpoint), r#"{"test_acc": 0.9}"#)?;
        }
        Ok(())
    }

    #[test]
    fn record_status_follows_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (base, spec) = sweep();
        let layout = RunLayout::new(tmp.path(), Checkpoint::defaults());
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();
        let record = expander.record_at(0).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Pending);

        let mut dispatcher = Dispatcher::new(SequentialScheduler::new(write_results));
        let (done, outcome) = dispatcher.run_record(&layout, record.clone());
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.status.is_terminal());
        assert!(!outcome.skipped);

        // A second pass finds the directory complete.
        let (again, outcome) = dispatcher.run_record(&layout, record);
        assert_eq!(again.status, RunStatus::Completed);
        assert!(outcome.skipped);
    }

    #[test]
    fn failed_and_pending_records() {
        let tmp = tempfile::tempdir().unwrap();
        let (base, spec) = sweep();
        let layout = RunLayout::new(tmp.path(), Checkpoint::defaults());
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();

        let crash = |_: &RunRecord, _: &RunDirectory| -> Result<()> { anyhow::bail!("boom") };
        let mut failing = Dispatcher::new(SequentialScheduler::new(crash));
        let (failed, outcome) = failing.run_record(&layout, expander.record_at(0).unwrap().unwrap());
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("boom"));

        let batch = BatchScheduler::new(
            ClusterResources {
                dry_run: true,
                ..ClusterResources::default()
            },
            vec!["python".into(), "train.py".into()],
        )
        .unwrap();
        let (pending, _) =
            Dispatcher::new(batch).run_record(&layout, expander.record_at(1).unwrap().unwrap());
        assert_eq!(pending.status, RunStatus::Pending);
        assert!(!pending.status.is_terminal());
    }
}
