//! Blocking, in-order execution of the training step.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, ensure, Context, Result};
use sweeplab_core::{RunDirectory, RunRecord, RunStatus};
use tracing::debug;

use super::{JobHandle, RunFailure, Scheduler};

/// The external training step: given a materialized run, produce its result
/// files. Anything implementing this can stand in for a real trainer.
pub trait Trainer {
    fn train(&mut self, record: &RunRecord, dir: &RunDirectory) -> Result<()>;
}

impl<F> Trainer for F
where
    F: FnMut(&RunRecord, &RunDirectory) -> Result<()>,
{
    fn train(&mut self, record: &RunRecord, dir: &RunDirectory) -> Result<()> {
        self(record, dir)
    }
}

/// Replace `{config}`, `{run_dir}` and `{identity}` in one argument.
pub fn substitute(template: &str, record: &RunRecord, dir: &RunDirectory) -> String {
    template
        .replace("{config}", &dir.config_path().display().to_string())
        .replace("{run_dir}", &dir.path().display().to_string())
        .replace("{identity}", record.identity.as_str())
}

/// Runs an external command per run, output captured in `train.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTrainer {
    command: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandTrainer {
    pub fn new(command: Vec<String>) -> Result<Self> {
        ensure!(!command.is_empty(), "training command is empty");
        Ok(Self {
            command,
            workdir: None,
        })
    }

    /// Directory the command is started in; defaults to the current one.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn args_for(&self, record: &RunRecord, dir: &RunDirectory) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| substitute(arg, record, dir))
            .collect()
    }
}

impl Trainer for CommandTrainer {
    fn train(&mut self, record: &RunRecord, dir: &RunDirectory) -> Result<()> {
        let args = self.args_for(record, dir);
        let (program, rest) = args
            .split_first()
            .context("training command is empty")?;

        let log_path = dir.log_path();
        let stdout = File::create(&log_path)
            .with_context(|| format!("failed to create {}", log_path.display()))?;
        let stderr = stdout.try_clone().context("failed to duplicate log handle")?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }
        debug!(run = %record.identity, ?args, "launching trainer");

        let status = cmd
            .status()
            .with_context(|| format!("failed to launch '{program}'"))?;
        if !status.success() {
            bail!(
                "'{program}' exited with {status}; output in {}",
                log_path.display()
            );
        }
        Ok(())
    }
}

/// Trains each run synchronously, then checks its directory.
pub struct SequentialScheduler<T> {
    trainer: T,
}

impl<T: Trainer> SequentialScheduler<T> {
    pub fn new(trainer: T) -> Self {
        Self { trainer }
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }
}

impl<T: Trainer> Scheduler for SequentialScheduler<T> {
    fn name(&self) -> &str {
        "sequential"
    }

    fn submit(&mut self, record: &RunRecord) -> Result<JobHandle, RunFailure> {
        self.trainer
            .train(record, &record.dir)
            .map_err(|e| RunFailure::Trainer {
                identity: record.identity.to_string(),
                message: format!("{e:#}"),
            })?;

        let missing = record.dir.missing_files();
        if !missing.is_empty() {
            return Err(RunFailure::Incomplete {
                identity: record.identity.to_string(),
                missing,
            });
        }
        Ok(JobHandle {
            identity: record.identity.clone(),
            dir: record.dir.clone(),
            job_id: None,
            finished: true,
        })
    }

    fn poll(&self, handle: &JobHandle) -> RunStatus {
        if handle.dir.is_complete() {
            RunStatus::Completed
        } else if handle.finished {
            RunStatus::Failed
        } else {
            RunStatus::Pending
        }
    }
}
