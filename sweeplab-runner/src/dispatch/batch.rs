//! Cluster submission through a batch scheduler (SLURM by default).
//!
//! For every run a `submit.sh` is written into the run directory and handed to
//! the submit command. Submission returns as soon as the scheduler accepts the
//! job; completion is observed later by polling the run directory.

use std::fs;
use std::process::Command;

use serde::{Deserialize, Serialize};
use sweeplab_core::{ByteSize, RunRecord, RunStatus, SchemaError, WallClock};
use tracing::{info, warn};

use super::sequential::substitute;
use super::{JobHandle, RunFailure, Scheduler};

/// Config key scaling the wall-clock limit of individual runs.
pub const TIME_FACTOR_KEY: &str = "engine.sbatch_time_factor";

/// Resource directives and submission settings, `[dispatch.cluster]` in a
/// sweep plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterResources {
    pub job_name: String,
    pub nodes: u32,
    pub ntasks_per_node: u32,
    pub cpus_per_task: Option<u32>,
    pub mem_per_cpu: String,
    pub time: String,
    pub partition: Option<String>,
    pub gres: Option<String>,
    /// Additional directives, e.g. `--mail-type=END`.
    pub extra_directives: Vec<String>,
    /// Shell lines run before the training command (`module load ...`).
    pub setup: Vec<String>,
    pub submit_command: Vec<String>,
    /// Write scripts without submitting them.
    pub dry_run: bool,
}

impl Default for ClusterResources {
    fn default() -> Self {
        Self {
            job_name: "sweeplab".into(),
            nodes: 1,
            ntasks_per_node: 1,
            cpus_per_task: None,
            mem_per_cpu: "4G".into(),
            time: "01:00:00".into(),
            partition: None,
            gres: None,
            extra_directives: Vec::new(),
            setup: Vec::new(),
            submit_command: vec!["sbatch".into()],
            dry_run: false,
        }
    }
}

fn invalid(key: &str, expected: &str, found: &str) -> SchemaError {
    SchemaError::InvalidValue {
        path: format!("dispatch.{key}"),
        expected: expected.into(),
        found: found.into(),
    }
}

/// Renders and submits one batch script per run.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    resources: ClusterResources,
    mem_per_cpu: ByteSize,
    time: WallClock,
    command: Vec<String>,
}

impl BatchScheduler {
    /// Validate resources and the training command template.
    pub fn new(resources: ClusterResources, command: Vec<String>) -> Result<Self, SchemaError> {
        let mem_per_cpu = ByteSize::parse(&resources.mem_per_cpu).ok_or_else(|| {
            invalid("cluster.mem_per_cpu", "a size like 4G or 512M", &resources.mem_per_cpu)
        })?;
        let time = WallClock::parse(&resources.time).ok_or_else(|| {
            invalid("cluster.time", "HH:MM:SS or D-HH:MM:SS", &resources.time)
        })?;
        if command.is_empty() {
            return Err(invalid("command", "a non-empty argument list", "[]"));
        }
        if resources.submit_command.is_empty() {
            return Err(invalid("cluster.submit_command", "a non-empty argument list", "[]"));
        }
        if resources.nodes == 0 || resources.ntasks_per_node == 0 {
            return Err(invalid("cluster.nodes", "at least one node and task", "0"));
        }
        Ok(Self {
            resources,
            mem_per_cpu,
            time,
            command,
        })
    }

    pub fn resources(&self) -> &ClusterResources {
        &self.resources
    }

    /// Wall-clock limit for `record`, scaled by its time factor if set.
    pub fn time_for(&self, record: &RunRecord) -> WallClock {
        match record.config.lookup(TIME_FACTOR_KEY).and_then(|v| v.as_f64()) {
            Some(factor) if factor > 0.0 => {
                WallClock::from_secs((self.time.as_secs() as f64 * factor).ceil() as u64)
            }
            _ => self.time,
        }
    }

    /// The submission script of `record`.
    pub fn render_script(&self, record: &RunRecord) -> String {
        let r = &self.resources;
        let dir = &record.dir;
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}-{}", r.job_name, record.index),
            format!("#SBATCH --nodes={}", r.nodes),
            format!("#SBATCH --ntasks-per-node={}", r.ntasks_per_node),
        ];
        if let Some(cpus) = r.cpus_per_task {
            lines.push(format!("#SBATCH --cpus-per-task={cpus}"));
        }
        lines.push(format!("#SBATCH --mem-per-cpu={}", self.mem_per_cpu));
        lines.push(format!("#SBATCH --time={}", self.time_for(record)));
        if let Some(partition) = &r.partition {
            lines.push(format!("#SBATCH --partition={partition}"));
        }
        if let Some(gres) = &r.gres {
            lines.push(format!("#SBATCH --gres={gres}"));
        }
        // Slurm expands `%` patterns in file names; escaped identities carry `%`.
        let log = dir.log_path().display().to_string().replace('%', "%%");
        lines.push(format!("#SBATCH --output={}", shell_quote(&log)));
        for directive in &r.extra_directives {
            lines.push(format!("#SBATCH {directive}"));
        }
        lines.push(String::new());
        lines.push(format!("# run: {}", record.identity));
        lines.extend(r.setup.iter().cloned());
        let invocation = self
            .command
            .iter()
            .map(|arg| shell_quote(&substitute(arg, record, dir)))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(invocation);
        lines.push(String::new());
        lines.join("\n")
    }
}

impl Scheduler for BatchScheduler {
    fn name(&self) -> &str {
        "batch"
    }

    fn submit(&mut self, record: &RunRecord) -> Result<JobHandle, RunFailure> {
        let failure = |message: String| RunFailure::Submit {
            identity: record.identity.to_string(),
            message,
        };

        let script_path = record.dir.script_path();
        fs::write(&script_path, self.render_script(record))
            .map_err(|e| failure(format!("cannot write {}: {e}", script_path.display())))?;

        let mut handle = JobHandle {
            identity: record.identity.clone(),
            dir: record.dir.clone(),
            job_id: None,
            finished: false,
        };
        if self.resources.dry_run {
            info!(run = %record.identity, script = %script_path.display(), "dry run, not submitted");
            return Ok(handle);
        }

        let (program, args) = self
            .resources
            .submit_command
            .split_first()
            .ok_or_else(|| failure("submit command is empty".into()))?;
        let output = Command::new(program)
            .args(args)
            .arg(&script_path)
            .output()
            .map_err(|e| failure(format!("failed to launch '{program}': {e}")))?;
        if !output.status.success() {
            return Err(failure(format!(
                "'{program}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        handle.job_id = parse_job_id(&stdout);
        match &handle.job_id {
            Some(id) => info!(run = %record.identity, job = %id, "submitted"),
            None => warn!(run = %record.identity, output = %stdout.trim(), "submitted, but no job id in output"),
        }
        Ok(handle)
    }

    fn poll(&self, handle: &JobHandle) -> RunStatus {
        if handle.dir.is_complete() {
            RunStatus::Completed
        } else if handle.job_id.is_some() {
            RunStatus::Running
        } else {
            RunStatus::Pending
        }
    }
}

/// Extract `<id>` from `Submitted batch job <id>`.
pub fn parse_job_id(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Submitted batch job")
            .map(str::trim)
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
    })
}

/// Quote a word for `sh` unless it is made only of safe characters.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=,:@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
