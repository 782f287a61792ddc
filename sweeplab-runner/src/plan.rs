//! Sweep plan files.
//!
//! A plan names a base config, an output root, the swept axes and how runs
//! are dispatched:
//!
//! ```toml
//! base_config = "mnist.yaml"
//! output_dir = "outputs/mnist"
//!
//! [sweep]
//! "optimizer.learning_rate" = [0.001, 0.01]
//! "optimizer.rank" = [4, 8]
//! "engine.seed" = [1, 2, 3]
//!
//! [dispatch]
//! strategy = "sequential"
//! command = ["python", "train.py", "--config", "{config}"]
//! ```
//!
//! Relative paths resolve against the plan file's directory. Unquoted dotted
//! keys under `[sweep]` (TOML nested tables) are accepted as well.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sweeplab_core::{
    ConfigError, ConfigPath, ConfigTree, RunLayout, SchemaError, SweepError, SweepExpander,
    SweepSpec, Value,
};
use thiserror::Error;
use tracing::debug;

use crate::dispatch::{
    BatchScheduler, ClusterResources, CommandTrainer, Scheduler, SequentialScheduler,
};
use crate::evaluation::EvaluationSpec;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed plan {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error("invalid dispatch settings: {0}")]
    Dispatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Sequential,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub strategy: Strategy,
    /// Training command template; `{config}`, `{run_dir}` and `{identity}`
    /// are substituted per run.
    pub command: Vec<String>,
    /// Working directory of sequential training commands.
    pub workdir: Option<PathBuf>,
    pub cluster: ClusterResources,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    base_config: PathBuf,
    output_dir: Option<PathBuf>,
    #[serde(default)]
    sweep: toml::Table,
    #[serde(default)]
    dispatch: DispatchConfig,
}

/// A loaded plan: base config, axes, layout and dispatch settings.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub base_config_path: PathBuf,
    pub base: ConfigTree,
    pub spec: SweepSpec,
    pub layout: RunLayout,
    pub evaluation: EvaluationSpec,
    pub dispatch: DispatchConfig,
}

impl SweepPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, dir).map_err(|e| match e {
            PlanError::Parse { message, .. } => PlanError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse a plan whose relative paths resolve against `dir`.
    pub fn from_toml_str(text: &str, dir: &Path) -> Result<Self, PlanError> {
        let file: PlanFile = toml::from_str(text).map_err(|e| PlanError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;

        let base_config_path = dir.join(&file.base_config);
        let base = ConfigTree::from_file(&base_config_path)?;
        let spec = SweepSpec::from_entries(sweep_entries(&file.sweep)?)?;
        let evaluation = EvaluationSpec::from_config(&base)?;

        let output_dir = dir.join(file.output_dir.unwrap_or_else(|| PathBuf::from("outputs")));
        let mut dispatch = file.dispatch;
        dispatch.workdir = dispatch.workdir.map(|w| dir.join(w));

        debug!(
            base = %base_config_path.display(),
            output = %output_dir.display(),
            axes = spec.axes().len(),
            "loaded sweep plan"
        );
        Ok(Self {
            base_config_path,
            layout: RunLayout::new(output_dir, evaluation.checkpoints.clone()),
            base,
            spec,
            evaluation,
            dispatch,
        })
    }

    /// Apply command-line overrides to the base config. Evaluation settings
    /// are re-read, since overrides may target them.
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (ConfigPath, Value)>,
    ) -> Result<Self, PlanError> {
        self.base = self.base.merge(overrides)?;
        self.evaluation = EvaluationSpec::from_config(&self.base)?;
        self.layout = RunLayout::new(
            self.layout.root().to_path_buf(),
            self.evaluation.checkpoints.clone(),
        );
        Ok(self)
    }

    /// Replace the output root.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.layout = RunLayout::new(dir, self.evaluation.checkpoints.clone());
        self
    }

    pub fn output_dir(&self) -> &Path {
        self.layout.root()
    }

    /// Where aggregated tables go: `evaluation.output_dir` relative to the
    /// output root, `<output root>/evaluation` by default.
    pub fn evaluation_dir(&self) -> PathBuf {
        let root = self.layout.root();
        match &self.evaluation.output_dir {
            Some(dir) => root.join(dir),
            None => root.join("evaluation"),
        }
    }

    pub fn expander(&self) -> Result<SweepExpander<'_>, SweepError> {
        SweepExpander::new(&self.base, &self.spec, &self.layout)
    }

    /// Build the scheduler selected by `[dispatch]`.
    pub fn scheduler(&self) -> Result<Box<dyn Scheduler>, PlanError> {
        let command = self.dispatch.command.clone();
        match self.dispatch.strategy {
            Strategy::Sequential => {
                let mut trainer =
                    CommandTrainer::new(command).map_err(|e| PlanError::Dispatch(e.to_string()))?;
                if let Some(workdir) = &self.dispatch.workdir {
                    trainer = trainer.with_workdir(workdir);
                }
                Ok(Box::new(SequentialScheduler::new(trainer)))
            }
            Strategy::Batch => Ok(Box::new(BatchScheduler::new(
                self.dispatch.cluster.clone(),
                command,
            )?)),
        }
    }
}

/// Flatten `[sweep]` into `(dotted path, candidates)` pairs.
fn sweep_entries(table: &toml::Table) -> Result<Vec<(String, Value)>, PlanError> {
    let mut out = Vec::new();
    collect_entries(table, "", &mut out)?;
    Ok(out)
}

fn collect_entries(
    table: &toml::Table,
    prefix: &str,
    out: &mut Vec<(String, Value)>,
) -> Result<(), PlanError> {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(sub) => collect_entries(sub, &path, out)?,
            other => {
                let value: Value = other.clone().try_into().map_err(|e: toml::de::Error| {
                    SchemaError::InvalidValue {
                        path: path.clone(),
                        expected: "a scalar or a list of scalars".into(),
                        found: e.to_string(),
                    }
                })?;
                out.push((path, value));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "optimizer:\n  learning_rate: 0.001\n  rank: 4\nengine:\n  seed: 42\n";

    fn plan_dir(plan: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("base.yaml"), BASE).unwrap();
        fs::write(tmp.path().join("plan.toml"), plan).unwrap();
        tmp
    }

    #[test]
    fn quoted_and_nested_keys_are_both_accepted() {
        let tmp = plan_dir(
            r#"
base_config = "base.yaml"
output_dir = "out"

[sweep]
"optimizer.learning_rate" = [0.001, 0.01]
engine.seed = [1, 2, 3]
"#,
        );
        let plan = SweepPlan::load(tmp.path().join("plan.toml")).unwrap();
        assert_eq!(plan.spec.axes().len(), 2);
        assert_eq!(plan.output_dir(), tmp.path().join("out"));
        assert_eq!(plan.expander().unwrap().len(), 6);
    }

    #[test]
    fn output_dir_defaults_next_to_plan() {
        let tmp = plan_dir("base_config = \"base.yaml\"\n");
        let plan = SweepPlan::load(tmp.path().join("plan.toml")).unwrap();
        assert_eq!(plan.output_dir(), tmp.path().join("outputs"));
        assert_eq!(plan.evaluation_dir(), tmp.path().join("outputs").join("evaluation"));
        assert_eq!(plan.expander().unwrap().len(), 1);
    }

    #[test]
    fn unknown_plan_keys_are_rejected() {
        let tmp = plan_dir("base_config = \"base.yaml\"\nsweeps = 1\n");
        let err = SweepPlan::load(tmp.path().join("plan.toml")).unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn overrides_apply_to_base() {
        let tmp = plan_dir("base_config = \"base.yaml\"\n");
        let plan = SweepPlan::load(tmp.path().join("plan.toml"))
            .unwrap()
            .with_overrides([(ConfigPath::parse("optimizer.rank").unwrap(), Value::Int(16))])
            .unwrap();
        assert_eq!(plan.base.lookup("optimizer.rank"), Some(&Value::Int(16)));
    }

    #[test]
    fn batch_strategy_builds_batch_scheduler() {
        let tmp = plan_dir(
            r#"
base_config = "base.yaml"
[dispatch]
strategy = "batch"
command = ["python", "train.py", "{config}"]
[dispatch.cluster]
mem_per_cpu = "8G"
time = "0-02:00:00"
partition = "gpu"
dry_run = true
"#,
        );
        let plan = SweepPlan::load(tmp.path().join("plan.toml")).unwrap();
        let scheduler = plan.scheduler().unwrap();
        assert_eq!(scheduler.name(), "batch");
    }

    #[test]
    fn sequential_without_command_is_rejected() {
        let tmp = plan_dir("base_config = \"base.yaml\"\n");
        let plan = SweepPlan::load(tmp.path().join("plan.toml")).unwrap();
        assert!(matches!(plan.scheduler(), Err(PlanError::Dispatch(_))));
    }
}
