//! On-disk layout of a sweep.
//!
//! Layout: `{output_root}/{identity}/`
//!
//! - `config.yaml`: resolved configuration, written once before the job starts
//! - `results_{label}_model.json`: one result file per checkpoint
//! - `train.log`: captured output of locally executed runs
//! - `submit.sh`: generated batch submission script
//! - `identity.txt`: full identity, only for directories with hashed names
//!
//! The directory is the single source of truth for what was requested (the
//! config) and what completed (the result files).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::error::{ConfigError, SchemaError};
use crate::identity::RunIdentity;
use crate::record::RunRecord;
use crate::tree::ConfigTree;

pub const CONFIG_FILE: &str = "config.yaml";
pub const LOG_FILE: &str = "train.log";
pub const SCRIPT_FILE: &str = "submit.sh";
pub const IDENTITY_FILE: &str = "identity.txt";

/// Directory segment of the unswept base run. Every non-empty identity
/// contains `=`, so this never collides.
pub const DEFAULT_SEGMENT: &str = "default";

/// Identities longer than this get a hashed directory name.
pub const MAX_SEGMENT_LEN: usize = 200;

/// Errors from creating or validating run directories.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{path} already holds a different configuration (fingerprint {found}, expected {expected})")]
    ConfigMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// A saved model state whose evaluation produces one result file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Checkpoint {
    Best,
    Last,
    Named(String),
}

impl Checkpoint {
    pub fn label(&self) -> &str {
        match self {
            Checkpoint::Best => "best",
            Checkpoint::Last => "last",
            Checkpoint::Named(name) => name,
        }
    }

    /// Result file name. The last checkpoint is stored as the final model.
    pub fn file_name(&self) -> String {
        match self {
            Checkpoint::Best => "results_best_model.json".to_string(),
            Checkpoint::Last => "results_final_model.json".to_string(),
            Checkpoint::Named(name) => format!("results_{name}_model.json"),
        }
    }

    pub fn defaults() -> Vec<Checkpoint> {
        vec![Checkpoint::Best, Checkpoint::Last]
    }
}

impl FromStr for Checkpoint {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(Checkpoint::Best),
            "last" | "final" => Ok(Checkpoint::Last),
            name if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                Ok(Checkpoint::Named(name.to_string()))
            }
            other => Err(SchemaError::InvalidValue {
                path: "evaluation.checkpoints".into(),
                expected: "a checkpoint label (best, last or [A-Za-z0-9_-]+)".into(),
                found: format!("'{other}'"),
            }),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Checkpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Checkpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// Maps run identities to directories under one output root.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    checkpoints: Vec<Checkpoint>,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, checkpoints: Vec<Checkpoint>) -> Self {
        Self {
            root: root.into(),
            checkpoints,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Directory segment for an identity.
    pub fn segment_for(identity: &RunIdentity) -> String {
        let encoded = identity.as_str();
        if encoded.is_empty() {
            DEFAULT_SEGMENT.to_string()
        } else if encoded.len() > MAX_SEGMENT_LEN {
            let hash = blake3::hash(encoded.as_bytes()).to_hex();
            format!("run-{}", &hash[..32])
        } else {
            encoded.to_string()
        }
    }

    pub fn path_for(&self, identity: &RunIdentity) -> PathBuf {
        self.root.join(Self::segment_for(identity))
    }

    pub fn directory(&self, identity: &RunIdentity) -> RunDirectory {
        RunDirectory {
            path: self.path_for(identity),
            checkpoints: self.checkpoints.clone(),
        }
    }

    /// Completion oracle: config plus every configured checkpoint's result
    /// file present and well-formed.
    pub fn exists_and_complete(&self, identity: &RunIdentity) -> bool {
        self.directory(identity).is_complete()
    }

    /// Create the run directory and write the resolved config. An existing
    /// config must match the record's config exactly.
    pub fn materialize(&self, record: &RunRecord) -> Result<RunDirectory, LayoutError> {
        let dir = self.directory(&record.identity);
        fs::create_dir_all(dir.path()).map_err(|source| LayoutError::Io {
            path: dir.path().to_path_buf(),
            source,
        })?;

        let config_path = dir.config_path();
        if config_path.exists() {
            let existing = ConfigTree::from_file(&config_path)?;
            let expected = record.config.fingerprint();
            let found = existing.fingerprint();
            if expected != found {
                return Err(LayoutError::ConfigMismatch {
                    path: config_path,
                    expected,
                    found,
                });
            }
            debug!(run = %record.identity, "config already materialized");
        } else {
            record.config.write_yaml(&config_path)?;
            debug!(run = %record.identity, path = %config_path.display(), "wrote config");
        }

        if Self::segment_for(&record.identity) != record.identity.as_str()
            && !record.identity.is_empty()
        {
            let identity_path = dir.identity_path();
            fs::write(&identity_path, record.identity.as_str()).map_err(|source| {
                LayoutError::Io {
                    path: identity_path.clone(),
                    source,
                }
            })?;
        }
        Ok(dir)
    }
}

/// Handle on one run's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    path: PathBuf,
    checkpoints: Vec<Checkpoint>,
}

impl RunDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn result_path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.path.join(checkpoint.file_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub fn script_path(&self) -> PathBuf {
        self.path.join(SCRIPT_FILE)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.path.join(IDENTITY_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_files().is_empty()
    }

    /// Expected files that are absent or malformed.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        let config = self.config_path();
        if !is_non_empty(&config) {
            missing.push(config);
        }
        for checkpoint in &self.checkpoints {
            let path = self.result_path(checkpoint);
            if !looks_like_json(&path) {
                missing.push(path);
            }
        }
        missing
    }
}

fn is_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Cheap well-formedness check: matching object or array delimiters at both
/// ends. Content is parsed later, by the aggregator.
fn looks_like_json(path: &Path) -> bool {
    let Ok(bytes) = fs::read(path) else {
        return false;
    };
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
    let trimmed = match (start, end) {
        (Some(s), Some(e)) => &bytes[s..=e],
        _ => return false,
    };
    matches!(
        (trimmed.first(), trimmed.last()),
        (Some(b'{'), Some(b'}')) | (Some(b'['), Some(b']'))
    ) && trimmed.len() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ConfigPath;
    use crate::record::RunStatus;
    use crate::value::Value;

    fn identity(pairs: &[(&str, Value)]) -> RunIdentity {
        RunIdentity::new(
            pairs
                .iter()
                .map(|(p, v)| (ConfigPath::parse(p).unwrap(), v.clone())),
        )
    }

    fn record(layout: &RunLayout, id: RunIdentity, config: ConfigTree) -> RunRecord {
        RunRecord {
            index: 0,
            dir: layout.directory(&id),
            identity: id,
            config,
            status: RunStatus::Pending,
        }
    }

    #[test]
    fn path_is_identity_segment() {
        let layout = RunLayout::new("/out", Checkpoint::defaults());
        let id = identity(&[("optimizer.rank", Value::Int(4))]);
        assert_eq!(layout.path_for(&id), PathBuf::from("/out/optimizer.rank=4"));
        assert_eq!(
            layout.path_for(&RunIdentity::empty()),
            PathBuf::from("/out/default")
        );
    }

    #[test]
    fn long_identities_are_hashed() {
        let long = "x".repeat(300);
        let id = identity(&[("task.name", Value::from(long.as_str()))]);
        let segment = RunLayout::segment_for(&id);
        assert!(segment.starts_with("run-"));
        assert_eq!(segment, RunLayout::segment_for(&id.clone()));
    }

    #[test]
    fn checkpoint_file_names() {
        assert_eq!(Checkpoint::Best.file_name(), "results_best_model.json");
        assert_eq!(Checkpoint::Last.file_name(), "results_final_model.json");
        assert_eq!("final".parse::<Checkpoint>().unwrap(), Checkpoint::Last);
        assert!("bad label".parse::<Checkpoint>().is_err());
    }

    #[test]
    fn completion_requires_config_and_all_results() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path(), Checkpoint::defaults());
        let config = ConfigTree::from_leaves([("engine.seed", Value::Int(1))]).unwrap();
        let id = identity(&[("engine.seed", Value::Int(1))]);
        let rec = record(&layout, id.clone(), config);

        assert!(!layout.exists_and_complete(&id));
        let dir = layout.materialize(&rec).unwrap();
        assert!(dir.config_path().exists());
        assert!(!layout.exists_and_complete(&id));

        fs::write(dir.result_path(&Checkpoint::Best), r#"{"test_acc": 0.9}"#).unwrap();
        assert!(!layout.exists_and_complete(&id));

        fs::write(dir.result_path(&Checkpoint::Last), "{\"test_acc\": 0.9").unwrap();
        assert!(!layout.exists_and_complete(&id), "truncated file is not complete");

        fs::write(dir.result_path(&Checkpoint::Last), r#"[{"test_acc": 0.8}]"#).unwrap();
        assert!(layout.exists_and_complete(&id));
    }

    #[test]
    fn materialize_rejects_changed_config() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path(), vec![Checkpoint::Best]);
        let id = identity(&[("engine.seed", Value::Int(1))]);
        let first = ConfigTree::from_leaves([("engine.seed", Value::Int(1))]).unwrap();
        let second = ConfigTree::from_leaves([("engine.seed", Value::Int(2))]).unwrap();

        layout.materialize(&record(&layout, id.clone(), first.clone())).unwrap();
        // Same config again is fine.
        layout.materialize(&record(&layout, id.clone(), first)).unwrap();
        let err = layout
            .materialize(&record(&layout, id, second))
            .unwrap_err();
        assert!(matches!(err, LayoutError::ConfigMismatch { .. }));
    }
}
