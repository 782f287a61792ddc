//! Per-run result files.
//!
//! Each checkpoint writes `results_{label}_model.json`, either a flat object
//! `{"test_acc": 0.93, ...}` or an array of such objects (one per evaluation
//! dataloader), merged in order. Non-numeric entries are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use sweeplab_core::{Checkpoint, RunDirectory, RunRecord};
use tracing::warn;

/// Metric name → value for one checkpoint.
pub type Metrics = BTreeMap<String, f64>;

/// Results of one run, keyed by checkpoint label. A missing key means the
/// checkpoint was never produced (or its file could not be read).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    checkpoints: BTreeMap<String, Metrics>,
}

impl ResultSet {
    /// Read every configured checkpoint's result file from `dir`.
    pub fn load(dir: &RunDirectory) -> Self {
        let mut checkpoints = BTreeMap::new();
        for checkpoint in dir.checkpoints() {
            let path = dir.result_path(checkpoint);
            if let Some(metrics) = read_metrics(&path) {
                checkpoints.insert(checkpoint.label().to_string(), metrics);
            }
        }
        Self { checkpoints }
    }

    pub fn insert(&mut self, checkpoint: &Checkpoint, metrics: Metrics) {
        self.checkpoints
            .insert(checkpoint.label().to_string(), metrics);
    }

    pub fn checkpoint(&self, checkpoint: &Checkpoint) -> Option<&Metrics> {
        self.checkpoints.get(checkpoint.label())
    }

    pub fn metric(&self, checkpoint: &Checkpoint, name: &str) -> Option<f64> {
        self.checkpoint(checkpoint)?.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

/// A run together with whatever results it produced.
#[derive(Debug, Clone)]
pub struct RunResults {
    pub record: RunRecord,
    pub results: ResultSet,
}

impl RunResults {
    pub fn load(record: RunRecord) -> Self {
        let results = ResultSet::load(&record.dir);
        Self { record, results }
    }

    pub fn metric(&self, checkpoint: &Checkpoint, name: &str) -> Option<f64> {
        self.results.metric(checkpoint, name)
    }
}

/// Parse the body of a result file.
pub fn parse_metrics(text: &str) -> Result<Metrics, serde_json::Error> {
    let doc: serde_json::Value = serde_json::from_str(text)?;
    let mut metrics = Metrics::new();
    match doc {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_numbers(&item, &mut metrics);
            }
        }
        other => collect_numbers(&other, &mut metrics),
    }
    Ok(metrics)
}

fn collect_numbers(doc: &serde_json::Value, out: &mut Metrics) {
    if let serde_json::Value::Object(map) = doc {
        for (key, value) in map {
            if let Some(x) = value.as_f64() {
                out.insert(key.clone(), x);
            }
        }
    }
}

fn read_metrics(path: &Path) -> Option<Metrics> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable result file");
            return None;
        }
    };
    match parse_metrics(&text) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed result file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_object_is_read() {
        let m = parse_metrics(r#"{"test_acc": 0.93, "test_loss": 0.2}"#).unwrap();
        assert_eq!(m.get("test_acc"), Some(&0.93));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn array_of_objects_is_merged_in_order() {
        let m = parse_metrics(r#"[{"a": 1, "b": 2}, {"b": 3, "c": 4}]"#).unwrap();
        assert_eq!(m.get("a"), Some(&1.0));
        assert_eq!(m.get("b"), Some(&3.0));
        assert_eq!(m.get("c"), Some(&4.0));
    }

    #[test]
    fn non_numeric_entries_are_ignored() {
        let m = parse_metrics(r#"{"acc": 0.5, "name": "x", "ok": true, "n": null}"#).unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_metrics("{not json").is_err());
    }

    #[test]
    fn load_skips_missing_and_malformed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = sweeplab_core::RunLayout::new(tmp.path(), Checkpoint::defaults());
        let dir = layout.directory(&sweeplab_core::RunIdentity::empty());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.result_path(&Checkpoint::Best), r#"{"test_acc": 91}"#).unwrap();
        fs::write(dir.result_path(&Checkpoint::Last), "{broken").unwrap();

        let set = ResultSet::load(&dir);
        assert_eq!(set.metric(&Checkpoint::Best, "test_acc"), Some(91.0));
        assert!(set.checkpoint(&Checkpoint::Last).is_none());
    }
}
