//! Sweep specification and Cartesian expansion.
//!
//! Axes are ordered by path and enumerated odometer-style: the last axis
//! varies fastest, values keep their list order. Enumeration order only
//! decides dispatch order; identities are sorted independently.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SchemaError;
use crate::identity::RunIdentity;
use crate::path::ConfigPath;
use crate::record::{RunRecord, RunStatus};
use crate::run_dir::RunLayout;
use crate::tree::ConfigTree;
use crate::value::Value;

/// Errors detected while building or expanding a sweep. All are fatal and
/// raised before any run is produced.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("sweep axes '{first}' and '{second}' target the same config path")]
    ConflictingAxis { first: String, second: String },

    #[error("sweep has more combinations than can be enumerated")]
    TooLarge,
}

/// One swept config path and its candidate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    pub path: ConfigPath,
    pub values: Vec<Value>,
}

impl SweepAxis {
    pub fn new(path: ConfigPath, values: Vec<Value>) -> Self {
        Self { path, values }
    }
}

/// A key-unique set of axes, kept sorted by path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepSpec {
    axes: Vec<SweepAxis>,
}

impl SweepSpec {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and sort axes. Rejects empty axes, values that render alike on
    /// one axis, and axes whose paths coincide or nest.
    pub fn new(mut axes: Vec<SweepAxis>) -> Result<Self, SweepError> {
        for axis in &axes {
            if axis.values.is_empty() {
                return Err(SchemaError::EmptyAxis {
                    path: axis.path.to_string(),
                }
                .into());
            }
            let mut seen = HashSet::new();
            for value in &axis.values {
                let rendered = value.to_string();
                if !seen.insert(rendered.clone()) {
                    return Err(SchemaError::DuplicateValue {
                        path: axis.path.to_string(),
                        value: rendered,
                    }
                    .into());
                }
            }
        }
        axes.sort_by(|a, b| a.path.cmp(&b.path));
        for (i, first) in axes.iter().enumerate() {
            for second in &axes[i + 1..] {
                if first.path.overlaps(&second.path) {
                    return Err(SweepError::ConflictingAxis {
                        first: first.path.to_string(),
                        second: second.path.to_string(),
                    });
                }
            }
        }
        Ok(Self { axes })
    }

    /// Build from `(dotted path, candidates)` entries as found in a plan file.
    /// A scalar entry is a single-valued axis; a list entry lists candidates.
    pub fn from_entries<I, K>(entries: I) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let axes = entries
            .into_iter()
            .map(|(key, value)| {
                let path = ConfigPath::parse(key.as_ref())?;
                let values = match value {
                    Value::List(items) => items,
                    scalar => vec![scalar],
                };
                Ok(SweepAxis::new(path, values))
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        Self::new(axes)
    }

    pub fn axes(&self) -> &[SweepAxis] {
        &self.axes
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Product of the axis sizes, `None` on overflow. An empty spec has one
    /// combination: the base itself.
    pub fn combinations(&self) -> Option<usize> {
        self.axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.values.len()))
    }
}

/// Lazily expands a base configuration over a sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepExpander<'a> {
    base: &'a ConfigTree,
    spec: &'a SweepSpec,
    layout: &'a RunLayout,
    total: usize,
}

impl<'a> SweepExpander<'a> {
    /// Check every axis against the base schema before anything is produced.
    pub fn new(
        base: &'a ConfigTree,
        spec: &'a SweepSpec,
        layout: &'a RunLayout,
    ) -> Result<Self, SweepError> {
        for axis in spec.axes() {
            if base.contains(&axis.path) {
                continue;
            }
            let path = axis.path.to_string();
            return Err(if base.is_namespace(&axis.path) {
                SchemaError::NotALeaf { path }
            } else {
                SchemaError::UnknownPath { path }
            }
            .into());
        }
        let total = spec.combinations().ok_or(SweepError::TooLarge)?;
        Ok(Self {
            base,
            spec,
            layout,
            total,
        })
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn spec(&self) -> &SweepSpec {
        self.spec
    }

    pub fn layout(&self) -> &RunLayout {
        self.layout
    }

    /// Axis assignment at position `index` of the enumeration.
    pub fn identity_at(&self, index: usize) -> Option<RunIdentity> {
        if index >= self.total {
            return None;
        }
        let axes = self.spec.axes();
        let mut choice = vec![0; axes.len()];
        let mut rem = index;
        for (slot, axis) in choice.iter_mut().zip(axes).rev() {
            *slot = rem % axis.values.len();
            rem /= axis.values.len();
        }
        Some(RunIdentity::new(
            axes.iter()
                .zip(choice)
                .map(|(axis, i)| (axis.path.clone(), axis.values[i].clone())),
        ))
    }

    /// Materialize the record at position `index`.
    pub fn record_at(&self, index: usize) -> Option<Result<RunRecord, SchemaError>> {
        let identity = self.identity_at(index)?;
        let overrides: Vec<_> = identity.pairs().to_vec();
        Some(self.base.merge(overrides).map(|config| RunRecord {
            index,
            dir: self.layout.directory(&identity),
            identity,
            config,
            status: RunStatus::Pending,
        }))
    }

    pub fn iter(&self) -> Expansion<'a> {
        self.iter_from(0)
    }

    /// Resume enumeration at `start`; positions are stable across processes.
    pub fn iter_from(&self, start: usize) -> Expansion<'a> {
        Expansion {
            expander: *self,
            next: start.min(self.total),
        }
    }

    /// Expand everything, failing on the first schema error.
    pub fn records(&self) -> Result<Vec<RunRecord>, SchemaError> {
        self.iter().collect()
    }
}

/// Iterator over the records of a [`SweepExpander`].
#[derive(Debug, Clone)]
pub struct Expansion<'a> {
    expander: SweepExpander<'a>,
    next: usize,
}

impl Iterator for Expansion<'_> {
    type Item = Result<RunRecord, SchemaError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.expander.record_at(self.next)?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.expander.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Expansion<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_dir::Checkpoint;

    fn base() -> ConfigTree {
        ConfigTree::from_leaves([
            ("engine.seed", Value::Int(42)),
            ("optimizer.learning_rate", Value::Float(0.001)),
            ("optimizer.rank", Value::Int(4)),
            ("optimizer.name", Value::from("flora")),
        ])
        .unwrap()
    }

    fn layout() -> RunLayout {
        RunLayout::new("/tmp/sweep", Checkpoint::defaults())
    }

    fn axis(path: &str, values: Vec<Value>) -> SweepAxis {
        SweepAxis::new(ConfigPath::parse(path).unwrap(), values)
    }

    #[test]
    fn expands_in_odometer_order() {
        let spec = SweepSpec::new(vec![
            axis("optimizer.rank", vec![Value::Int(4), Value::Int(8)]),
            axis(
                "optimizer.learning_rate",
                vec![Value::Float(0.001), Value::Float(0.01)],
            ),
        ])
        .unwrap();
        let base = base();
        let layout = layout();
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();
        let ids: Vec<String> = expander
            .records()
            .unwrap()
            .iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "optimizer.learning_rate=0.001,optimizer.rank=4",
                "optimizer.learning_rate=0.001,optimizer.rank=8",
                "optimizer.learning_rate=0.01,optimizer.rank=4",
                "optimizer.learning_rate=0.01,optimizer.rank=8",
            ]
        );
    }

    #[test]
    fn records_carry_resolved_config() {
        let spec =
            SweepSpec::new(vec![axis("optimizer.rank", vec![Value::Int(16)])]).unwrap();
        let base = base();
        let layout = layout();
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();
        let record = expander.record_at(0).unwrap().unwrap();
        assert_eq!(record.config.lookup("optimizer.rank"), Some(&Value::Int(16)));
        assert_eq!(record.config.lookup("engine.seed"), Some(&Value::Int(42)));
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(
            record.dir.path(),
            layout.path_for(&record.identity).as_path()
        );
    }

    #[test]
    fn empty_spec_yields_base_once() {
        let spec = SweepSpec::empty();
        let base = base();
        let layout = layout();
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();
        let records = expander.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity.as_str(), "");
        assert_eq!(records[0].config, base);
    }

    #[test]
    fn conflicting_axes_are_rejected() {
        let err = SweepSpec::new(vec![
            axis("optimizer.rank", vec![Value::Int(4)]),
            axis("optimizer.rank", vec![Value::Int(8)]),
        ])
        .unwrap_err();
        assert!(matches!(err, SweepError::ConflictingAxis { .. }));

        let err = SweepSpec::new(vec![
            axis("optimizer", vec![Value::Int(4)]),
            axis("optimizer.rank", vec![Value::Int(8)]),
        ])
        .unwrap_err();
        assert!(matches!(err, SweepError::ConflictingAxis { .. }));
    }

    #[test]
    fn malformed_axes_are_rejected() {
        let err = SweepSpec::new(vec![axis("optimizer.rank", vec![])]).unwrap_err();
        assert!(matches!(err, SweepError::Schema(SchemaError::EmptyAxis { .. })));

        let err = SweepSpec::new(vec![axis(
            "optimizer.name",
            vec![Value::from("4"), Value::Int(4)],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            SweepError::Schema(SchemaError::DuplicateValue { .. })
        ));
    }

    #[test]
    fn unknown_axis_path_fails_before_expansion() {
        let spec = SweepSpec::new(vec![axis("optimizer.lr", vec![Value::Float(0.1)])]).unwrap();
        let base = base();
        let layout = layout();
        let err = SweepExpander::new(&base, &spec, &layout).unwrap_err();
        assert!(matches!(
            err,
            SweepError::Schema(SchemaError::UnknownPath { .. })
        ));

        let spec = SweepSpec::new(vec![axis("optimizer", vec![Value::Null])]).unwrap();
        let err = SweepExpander::new(&base, &spec, &layout).unwrap_err();
        assert!(matches!(err, SweepError::Schema(SchemaError::NotALeaf { .. })));
    }

    #[test]
    fn restartable_enumeration() {
        let spec = SweepSpec::new(vec![
            axis("engine.seed", vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            axis("optimizer.rank", vec![Value::Int(4), Value::Int(8)]),
        ])
        .unwrap();
        let base = base();
        let layout = layout();
        let expander = SweepExpander::new(&base, &spec, &layout).unwrap();
        let all: Vec<_> = expander.records().unwrap();
        let tail: Vec<_> = expander.iter_from(4).collect::<Result<_, _>>().unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].identity, all[4].identity);
        assert_eq!(tail[1].index, 5);
        assert_eq!(expander.iter_from(2).len(), 4);
    }

    #[test]
    fn scalar_entries_become_single_value_axes() {
        let spec = SweepSpec::from_entries(vec![
            ("optimizer.name", Value::from("adamw")),
            ("engine.seed", Value::List(vec![Value::Int(1), Value::Int(2)])),
        ])
        .unwrap();
        assert_eq!(spec.axes()[0].path.to_string(), "engine.seed");
        assert_eq!(spec.axes()[1].values, vec![Value::from("adamw")]);
        assert_eq!(spec.combinations(), Some(2));
    }
}
