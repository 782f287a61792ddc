//! Grouping and statistics over run results.
//!
//! Runs that agree on every configuration value outside `aggregate_groups`
//! (typically `engine.seed`) form one [`AggregationGroup`]. A statistic over a
//! group never silently turns missing data into a number: insufficient
//! observations yield [`AggregateValue::NoData`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sweeplab_core::{encode_pairs, Checkpoint, ConfigPath, SchemaError, Value};

use crate::results::RunResults;

// ─── Statistic ──────────────────────────────────────────────────────

/// Reduction applied to the observations of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Mean,
    /// Sample standard deviation (n − 1).
    Std,
    Median,
    Min,
    Max,
    /// All observations, unreduced.
    Raw,
}

impl Statistic {
    pub fn name(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Std => "std",
            Statistic::Median => "median",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Raw => "raw",
        }
    }

    /// Apply the statistic to a set of observations.
    pub fn apply(self, values: &[f64]) -> AggregateValue {
        if values.is_empty() {
            return AggregateValue::NoData;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        match self {
            Statistic::Mean => AggregateValue::Scalar(mean),
            Statistic::Std => {
                if values.len() < 2 {
                    return AggregateValue::NoData;
                }
                let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
                AggregateValue::Scalar(var.sqrt())
            }
            Statistic::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                let median = if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                };
                AggregateValue::Scalar(median)
            }
            Statistic::Min => AggregateValue::Scalar(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Statistic::Max => {
                AggregateValue::Scalar(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            }
            Statistic::Raw => AggregateValue::Raw(values.to_vec()),
        }
    }
}

impl FromStr for Statistic {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Statistic::Mean),
            "std" => Ok(Statistic::Std),
            "median" => Ok(Statistic::Median),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "raw" => Ok(Statistic::Raw),
            other => Err(SchemaError::InvalidValue {
                path: "evaluation.plot.aggfunc".into(),
                expected: "one of mean, std, median, min, max, raw".into(),
                found: format!("'{other}'"),
            }),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a statistic: a number, the raw observations, or an explicit gap.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateValue {
    Scalar(f64),
    Raw(Vec<f64>),
    NoData,
}

impl AggregateValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            AggregateValue::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, AggregateValue::NoData)
    }
}

// ─── Missing data ───────────────────────────────────────────────────

/// What to do when some members of a group lack the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    /// Leave incomplete members out; counts record the gap.
    #[default]
    Exclude,
    /// Any missing member makes the whole group `NoData`.
    Strict,
}

impl FromStr for MissingPolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclude" => Ok(MissingPolicy::Exclude),
            "strict" => Ok(MissingPolicy::Strict),
            other => Err(SchemaError::InvalidValue {
                path: "evaluation.missing_policy".into(),
                expected: "exclude or strict".into(),
                found: format!("'{other}'"),
            }),
        }
    }
}

/// Metric observations of a set of runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    pub values: Vec<f64>,
    pub expected: usize,
}

impl Observations {
    pub fn collect<'a>(
        runs: impl IntoIterator<Item = &'a RunResults>,
        metric: &str,
        checkpoint: &Checkpoint,
    ) -> Self {
        let mut values = Vec::new();
        let mut expected = 0;
        for run in runs {
            expected += 1;
            if let Some(x) = run.metric(checkpoint, metric) {
                values.push(x);
            }
        }
        Self { values, expected }
    }

    pub fn observed(&self) -> usize {
        self.values.len()
    }

    /// Apply `stat` under `policy`.
    pub fn reduce(&self, stat: Statistic, policy: MissingPolicy) -> AggregateValue {
        if policy == MissingPolicy::Strict && self.observed() < self.expected {
            return AggregateValue::NoData;
        }
        stat.apply(&self.values)
    }
}

// ─── Groups ─────────────────────────────────────────────────────────

/// Runs that differ only in aggregated paths.
#[derive(Debug, Clone)]
pub struct AggregationGroup {
    /// Swept values that identify the group (identity minus aggregated paths).
    pub params: Vec<(ConfigPath, Value)>,
    pub members: Vec<RunResults>,
}

impl AggregationGroup {
    /// Encoded group parameters, `default` for a sweep with nothing left.
    pub fn label(&self) -> String {
        if self.params.is_empty() {
            "default".to_string()
        } else {
            encode_pairs(&self.params)
        }
    }

    /// Config value shared by the group. Taken from the first member; values
    /// under aggregated paths may differ between members.
    pub fn value(&self, path: &ConfigPath) -> Option<&Value> {
        self.members.first()?.record.config.get(path)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One statistic of one metric over one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedMetric {
    pub metric: String,
    pub checkpoint: Checkpoint,
    pub statistic: Statistic,
    pub value: AggregateValue,
    pub expected: usize,
    pub observed: usize,
}

fn is_aggregated(path: &ConfigPath, aggregate_groups: &[ConfigPath]) -> bool {
    aggregate_groups.iter().any(|g| path.starts_with(g))
}

/// Partition runs by every config value outside `aggregate_groups`. Groups
/// appear in order of their first member.
pub fn group(
    runs: impl IntoIterator<Item = RunResults>,
    aggregate_groups: &[ConfigPath],
) -> Vec<AggregationGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<AggregationGroup> = Vec::new();

    for run in runs {
        let mut hasher = blake3::Hasher::new();
        for (path, value) in run.record.config.flatten() {
            if !is_aggregated(&path, aggregate_groups) {
                hasher.update(format!("{path}={value:?}\n").as_bytes());
            }
        }
        let key = hasher.finalize().to_hex().to_string();

        match index.get(&key) {
            Some(&i) => groups[i].members.push(run),
            None => {
                let params = run
                    .record
                    .identity
                    .pairs()
                    .iter()
                    .filter(|(path, _)| !is_aggregated(path, aggregate_groups))
                    .cloned()
                    .collect();
                index.insert(key, groups.len());
                groups.push(AggregationGroup {
                    params,
                    members: vec![run],
                });
            }
        }
    }
    groups
}

/// Compute `stat` of `metric` at `checkpoint` over a group.
pub fn aggregate(
    group: &AggregationGroup,
    metric: &str,
    checkpoint: &Checkpoint,
    stat: Statistic,
    policy: MissingPolicy,
) -> AggregatedMetric {
    let obs = Observations::collect(&group.members, metric, checkpoint);
    AggregatedMetric {
        metric: metric.to_string(),
        checkpoint: checkpoint.clone(),
        statistic: stat,
        value: obs.reduce(stat, policy),
        expected: obs.expected,
        observed: obs.observed(),
    }
}

/// Label used for a split value; unset paths share one bucket.
pub fn split_label(value: Option<&Value>) -> String {
    value.map_or_else(|| "null".to_string(), |v| v.to_string())
}

/// Partition groups by the value at `split_key`.
pub fn split<'a>(
    groups: &'a [AggregationGroup],
    split_key: &ConfigPath,
) -> BTreeMap<String, Vec<&'a AggregationGroup>> {
    let mut out: BTreeMap<String, Vec<&AggregationGroup>> = BTreeMap::new();
    for group in groups {
        out.entry(split_label(group.value(split_key)))
            .or_default()
            .push(group);
    }
    out
}

/// One row per group: parameters, then every requested statistic plus counts.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: String,
    pub members: usize,
    pub metrics: Vec<AggregatedMetric>,
}

/// Summarize every group for `metric` at `checkpoint` over several statistics.
pub fn summarize(
    groups: &[AggregationGroup],
    metric: &str,
    checkpoint: &Checkpoint,
    stats: &[Statistic],
    policy: MissingPolicy,
) -> Vec<GroupSummary> {
    groups
        .iter()
        .map(|g| GroupSummary {
            group: g.label(),
            members: g.len(),
            metrics: stats
                .iter()
                .map(|&stat| aggregate(g, metric, checkpoint, stat, policy))
                .collect(),
        })
        .collect()
}
