//! Evaluation settings read from a config's `evaluation` namespace.
//!
//! ```yaml
//! evaluation:
//!   aggregate_groups: [engine.seed]
//!   column_split_key: task.name
//!   checkpoints: [best, last]
//!   output_types: [csv, md, pdf]
//!   missing_policy: exclude
//!   plot:
//!     metric: test_acc
//!     x_axis: [optimizer.learning_rate]
//!     y_axis: [optimizer.rank]
//!     limits: [0.8, 1.0]
//!     format: ".3f"
//!     aggfunc: mean
//!     std: true
//!     limit_policy: clamp
//! ```
//!
//! Every key is optional. `null` means unset.

use std::path::PathBuf;

use sweeplab_core::{Checkpoint, ConfigPath, ConfigTree, SchemaError, Value};

use crate::aggregate::{MissingPolicy, Statistic};
use crate::plot::{LimitPolicy, Limits, NumberFormat};

const NAMESPACE: &str = "evaluation";

#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    pub metric: Option<String>,
    pub checkpoint: Checkpoint,
    pub x_axis: Vec<ConfigPath>,
    pub y_axis: Vec<ConfigPath>,
    pub limits: Option<Limits>,
    pub format: NumberFormat,
    pub aggfunc: Statistic,
    pub std: bool,
    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSpec {
    pub aggregate_groups: Vec<ConfigPath>,
    pub column_split_key: Option<ConfigPath>,
    pub checkpoints: Vec<Checkpoint>,
    pub output_types: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub missing_policy: MissingPolicy,
    pub plot: PlotSpec,
}

impl Default for EvaluationSpec {
    fn default() -> Self {
        Self {
            aggregate_groups: Vec::new(),
            column_split_key: None,
            checkpoints: Checkpoint::defaults(),
            output_types: vec!["csv".into(), "md".into()],
            output_dir: None,
            missing_policy: MissingPolicy::default(),
            plot: PlotSpec {
                metric: None,
                checkpoint: Checkpoint::Last,
                x_axis: Vec::new(),
                y_axis: Vec::new(),
                limits: None,
                format: NumberFormat::default(),
                aggfunc: Statistic::Mean,
                std: true,
                limit_policy: LimitPolicy::default(),
            },
        }
    }
}

impl EvaluationSpec {
    /// Read the `evaluation` namespace of `config`, falling back to defaults
    /// for anything unset.
    pub fn from_config(config: &ConfigTree) -> Result<Self, SchemaError> {
        let reader = Reader { config };
        let mut spec = Self::default();

        if let Some(paths) = reader.paths("aggregate_groups")? {
            spec.aggregate_groups = paths;
        }
        if let Some(mut paths) = reader.paths("column_split_key")? {
            if paths.len() > 1 {
                return Err(reader.invalid("column_split_key", "a single config path", "a list"));
            }
            spec.column_split_key = paths.pop();
        }
        if let Some(labels) = reader.strings("checkpoints")? {
            spec.checkpoints = labels
                .iter()
                .map(|l| l.parse())
                .collect::<Result<_, _>>()?;
        }
        if let Some(types) = reader.strings("output_types")? {
            spec.output_types = types;
        }
        if let Some(dir) = reader.string("output_dir")? {
            spec.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(policy) = reader.string("missing_policy")? {
            spec.missing_policy = policy.parse()?;
        }

        let plot = &mut spec.plot;
        plot.metric = reader.string("plot.metric")?;
        plot.checkpoint = match reader.string("plot.checkpoint")? {
            Some(label) => label.parse()?,
            None => spec
                .checkpoints
                .iter()
                .find(|c| **c == Checkpoint::Last)
                .or(spec.checkpoints.first())
                .cloned()
                .unwrap_or(Checkpoint::Last),
        };
        if let Some(paths) = reader.paths("plot.x_axis")? {
            plot.x_axis = paths;
        }
        if let Some(paths) = reader.paths("plot.y_axis")? {
            plot.y_axis = paths;
        }
        plot.limits = reader.limits("plot.limits")?;
        if let Some(format) = reader.string("plot.format")? {
            plot.format = format.parse()?;
        }
        if let Some(func) = reader.string("plot.aggfunc")? {
            plot.aggfunc = func.parse()?;
        }
        if let Some(std) = reader.bool("plot.std")? {
            plot.std = std;
        }
        if let Some(policy) = reader.string("plot.limit_policy")? {
            plot.limit_policy = policy.parse()?;
        }
        Ok(spec)
    }
}

struct Reader<'a> {
    config: &'a ConfigTree,
}

impl Reader<'_> {
    fn full(key: &str) -> String {
        format!("{NAMESPACE}.{key}")
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.config.lookup(&Self::full(key)).filter(|v| !v.is_null())
    }

    fn invalid(&self, key: &str, expected: &str, found: &str) -> SchemaError {
        SchemaError::InvalidValue {
            path: Self::full(key),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Any scalar, rendered canonically (so `format: 2.1` reads as "2.1").
    fn string(&self, key: &str) -> Result<Option<String>, SchemaError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::List(_)) => Err(self.invalid(key, "a scalar", "a list")),
            Some(v) => Ok(Some(v.to_string())),
        }
    }

    /// A scalar or a list of scalars, as strings.
    fn strings(&self, key: &str) -> Result<Option<Vec<String>>, SchemaError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::List(items)) => Ok(Some(items.iter().map(ToString::to_string).collect())),
            Some(v) => Ok(Some(vec![v.to_string()])),
        }
    }

    fn paths(&self, key: &str) -> Result<Option<Vec<ConfigPath>>, SchemaError> {
        self.strings(key)?
            .map(|items| {
                items
                    .iter()
                    .map(|s| ConfigPath::parse(s))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, SchemaError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a boolean", v.type_name())),
        }
    }

    fn limits(&self, key: &str) -> Result<Option<Limits>, SchemaError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let bounds = value
            .as_list()
            .filter(|items| items.len() == 2)
            .and_then(|items| Some((items[0].as_f64()?, items[1].as_f64()?)));
        match bounds {
            Some((lower, upper)) if lower <= upper => Ok(Some(Limits { lower, upper })),
            _ => Err(self.invalid(key, "[lower, upper] with lower <= upper", &value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_namespace_is_absent() {
        let config = ConfigTree::from_yaml_str("task:\n  name: mnist\n").unwrap();
        let spec = EvaluationSpec::from_config(&config).unwrap();
        assert_eq!(spec, EvaluationSpec::default());
    }

    #[test]
    fn full_namespace_is_read() {
        let config = ConfigTree::from_yaml_str(
            r#"
evaluation:
  aggregate_groups: [engine.seed]
  column_split_key: task.name
  checkpoints: [best, last]
  output_types: [csv, pdf]
  missing_policy: strict
  plot:
    metric: test_acc
    x_axis: [optimizer.learning_rate]
    y_axis: [optimizer.rank, optimizer.kappa]
    limits: [0.8, 1.0]
    format: ".2%"
    aggfunc: median
    std: false
    limit_policy: flag
    checkpoint: best
"#,
        )
        .unwrap();
        let spec = EvaluationSpec::from_config(&config).unwrap();
        assert_eq!(spec.aggregate_groups, vec![ConfigPath::parse("engine.seed").unwrap()]);
        assert_eq!(spec.column_split_key, Some(ConfigPath::parse("task.name").unwrap()));
        assert_eq!(spec.missing_policy, MissingPolicy::Strict);
        assert_eq!(spec.plot.metric.as_deref(), Some("test_acc"));
        assert_eq!(spec.plot.y_axis.len(), 2);
        assert_eq!(spec.plot.limits, Some(Limits { lower: 0.8, upper: 1.0 }));
        assert_eq!(spec.plot.aggfunc, Statistic::Median);
        assert!(!spec.plot.std);
        assert_eq!(spec.plot.limit_policy, LimitPolicy::Flag);
        assert_eq!(spec.plot.checkpoint, Checkpoint::Best);
    }

    #[test]
    fn numeric_format_reads_as_fixed_point() {
        let config = ConfigTree::from_yaml_str("evaluation:\n  plot:\n    format: 2.1\n").unwrap();
        let spec = EvaluationSpec::from_config(&config).unwrap();
        assert_eq!(spec.plot.format.width, Some(2));
        assert_eq!(spec.plot.format.precision, Some(1));
    }

    #[test]
    fn null_keys_are_unset() {
        let config =
            ConfigTree::from_yaml_str("evaluation:\n  column_split_key: null\n").unwrap();
        let spec = EvaluationSpec::from_config(&config).unwrap();
        assert_eq!(spec.column_split_key, None);
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let config =
            ConfigTree::from_yaml_str("evaluation:\n  plot:\n    limits: [1.0, 0.5]\n").unwrap();
        assert!(EvaluationSpec::from_config(&config).is_err());
    }
}
