//! Plot table resolution.
//!
//! Turns aggregation groups into heatmap-shaped tables: rows are x-axis value
//! combinations, columns are y-axis value combinations, one panel per value of
//! the split key. Nothing here renders; tables go to exporters and external
//! renderers.
//!
//! A cell pools the members of every group that lands on it (groups differing
//! only in paths that are neither on an axis nor aggregated) before the
//! statistic is applied.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sweeplab_core::{Checkpoint, ConfigPath, SchemaError, Value};

use crate::aggregate::{
    split, split_label, AggregateValue, AggregationGroup, MissingPolicy, Observations, Statistic,
};
use crate::evaluation::PlotSpec;
use crate::export::Table;

// ─── Number formats ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Fixed,
    Exponent,
    Percent,
}

/// Cell number format, `[width][.precision][f|e|%]`. No type means fixed-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NumberFormat {
    pub width: Option<usize>,
    pub precision: Option<usize>,
    pub kind: FormatKind,
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            width: None,
            precision: Some(3),
            kind: FormatKind::Fixed,
        }
    }
}

impl NumberFormat {
    pub fn format(&self, x: f64) -> String {
        let body = match (self.kind, self.precision) {
            (FormatKind::Fixed, Some(p)) => format!("{x:.p$}"),
            (FormatKind::Fixed, None) => format!("{x}"),
            (FormatKind::Exponent, Some(p)) => format!("{x:.p$e}"),
            (FormatKind::Exponent, None) => format!("{x:e}"),
            (FormatKind::Percent, Some(p)) => format!("{:.p$}%", x * 100.0),
            (FormatKind::Percent, None) => format!("{}%", x * 100.0),
        };
        let w = self.width.unwrap_or(0);
        format!("{body:>w$}")
    }
}

impl FromStr for NumberFormat {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidValue {
            path: "evaluation.plot.format".into(),
            expected: "a format like '.2f', '8.3e' or '.1%'".into(),
            found: format!("'{s}'"),
        };
        let (spec, kind) = match s.chars().last() {
            Some('f') => (&s[..s.len() - 1], FormatKind::Fixed),
            Some('e') => (&s[..s.len() - 1], FormatKind::Exponent),
            Some('%') => (&s[..s.len() - 1], FormatKind::Percent),
            _ => (s, FormatKind::Fixed),
        };
        let (width, precision) = match spec.split_once('.') {
            Some((w, p)) => (w, Some(p)),
            None => (spec, None),
        };
        let parse = |digits: &str| -> Result<Option<usize>, SchemaError> {
            if digits.is_empty() {
                Ok(None)
            } else {
                digits.parse().map(Some).map_err(|_| invalid())
            }
        };
        let precision = match precision {
            Some("") => return Err(invalid()),
            Some(p) => parse(p)?,
            None => None,
        };
        Ok(Self {
            width: parse(width)?,
            precision,
            kind,
        })
    }
}

impl fmt::Display for NumberFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(w) = self.width {
            write!(f, "{w}")?;
        }
        if let Some(p) = self.precision {
            write!(f, ".{p}")?;
        }
        let kind = match self.kind {
            FormatKind::Fixed => "f",
            FormatKind::Exponent => "e",
            FormatKind::Percent => "%",
        };
        f.write_str(kind)
    }
}

// ─── Limits ─────────────────────────────────────────────────────────

/// Inclusive display range for cell values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limits {
    pub lower: f64,
    pub upper: f64,
}

/// Treatment of values outside [`Limits`]. Neither policy drops the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    /// Replace the value by the nearest limit.
    #[default]
    Clamp,
    /// Keep the value and mark the cell.
    Flag,
}

impl FromStr for LimitPolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clamp" => Ok(LimitPolicy::Clamp),
            "flag" => Ok(LimitPolicy::Flag),
            other => Err(SchemaError::InvalidValue {
                path: "evaluation.plot.limit_policy".into(),
                expected: "clamp or flag".into(),
                found: format!("'{other}'"),
            }),
        }
    }
}

/// Where a cell's value sits relative to the limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeFlag {
    InRange,
    Below,
    Above,
    NoData,
}

// ─── Tables ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotCell {
    pub value: AggregateValue,
    /// Paired uncertainty, present when the plot asks for it.
    pub std: Option<AggregateValue>,
    pub flag: RangeFlag,
    pub expected: usize,
    pub observed: usize,
    pub text: String,
}

/// One resolved panel.
#[derive(Debug, Clone, Serialize)]
pub struct PlotTable {
    /// Split value of this panel, if the data was split.
    pub panel: Option<String>,
    pub metric: String,
    pub checkpoint: Checkpoint,
    pub statistic: Statistic,
    pub x_axis: Vec<ConfigPath>,
    pub y_axis: Vec<ConfigPath>,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub cells: Vec<Vec<PlotCell>>,
}

impl PlotTable {
    pub fn cell(&self, row: usize, column: usize) -> Option<&PlotCell> {
        self.cells.get(row)?.get(column)
    }

    /// Name suitable for a file stem.
    pub fn stem(&self) -> String {
        let mut stem = format!("{}_{}", self.metric, self.checkpoint);
        if let Some(panel) = &self.panel {
            stem.push('_');
            stem.extend(
                panel
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' }),
            );
        }
        stem
    }

    /// Flatten to text for CSV and Markdown export.
    pub fn to_table(&self) -> Table {
        let corner = if self.x_axis.is_empty() {
            String::new()
        } else {
            join_paths(&self.x_axis)
        };
        let mut headers = vec![corner];
        headers.extend(self.columns.iter().cloned());
        let rows = self
            .rows
            .iter()
            .zip(&self.cells)
            .map(|(label, cells)| {
                let mut row = vec![label.clone()];
                row.extend(cells.iter().map(|c| c.text.clone()));
                row
            })
            .collect();
        let mut title = format!("{} ({}, {})", self.metric, self.statistic, self.checkpoint);
        if let Some(panel) = &self.panel {
            title.push_str(&format!(" [{panel}]"));
        }
        if !self.y_axis.is_empty() {
            title.push_str(&format!(" columns: {}", join_paths(&self.y_axis)));
        }
        Table {
            title,
            headers,
            rows,
        }
    }
}

fn join_paths(paths: &[ConfigPath]) -> String {
    paths
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

type AxisKey = Vec<Option<Value>>;

fn axis_key(group: &AggregationGroup, paths: &[ConfigPath]) -> AxisKey {
    paths.iter().map(|p| group.value(p).cloned()).collect()
}

fn cmp_keys(a: &AxisKey, b: &AxisKey) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x, y) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.sort_cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn sorted_keys(groups: &[&AggregationGroup], paths: &[ConfigPath]) -> Vec<AxisKey> {
    let mut keys: Vec<AxisKey> = Vec::new();
    for group in groups {
        let key = axis_key(group, paths);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.sort_by(cmp_keys);
    keys
}

fn key_label(key: &AxisKey) -> String {
    if key.is_empty() {
        return "all".to_string();
    }
    key.iter()
        .map(|v| split_label(v.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve a plot spec against groups, one table per panel.
pub fn resolve(
    plot: &PlotSpec,
    metric: &str,
    groups: &[AggregationGroup],
    split_key: Option<&ConfigPath>,
    policy: MissingPolicy,
) -> Vec<PlotTable> {
    match split_key {
        Some(key) => split(groups, key)
            .into_iter()
            .map(|(label, members)| build_table(plot, metric, Some(label), &members, policy))
            .collect(),
        None => {
            let all: Vec<&AggregationGroup> = groups.iter().collect();
            vec![build_table(plot, metric, None, &all, policy)]
        }
    }
}

fn build_table(
    plot: &PlotSpec,
    metric: &str,
    panel: Option<String>,
    groups: &[&AggregationGroup],
    policy: MissingPolicy,
) -> PlotTable {
    let row_keys = sorted_keys(groups, &plot.x_axis);
    let col_keys = sorted_keys(groups, &plot.y_axis);

    let cells = row_keys
        .iter()
        .map(|row| {
            col_keys
                .iter()
                .map(|col| {
                    let members = groups
                        .iter()
                        .filter(|g| {
                            &axis_key(g, &plot.x_axis) == row && &axis_key(g, &plot.y_axis) == col
                        })
                        .flat_map(|g| g.members.iter());
                    let obs = Observations::collect(members, metric, &plot.checkpoint);
                    resolve_cell(plot, &obs, policy)
                })
                .collect()
        })
        .collect();

    PlotTable {
        panel,
        metric: metric.to_string(),
        checkpoint: plot.checkpoint.clone(),
        statistic: plot.aggfunc,
        x_axis: plot.x_axis.clone(),
        y_axis: plot.y_axis.clone(),
        rows: row_keys.iter().map(key_label).collect(),
        columns: col_keys.iter().map(key_label).collect(),
        cells,
    }
}

/// Cell text when no run falls into the cell at all.
pub const NO_RUNS: &str = "no runs";
/// Cell text when runs exist but too few report the metric.
pub const NO_DATA: &str = "n/a";

/// Render an aggregate for a table. Gaps get an explicit marker, so an
/// exported hole never reads as an empty field.
pub fn render_value(value: &AggregateValue, expected: usize, fmt: &NumberFormat) -> String {
    match value {
        AggregateValue::Scalar(x) => fmt.format(*x),
        AggregateValue::Raw(xs) => xs
            .iter()
            .map(|x| fmt.format(*x))
            .collect::<Vec<_>>()
            .join(";"),
        AggregateValue::NoData if expected == 0 => NO_RUNS.to_string(),
        AggregateValue::NoData => NO_DATA.to_string(),
    }
}

fn resolve_cell(plot: &PlotSpec, obs: &Observations, policy: MissingPolicy) -> PlotCell {
    let mut value = obs.reduce(plot.aggfunc, policy);
    let std = plot.std.then(|| obs.reduce(Statistic::Std, policy));

    let flag = match (value.as_scalar(), plot.limits) {
        _ if value.is_no_data() => RangeFlag::NoData,
        (Some(x), Some(limits)) => {
            let flag = if x < limits.lower {
                RangeFlag::Below
            } else if x > limits.upper {
                RangeFlag::Above
            } else {
                RangeFlag::InRange
            };
            if plot.limit_policy == LimitPolicy::Clamp {
                value = AggregateValue::Scalar(x.clamp(limits.lower, limits.upper));
            }
            flag
        }
        _ => RangeFlag::InRange,
    };

    let fmt = plot.format;
    let mut text = render_value(&value, obs.expected, &fmt);
    match flag {
        RangeFlag::Below => text.insert(0, '<'),
        RangeFlag::Above => text.insert(0, '>'),
        _ => {}
    }
    if let (false, Some(AggregateValue::Scalar(s))) = (value.is_no_data(), &std) {
        text.push_str(&format!(" ± {}", fmt.format(*s)));
    }
    let observed = obs.observed();
    if observed < obs.expected {
        text.push_str(&format!(" ({observed}/{})", obs.expected));
    }

    PlotCell {
        value,
        std,
        flag,
        expected: obs.expected,
        observed: obs.observed(),
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        let f: NumberFormat = ".2f".parse().unwrap();
        assert_eq!(f.format(0.93456), "0.93");
        let f: NumberFormat = "8.1e".parse().unwrap();
        assert_eq!(f.format(1234.0), "   1.2e3");
        let f: NumberFormat = ".1%".parse().unwrap();
        assert_eq!(f.format(0.9312), "93.1%");
        let f: NumberFormat = "6.3".parse().unwrap();
        assert_eq!(f.kind, FormatKind::Fixed);
        assert_eq!(f.format(1.5), " 1.500");
    }

    #[test]
    fn malformed_formats_are_rejected() {
        assert!("x.2f".parse::<NumberFormat>().is_err());
        assert!("3.f".parse::<NumberFormat>().is_err());
    }

    #[test]
    fn format_display_round_trips() {
        let f: NumberFormat = "5.2e".parse().unwrap();
        assert_eq!(f.to_string().parse::<NumberFormat>().unwrap(), f);
    }

    #[test]
    fn gaps_render_as_markers() {
        let fmt = NumberFormat::default();
        assert_eq!(render_value(&AggregateValue::NoData, 0, &fmt), NO_RUNS);
        assert_eq!(render_value(&AggregateValue::NoData, 3, &fmt), NO_DATA);
        assert_eq!(render_value(&AggregateValue::Scalar(0.93), 3, &fmt), "0.930");
    }

    #[test]
    fn limit_policy_parses() {
        assert_eq!("flag".parse::<LimitPolicy>().unwrap(), LimitPolicy::Flag);
        assert!("drop".parse::<LimitPolicy>().is_err());
    }
}
