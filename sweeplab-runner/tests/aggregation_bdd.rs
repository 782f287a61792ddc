//! BDD tests for result aggregation and plot tables.
//!
//! These tests verify:
//! - Seeds collapse into one group per remaining configuration
//! - Mean and sample standard deviation over seeds
//! - Missing results under the exclude and strict policies
//! - Column splits and heatmap-shaped plot tables with limits

use std::fs;
use std::path::Path;

use sweeplab_core::{
    Checkpoint, ConfigPath, ConfigTree, RunLayout, SweepExpander, SweepSpec, Value,
};
use sweeplab_runner::export::to_csv;
use sweeplab_runner::plot::NO_RUNS;
use sweeplab_runner::{
    aggregate, group, resolve, split, AggregateValue, EvaluationSpec, LimitPolicy, Limits,
    MissingPolicy, RangeFlag, RunResults, Statistic,
};

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

const BASE_YAML: &str = r#"
engine:
  seed: 0
evaluation:
  aggregate_groups: [engine.seed]
  plot:
    metric: test_acc
    x_axis: [optimizer.learning_rate]
    y_axis: [optimizer.rank]
    format: ".1f"
optimizer:
  learning_rate: 0.001
  rank: 4
task:
  name: mnist
"#;

fn path(s: &str) -> ConfigPath {
    ConfigPath::parse(s).unwrap()
}

fn list(values: Vec<Value>) -> Value {
    Value::List(values)
}

/// Expand, materialize and write `test_acc` at the last checkpoint using
/// `acc(record index)`; `None` leaves the run without results.
fn run_sweep(
    root: &Path,
    base: &ConfigTree,
    spec: &SweepSpec,
    acc: impl Fn(usize) -> Option<f64>,
) -> Vec<RunResults> {
    let layout = RunLayout::new(root, vec![Checkpoint::Last]);
    let expander = SweepExpander::new(base, spec, &layout).unwrap();
    expander
        .iter()
        .map(|record| {
            let record = record.unwrap();
            let dir = layout.materialize(&record).unwrap();
            if let Some(x) = acc(record.index) {
                fs::write(
                    dir.result_path(&Checkpoint::Last),
                    format!(r#"{{"test_acc": {x}}}"#),
                )
                .unwrap();
            }
            RunResults::load(record)
        })
        .collect()
}

fn seed_spec() -> SweepSpec {
    SweepSpec::from_entries([(
        "engine.seed",
        list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
    )])
    .unwrap()
}

fn base() -> ConfigTree {
    ConfigTree::from_yaml_str(BASE_YAML).unwrap()
}

// ──────────────────────────────────────────────
// Grouping and statistics
// ──────────────────────────────────────────────

#[test]
fn bdd_three_seeds_form_one_group() {
    // GIVEN three runs differing only in engine.seed
    let tmp = tempfile::tempdir().unwrap();
    let runs = run_sweep(tmp.path(), &base(), &seed_spec(), |i| Some(0.9 + i as f64));

    // WHEN grouped by engine.seed
    let groups = group(runs, &[path("engine.seed")]);

    // THEN there is exactly one group of three
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 3);
    assert_eq!(groups[0].label(), "default");
}

#[test]
fn bdd_mean_and_sample_std_over_seeds() {
    // GIVEN test_acc = 91, 93, 95 over three seeds
    let tmp = tempfile::tempdir().unwrap();
    let accs = [91.0, 93.0, 95.0];
    let runs = run_sweep(tmp.path(), &base(), &seed_spec(), |i| Some(accs[i]));
    let groups = group(runs, &[path("engine.seed")]);

    // WHEN mean and std are aggregated
    let mean = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Mean, MissingPolicy::Exclude);
    let std = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Std, MissingPolicy::Exclude);

    // THEN mean is 93 and the sample std is 2
    assert_eq!(mean.value, AggregateValue::Scalar(93.0));
    assert!((std.value.as_scalar().unwrap() - 2.0).abs() < 1e-12);
    assert_eq!((mean.expected, mean.observed), (3, 3));
}

#[test]
fn bdd_missing_member_is_excluded_and_counted() {
    // GIVEN one of three seeds produced no result
    let tmp = tempfile::tempdir().unwrap();
    let runs = run_sweep(tmp.path(), &base(), &seed_spec(), |i| match i {
        0 => Some(91.0),
        1 => None,
        _ => Some(95.0),
    });
    let groups = group(runs, &[path("engine.seed")]);

    // WHEN aggregated under the default policy
    let mean = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Mean, MissingPolicy::Exclude);
    let std = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Std, MissingPolicy::Exclude);

    // THEN statistics use the two observations
    assert_eq!(mean.value, AggregateValue::Scalar(93.0));
    assert!((std.value.as_scalar().unwrap() - 8.0_f64.sqrt()).abs() < 1e-12);
    // AND the gap is visible in the counts
    assert_eq!((mean.expected, mean.observed), (3, 2));

    // WHEN aggregated strictly
    let strict = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Mean, MissingPolicy::Strict);

    // THEN the group has no data
    assert_eq!(strict.value, AggregateValue::NoData);
}

#[test]
fn bdd_single_observation_has_no_std() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = run_sweep(tmp.path(), &base(), &seed_spec(), |i| (i == 0).then_some(0.5));
    let groups = group(runs, &[path("engine.seed")]);

    let std = aggregate(&groups[0], "test_acc", &Checkpoint::Last, Statistic::Std, MissingPolicy::Exclude);
    assert_eq!(std.value, AggregateValue::NoData);
    assert_ne!(std.value, AggregateValue::Scalar(0.0));
}

#[test]
fn bdd_unknown_metric_is_no_data() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = run_sweep(tmp.path(), &base(), &seed_spec(), |_| Some(0.5));
    let groups = group(runs, &[path("engine.seed")]);

    let m = aggregate(&groups[0], "val_loss", &Checkpoint::Last, Statistic::Mean, MissingPolicy::Exclude);
    assert_eq!(m.value, AggregateValue::NoData);
    assert_eq!(m.observed, 0);
}

// ──────────────────────────────────────────────
// Splits and plot tables
// ──────────────────────────────────────────────

fn grid_spec() -> SweepSpec {
    SweepSpec::from_entries([
        (
            "optimizer.learning_rate",
            list(vec![Value::Float(0.01), Value::Float(0.001)]),
        ),
        ("optimizer.rank", list(vec![Value::Int(8), Value::Int(4)])),
        ("engine.seed", list(vec![Value::Int(1), Value::Int(2)])),
        ("task.name", list(vec![Value::from("mnist"), Value::from("cifar")])),
    ])
    .unwrap()
}

/// Accuracy depends on the record's config; seed 2 adds 0.02.
fn grid_runs(root: &Path) -> Vec<RunResults> {
    let base = base();
    let spec = grid_spec();
    let layout = RunLayout::new(root, vec![Checkpoint::Last]);
    let records: Vec<_> = SweepExpander::new(&base, &spec, &layout)
        .unwrap()
        .records()
        .unwrap();
    records
        .into_iter()
        .map(|record| {
            let dir = layout.materialize(&record).unwrap();
            let c = &record.config;
            let lr = c.lookup("optimizer.learning_rate").unwrap().as_f64().unwrap();
            let rank = c.lookup("optimizer.rank").unwrap().as_f64().unwrap();
            let seed = c.lookup("engine.seed").unwrap().as_f64().unwrap();
            let acc = 0.5 + lr * 10.0 + rank / 100.0 + (seed - 1.0) * 0.02;
            fs::write(
                dir.result_path(&Checkpoint::Last),
                format!(r#"[{{"test_acc": {acc}}}]"#),
            )
            .unwrap();
            RunResults::load(record)
        })
        .collect()
}

#[test]
fn bdd_split_by_task_name() {
    let tmp = tempfile::tempdir().unwrap();
    let groups = group(grid_runs(tmp.path()), &[path("engine.seed")]);
    assert_eq!(groups.len(), 8);

    let panels = split(&groups, &path("task.name"));

    assert_eq!(panels.keys().collect::<Vec<_>>(), vec!["cifar", "mnist"]);
    assert!(panels.values().all(|g| g.len() == 4));
}

#[test]
fn bdd_plot_table_is_sorted_and_pools_unplotted_axes() {
    // GIVEN a grid over learning rate, rank, seed and task
    let tmp = tempfile::tempdir().unwrap();
    let groups = group(grid_runs(tmp.path()), &[path("engine.seed")]);
    let eval = EvaluationSpec::from_config(&base()).unwrap();

    // WHEN the plot is resolved without a split
    let tables = resolve(&eval.plot, "test_acc", &groups, None, MissingPolicy::Exclude);

    // THEN one table with numerically sorted rows and columns
    assert_eq!(tables.len(), 1);
    let t = &tables[0];
    assert_eq!(t.rows, vec!["0.001", "0.01"]);
    assert_eq!(t.columns, vec!["4", "8"]);

    // AND each cell pools both tasks and both seeds
    let cell = t.cell(0, 0).unwrap();
    assert_eq!((cell.expected, cell.observed), (4, 4));
    let expected_mean = 0.5 + 0.01 + 0.04 + 0.01;
    assert!((cell.value.as_scalar().unwrap() - expected_mean).abs() < 1e-9);
    assert_eq!(cell.flag, RangeFlag::InRange);
    assert!(cell.text.starts_with("0.6 ± "));
}

#[test]
fn bdd_plot_limits_clamp_or_flag_but_never_drop() {
    let tmp = tempfile::tempdir().unwrap();
    let groups = group(grid_runs(tmp.path()), &[path("engine.seed")]);
    let mut plot = EvaluationSpec::from_config(&base()).unwrap().plot;
    plot.limits = Some(Limits {
        lower: 0.0,
        upper: 0.6,
    });

    // WHEN clamping
    let clamped = &resolve(&plot, "test_acc", &groups, None, MissingPolicy::Exclude)[0];
    // THEN the largest cell (lr 0.01, rank 8) is pinned to the upper limit
    let cell = clamped.cell(1, 1).unwrap();
    assert_eq!(cell.flag, RangeFlag::Above);
    assert_eq!(cell.value, AggregateValue::Scalar(0.6));

    // WHEN flagging
    plot.limit_policy = LimitPolicy::Flag;
    let flagged = &resolve(&plot, "test_acc", &groups, None, MissingPolicy::Exclude)[0];
    // THEN the value is kept and marked
    let cell = flagged.cell(1, 1).unwrap();
    assert_eq!(cell.flag, RangeFlag::Above);
    assert!(cell.value.as_scalar().unwrap() > 0.6);
    assert!(cell.text.starts_with('>'));
}

#[test]
fn bdd_split_panels_and_empty_cells() {
    // GIVEN results only for the mnist task
    let tmp = tempfile::tempdir().unwrap();
    let runs: Vec<_> = grid_runs(tmp.path())
        .into_iter()
        .map(|mut r| {
            if r.record.config.lookup("task.name") == Some(&Value::from("cifar"))
                && r.record.config.lookup("optimizer.rank") == Some(&Value::Int(8))
            {
                r.results = Default::default();
            }
            r
        })
        .collect();
    let groups = group(runs, &[path("engine.seed")]);
    let eval = EvaluationSpec::from_config(&base()).unwrap();

    // WHEN split by task
    let tables = resolve(
        &eval.plot,
        "test_acc",
        &groups,
        Some(&path("task.name")),
        MissingPolicy::Exclude,
    );

    // THEN one panel per task
    assert_eq!(tables.len(), 2);
    assert_eq!(tables[0].panel.as_deref(), Some("cifar"));
    // AND the missing cells are explicit holes, not zeros
    let hole = tables[0].cell(0, 1).unwrap();
    assert_eq!(hole.flag, RangeFlag::NoData);
    assert_eq!(hole.value, AggregateValue::NoData);
    assert_eq!((hole.expected, hole.observed), (2, 0));
    assert_eq!(hole.text, "n/a (0/2)");
}

#[test]
fn bdd_gaps_are_marked_in_exported_tables() {
    // GIVEN no runs at all for lr 0.01 / rank 8, and one seed of lr 0.001 /
    // rank 4 / mnist without results
    let tmp = tempfile::tempdir().unwrap();
    let is = |r: &RunResults, key: &str, value: Value| r.record.config.lookup(key) == Some(&value);
    let runs: Vec<_> = grid_runs(tmp.path())
        .into_iter()
        .filter(|r| {
            !(is(r, "optimizer.learning_rate", Value::Float(0.01))
                && is(r, "optimizer.rank", Value::Int(8)))
        })
        .map(|mut r| {
            if is(&r, "optimizer.learning_rate", Value::Float(0.001))
                && is(&r, "optimizer.rank", Value::Int(4))
                && is(&r, "task.name", Value::from("mnist"))
                && is(&r, "engine.seed", Value::Int(1))
            {
                r.results = Default::default();
            }
            r
        })
        .collect();
    let groups = group(runs, &[path("engine.seed")]);
    let eval = EvaluationSpec::from_config(&base()).unwrap();

    // WHEN the plot is resolved and flattened for export
    let tables = resolve(&eval.plot, "test_acc", &groups, None, MissingPolicy::Exclude);
    let t = &tables[0];

    // THEN the empty cell says there were no runs
    let empty = t.cell(1, 1).unwrap();
    assert_eq!((empty.expected, empty.observed), (0, 0));
    assert_eq!(empty.text, NO_RUNS);
    // AND the partial cell carries its counts
    let partial = t.cell(0, 0).unwrap();
    assert_eq!((partial.expected, partial.observed), (4, 3));
    assert!(partial.text.ends_with(" (3/4)"));
    // AND no exported field is blank
    let csv = to_csv(&t.to_table()).unwrap();
    assert!(csv.contains(NO_RUNS));
    assert!(csv.lines().all(|line| !line.ends_with(',') && !line.contains(",,")));
}
