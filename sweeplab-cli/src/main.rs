//! Sweeplab CLI — expand, dispatch and evaluate hyperparameter sweeps.
//!
//! Commands:
//! - `expand`: list (and optionally materialize) every run of a sweep plan
//! - `run`: dispatch incomplete runs sequentially or to a batch scheduler
//! - `status`: report which runs are complete, from their directories
//! - `aggregate`: group runs over seeds and tabulate statistics of a metric
//! - `plot`: resolve the plot spec into heatmap tables
//!
//! Every command takes a sweep plan and any number of `--set path=value`
//! overrides applied to the base config.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sweeplab_core::{parse_override, Checkpoint, ConfigPath};
use sweeplab_runner::aggregate::split_label;
use sweeplab_runner::export::{parse_output_types, to_markdown};
use sweeplab_runner::{
    group, render_value, resolve, summarize, sweep_status, write_outputs, AggregationGroup,
    Dispatcher, ExportReport, GroupSummary, NumberFormat, OutputType, RunResults, Statistic,
    Strategy, SweepPlan, Table,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(
    name = "sweeplab",
    version,
    about = "Sweeplab — hyperparameter sweep expansion, dispatch and aggregation"
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Plan selection shared by every command.
#[derive(Args)]
struct PlanArgs {
    /// Sweep plan (TOML).
    plan: PathBuf,

    /// Override a base config value, e.g. --set engine.max_epochs=20.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Override the plan's output root.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Sequential,
    Batch,
}

#[derive(Subcommand)]
enum Commands {
    /// List every run of the sweep in dispatch order.
    Expand {
        #[command(flatten)]
        plan: PlanArgs,

        /// Create run directories and write their configs.
        #[arg(long, default_value_t = false)]
        write: bool,

        /// Print JSON instead of a listing.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Dispatch every incomplete run.
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        /// Override the plan's dispatch strategy.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Batch only: write submission scripts without submitting.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Report run completion from the run directories.
    Status {
        #[command(flatten)]
        plan: PlanArgs,

        /// List incomplete runs and their missing files.
        #[arg(long, default_value_t = false)]
        list: bool,
    },
    /// Aggregate a metric over seeds and export a summary table.
    Aggregate {
        #[command(flatten)]
        plan: PlanArgs,

        /// Metric to aggregate. Defaults to evaluation.plot.metric.
        #[arg(long)]
        metric: Option<String>,

        /// Checkpoint to read. Defaults to evaluation.plot.checkpoint.
        #[arg(long)]
        checkpoint: Option<Checkpoint>,

        /// Statistics to report.
        #[arg(long = "stat", value_delimiter = ',', default_value = "mean,std")]
        stats: Vec<Statistic>,

        /// Output types, overriding evaluation.output_types.
        #[arg(long, value_delimiter = ',')]
        output_types: Vec<String>,
    },
    /// Resolve the plot spec into tables for an external renderer.
    Plot {
        #[command(flatten)]
        plan: PlanArgs,

        /// Metric to plot. Defaults to evaluation.plot.metric.
        #[arg(long)]
        metric: Option<String>,

        /// Output types, overriding evaluation.output_types.
        #[arg(long, value_delimiter = ',')]
        output_types: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Expand { plan, write, json } => run_expand(&plan, write, json),
        Commands::Run {
            plan,
            strategy,
            dry_run,
        } => run_dispatch(&plan, strategy, dry_run),
        Commands::Status { plan, list } => run_status(&plan, list),
        Commands::Aggregate {
            plan,
            metric,
            checkpoint,
            stats,
            output_types,
        } => run_aggregate(&plan, metric, checkpoint, &stats, &output_types),
        Commands::Plot {
            plan,
            metric,
            output_types,
        } => run_plot(&plan, metric, &output_types),
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if verbose == 0 && !quiet => filter,
        _ => EnvFilter::new(level),
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(stderr_layer).init();
}

fn load_plan(args: &PlanArgs) -> Result<SweepPlan> {
    let overrides = args
        .overrides
        .iter()
        .map(|text| parse_override(text).with_context(|| format!("invalid --set '{text}'")))
        .collect::<Result<Vec<_>>>()?;
    let mut plan = SweepPlan::load(&args.plan)
        .with_context(|| format!("failed to load plan {}", args.plan.display()))?
        .with_overrides(overrides)?;
    if let Some(dir) = &args.output_dir {
        plan = plan.with_output_dir(dir);
    }
    Ok(plan)
}

// ─── expand ─────────────────────────────────────────────────────────

fn run_expand(args: &PlanArgs, write: bool, json: bool) -> Result<()> {
    let plan = load_plan(args)?;
    let expander = plan.expander()?;
    let mut listing = Vec::with_capacity(expander.len());

    for record in expander.iter() {
        let record = record?;
        if write {
            plan.layout.materialize(&record)?;
        }
        listing.push(serde_json::json!({
            "index": record.index,
            "identity": record.identity.to_string(),
            "dir": record.dir.path(),
            "complete": record.dir.is_complete(),
        }));
        if !json {
            let mark = if record.dir.is_complete() { "done" } else { "    " };
            println!("{:>5}  {mark}  {}", record.index, record.identity);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        println!(
            "{} runs under {}{}",
            expander.len(),
            plan.output_dir().display(),
            if write { " (configs written)" } else { "" }
        );
    }
    Ok(())
}

// ─── run ────────────────────────────────────────────────────────────

fn run_dispatch(args: &PlanArgs, strategy: Option<StrategyArg>, dry_run: bool) -> Result<()> {
    let mut plan = load_plan(args)?;
    if let Some(strategy) = strategy {
        plan.dispatch.strategy = match strategy {
            StrategyArg::Sequential => Strategy::Sequential,
            StrategyArg::Batch => Strategy::Batch,
        };
    }
    if dry_run {
        if plan.dispatch.strategy != Strategy::Batch {
            bail!("--dry-run only applies to batch dispatch");
        }
        plan.dispatch.cluster.dry_run = true;
    }

    let expander = plan.expander()?;
    let mut dispatcher = Dispatcher::new(plan.scheduler()?);
    let summary = dispatcher.dispatch(&expander)?;
    let summary_path = summary.write()?;

    println!(
        "{} runs: {} completed, {} skipped, {} submitted, {} failed",
        summary.total, summary.completed, summary.skipped, summary.submitted, summary.failed
    );
    println!("Summary written to: {}", summary_path.display());

    if !summary.is_success() {
        for failure in summary.failures() {
            eprintln!(
                "FAILED {}: {}",
                failure.identity,
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

// ─── status ─────────────────────────────────────────────────────────

fn run_status(args: &PlanArgs, list: bool) -> Result<()> {
    let plan = load_plan(args)?;
    let expander = plan.expander()?;
    let report = sweep_status(&expander);

    println!(
        "{}/{} runs complete under {}",
        report.complete(),
        report.total(),
        plan.output_dir().display()
    );
    if list {
        for run in report.incomplete() {
            let state = if run.started { "started" } else { "not started" };
            println!("{:>5}  {state:<11}  {}", run.index, run.identity);
            for missing in &run.missing {
                let name = missing.file_name().map_or_else(
                    || missing.display().to_string(),
                    |n| n.to_string_lossy().into_owned(),
                );
                println!("         missing {name}");
            }
        }
    }
    Ok(())
}

// ─── aggregate / plot ───────────────────────────────────────────────

fn load_groups(plan: &SweepPlan) -> Result<Vec<AggregationGroup>> {
    let records = plan.expander()?.records()?;
    let runs: Vec<RunResults> = records.into_iter().map(RunResults::load).collect();
    let with_results = runs.iter().filter(|r| !r.results.is_empty()).count();
    if with_results == 0 {
        warn!(output = %plan.output_dir().display(), "no run has produced results yet");
    } else {
        info!(runs = runs.len(), with_results, "loaded results");
    }
    Ok(group(runs, &plan.evaluation.aggregate_groups))
}

fn pick_metric(plan: &SweepPlan, metric: Option<String>) -> Result<String> {
    metric
        .or_else(|| plan.evaluation.plot.metric.clone())
        .context("no metric given: pass --metric or set evaluation.plot.metric")
}

fn pick_outputs(plan: &SweepPlan, requested: &[String]) -> Result<Vec<OutputType>> {
    let names: &[String] = if requested.is_empty() {
        &plan.evaluation.output_types
    } else {
        requested
    };
    Ok(parse_output_types(names)?)
}

fn report_exports(report: &ExportReport) {
    for path in &report.written {
        println!("Wrote {}", path.display());
    }
    for path in &report.skipped {
        println!("Skipped {} (needs an external renderer)", path.display());
    }
}

fn summary_table(
    metric: &str,
    checkpoint: &Checkpoint,
    groups: &[AggregationGroup],
    summaries: &[GroupSummary],
    split_key: Option<&ConfigPath>,
    fmt: &NumberFormat,
) -> Table {
    let mut headers = vec!["group".to_string()];
    if let Some(key) = split_key {
        headers.push(key.to_string());
    }
    headers.extend(["members", "expected", "observed"].map(String::from));
    if let Some(first) = summaries.first() {
        headers.extend(first.metrics.iter().map(|m| m.statistic.to_string()));
    }

    let rows = groups
        .iter()
        .zip(summaries)
        .map(|(group, summary)| {
            let mut row = vec![summary.group.clone()];
            if let Some(key) = split_key {
                row.push(split_label(group.value(key)));
            }
            let (expected, observed) = summary
                .metrics
                .first()
                .map_or((0, 0), |m| (m.expected, m.observed));
            row.push(summary.members.to_string());
            row.push(expected.to_string());
            row.push(observed.to_string());
            row.extend(
                summary
                    .metrics
                    .iter()
                    .map(|m| render_value(&m.value, m.expected, fmt)),
            );
            row
        })
        .collect();

    Table {
        title: format!("{metric} ({checkpoint})"),
        headers,
        rows,
    }
}

fn run_aggregate(
    args: &PlanArgs,
    metric: Option<String>,
    checkpoint: Option<Checkpoint>,
    stats: &[Statistic],
    output_types: &[String],
) -> Result<()> {
    let plan = load_plan(args)?;
    let metric = pick_metric(&plan, metric)?;
    let checkpoint = checkpoint.unwrap_or_else(|| plan.evaluation.plot.checkpoint.clone());
    let outputs = pick_outputs(&plan, output_types)?;
    let groups = load_groups(&plan)?;

    let summaries = summarize(
        &groups,
        &metric,
        &checkpoint,
        stats,
        plan.evaluation.missing_policy,
    );
    let table = summary_table(
        &metric,
        &checkpoint,
        &groups,
        &summaries,
        plan.evaluation.column_split_key.as_ref(),
        &plan.evaluation.plot.format,
    );
    print!("{}", to_markdown(&table));

    let stem = format!("{metric}_{checkpoint}_summary");
    let report = write_outputs(&plan.evaluation_dir(), &stem, &table, &summaries, &outputs)?;
    report_exports(&report);
    Ok(())
}

fn run_plot(args: &PlanArgs, metric: Option<String>, output_types: &[String]) -> Result<()> {
    let plan = load_plan(args)?;
    let metric = pick_metric(&plan, metric)?;
    let outputs = pick_outputs(&plan, output_types)?;
    let groups = load_groups(&plan)?;

    let tables = resolve(
        &plan.evaluation.plot,
        &metric,
        &groups,
        plan.evaluation.column_split_key.as_ref(),
        plan.evaluation.missing_policy,
    );
    let dir = plan.evaluation_dir();
    for table in &tables {
        let text = table.to_table();
        println!("{}", to_markdown(&text));
        let report = write_outputs(&dir, &table.stem(), &text, table, &outputs)?;
        report_exports(&report);
    }
    if tables.iter().all(|t| t.rows.is_empty()) {
        warn!(dir = %dir.display(), "plot has no rows");
    }
    Ok(())
}
