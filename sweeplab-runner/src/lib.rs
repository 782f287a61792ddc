//! Sweeplab Runner — dispatch, aggregation and plot tables.
//!
//! This crate builds on `sweeplab-core` to provide:
//! - Sweep plan files (base config + axes + dispatch settings)
//! - Job dispatch with sequential and batch schedulers, resume and summaries
//! - Result file loading and seed aggregation with explicit `NoData` gaps
//! - Evaluation settings read from the config's `evaluation` namespace
//! - Plot table resolution and CSV/JSON/Markdown export

pub mod aggregate;
pub mod dispatch;
pub mod evaluation;
pub mod export;
pub mod plan;
pub mod plot;
pub mod results;

pub use aggregate::{
    aggregate, group, split, summarize, AggregateValue, AggregatedMetric, AggregationGroup,
    GroupSummary, MissingPolicy, Observations, Statistic,
};
pub use dispatch::{
    sweep_status, BatchScheduler, ClusterResources, CommandTrainer, Dispatcher, JobHandle,
    RunFailure, RunOutcome, RunState, Scheduler, SequentialScheduler, StatusReport, SweepSummary,
    Trainer,
};
pub use evaluation::{EvaluationSpec, PlotSpec};
pub use export::{write_outputs, ExportError, ExportReport, OutputType, Table};
pub use plan::{DispatchConfig, PlanError, Strategy, SweepPlan};
pub use plot::{
    render_value, resolve, LimitPolicy, Limits, NumberFormat, PlotCell, PlotTable, RangeFlag,
};
pub use results::{ResultSet, RunResults};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn aggregation_types_are_send_sync() {
        assert_send::<AggregationGroup>();
        assert_sync::<AggregationGroup>();
        assert_send::<PlotTable>();
        assert_sync::<PlotTable>();
    }

    #[test]
    fn plan_and_summary_are_send_sync() {
        assert_send::<SweepPlan>();
        assert_sync::<SweepPlan>();
        assert_send::<SweepSummary>();
        assert_sync::<SweepSummary>();
    }
}
