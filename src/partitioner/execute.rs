use crate::{
    config::Config,
    partitioner::Ledger,
    plan::ExecutionPlan,
    sync::{Mutex, join},
    unit::Unit,
    utils::{RangeSplitAtHalf, lock},
};
use core::ops::Range;
use std::sync::Arc;

/// State shared by every branch of one `Partitioner::execute` call.
pub(super) struct LevelRun<C: Config> {
    pub(super) plan: ExecutionPlan<C>,
    pub(super) context: Arc<C::Context>,
    pub(super) ledger: Arc<Mutex<Ledger<C::Output>>>,
}

/// Run the units of `level` within `range`, forking halves of the range
/// until each branch holds a single unit.
///
/// Returns once every unit of the range has run or been skipped. Units of one
/// level never depend on each other, so the completed set read by a branch
/// cannot change under it because of a sibling.
pub(super) fn join_level<C: Config>(
    level: Arc<[Arc<Unit<C>>]>,
    range: Range<usize>,
    run: Arc<LevelRun<C>>,
) {
    match range.len() {
        0 => return,
        1 => {
            run_unit(&level[range.start], &run);
            return;
        }
        _ => {}
    }

    let (left_range, right_range) = range.split_at_half();
    let (rhs_level, rhs_run) = (level.clone(), run.clone());
    join(
        move || join_level(level, left_range, run),
        move || join_level(rhs_level, right_range, rhs_run),
    );
}

/// Execute one unit and record its result, unless something upstream of it
/// failed.
fn run_unit<C: Config>(unit: &Unit<C>, run: &LevelRun<C>) {
    let LevelRun {
        plan,
        context,
        ledger,
    } = run;
    // Levels are barriers, so every dependency was already attempted or
    // skipped; only a completed one lets the unit run.
    let missing = plan.dependencies_of(unit.id()).and_then(|dependencies| {
        let ledger = lock(ledger);
        dependencies
            .iter()
            .find(|id| !ledger.completed.contains(*id))
            .copied()
    });
    if let Some(dependency) = missing {
        tracing::debug!(
            unit = %unit.id(),
            name = unit.name(),
            %dependency,
            "skipping unit downstream of a failure"
        );
        return;
    }

    let result = unit.execute(context);
    if let Some(error) = result.error() {
        tracing::warn!(unit = %unit.id(), name = unit.name(), %error, "unit failed");
    }
    lock(ledger).record(unit.id(), result);
}
