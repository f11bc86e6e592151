mod execute;

use crate::{
    config::{Config, PartitionerConfig},
    partitioner::execute::{LevelRun, join_level},
    plan::{ExecutionPlan, PlanError},
    sync::{self, Mutex},
    task::BoxError,
    types::{HashMap, HashSet, UnitId},
    unit::{SharedResult, Unit, UnitBuilder, UnitError, UnitResult},
    utils::lock,
};
use core::num::NonZeroUsize;
use derive_more::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Error aborting a whole [`Partitioner::execute`] call.
///
/// Failures of individual units never show up here; see
/// [`Partitioner::failed_units`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecuteError {
    /// The units could not be leveled, typically because of a cycle.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// The bounded worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Per-execution bookkeeping shared by the workers of a level.
#[derive(Debug)]
struct Ledger<O> {
    results: HashMap<UnitId, Arc<UnitResult<O>>>,
    completed: HashSet<UnitId>,
    failed: HashSet<UnitId>,
}

impl<O> Default for Ledger<O> {
    fn default() -> Self {
        Self {
            results: HashMap::default(),
            completed: HashSet::default(),
            failed: HashSet::default(),
        }
    }
}

impl<O> Ledger<O> {
    fn record(&mut self, id: UnitId, result: Arc<UnitResult<O>>) {
        if result.is_success() {
            self.completed.insert(id);
        } else {
            self.failed.insert(id);
        }
        self.results.insert(id, result);
    }
}

/// Owns a set of units and runs them level by level.
///
/// Levels are separated by a full barrier; units within a level run in
/// parallel. A unit whose dependencies are not all in the completed set is
/// skipped: it is neither executed nor recorded in the results, the
/// completed set or the failed set. Skips cascade because a skipped unit is
/// never completed, so only the root failure is ever in the failed set.
#[must_use]
#[derive(Debug)]
pub struct Partitioner<C: Config> {
    units: Vec<Arc<Unit<C>>>,
    #[debug(skip)]
    ledger: Arc<Mutex<Ledger<C::Output>>>,
    config: PartitionerConfig,
}

impl<C: Config> Default for Partitioner<C> {
    fn default() -> Self {
        Self::with_config(PartitionerConfig::default())
    }
}

impl<C: Config> Partitioner<C> {
    /// Empty partitioner with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty partitioner with the given settings.
    pub fn with_config(config: PartitionerConfig) -> Self {
        Self {
            units: Vec::new(),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            config,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &PartitionerConfig {
        &self.config
    }

    /// Register a unit running `func` after `dependencies`.
    ///
    /// The returned handle can be used as a dependency of later units.
    pub fn add_unit<F>(&mut self, func: F, dependencies: &[Arc<Unit<C>>]) -> Arc<Unit<C>>
    where
        F: Fn(&C::Context) -> Result<C::Output, BoxError> + Send + Sync + 'static,
    {
        self.add(Unit::builder(func).dependencies(dependencies))
    }

    /// Register a unit built from `builder`.
    ///
    /// The configured default timeout applies if the builder sets none. No
    /// cycle check happens here.
    pub fn add(&mut self, builder: UnitBuilder<C>) -> Arc<Unit<C>> {
        let unit = builder.timeout_or(self.config.default_timeout).build();
        tracing::trace!(unit = %unit.id(), name = unit.name(), "unit added");
        self.units.push(unit.clone());
        unit
    }

    /// Registered units, in insertion order.
    #[must_use]
    pub fn units(&self) -> &[Arc<Unit<C>>] {
        &self.units
    }

    /// Look a registered unit up by id.
    #[must_use]
    pub fn unit(&self, id: UnitId) -> Option<&Arc<Unit<C>>> {
        self.units.iter().find(|unit| unit.id() == id)
    }

    /// Number of registered units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether no unit is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Level the currently registered units.
    ///
    /// # Errors
    /// Propagates [`PlanError`], e.g. when the units form a cycle.
    pub fn build_execution_plan(&self) -> Result<ExecutionPlan<C>, PlanError> {
        let plan = ExecutionPlan::new(&self.units)?;
        tracing::debug!(
            units = plan.len(),
            levels = plan.level_count(),
            max_parallelism = plan.maximum_parallelism(),
            "execution plan built"
        );
        Ok(plan)
    }

    /// Run every unit with `context` and return the values of the units
    /// that succeeded, keyed by unit id.
    ///
    /// Results of the previous call are discarded first. At most
    /// `max_parallel` units of a level run at the same time; `None` falls
    /// back to [`PartitionerConfig::max_parallel`]. Failing units are only
    /// visible through [`failed_units`](Self::failed_units).
    ///
    /// A unit that times out fails at its deadline, but its function keeps
    /// running on a detached thread outside the worker pool, so the bound
    /// does not cover timed-out units still running in the background.
    ///
    /// # Errors
    /// [`ExecuteError::Plan`] if the units cannot be leveled, in which case
    /// no unit runs. [`ExecuteError::ThreadPool`] if the bounded pool cannot
    /// be created.
    #[tracing::instrument(level = "debug", skip_all, fields(units = self.units.len()))]
    pub fn execute(
        &mut self,
        context: C::Context,
        max_parallel: Option<NonZeroUsize>,
    ) -> Result<HashMap<UnitId, C::Output>, ExecuteError> {
        *lock(&self.ledger) = Ledger::default();
        let run = Arc::new(LevelRun {
            plan: self.build_execution_plan()?,
            context: Arc::new(context),
            ledger: self.ledger.clone(),
        });
        sync::install(max_parallel.or(self.config.max_parallel), move || {
            for level_idx in 0..run.plan.level_count() {
                let level: Arc<[Arc<Unit<C>>]> = run.plan.units_at_level(level_idx).into();
                tracing::debug!(level = level_idx, units = level.len(), "dispatching level");
                let range = 0..level.len();
                // Returns only once every unit of the level is done.
                join_level(level, range, run.clone());
            }
        })?;

        let ledger = lock(&self.ledger);
        tracing::info!(
            completed = ledger.completed.len(),
            failed = ledger.failed.len(),
            skipped = self.units.len() - ledger.results.len(),
            "execution finished"
        );
        Ok(ledger
            .results
            .iter()
            .filter_map(|(&id, result)| result.value().map(|value| (id, value.clone())))
            .collect())
    }

    /// Failed units of the last execution with their errors, in insertion
    /// order.
    #[must_use]
    pub fn failed_units(&self) -> Vec<(Arc<Unit<C>>, UnitError)> {
        let ledger = lock(&self.ledger);
        self.units
            .iter()
            .filter(|unit| ledger.failed.contains(&unit.id()))
            .filter_map(|unit| {
                let error = ledger.results.get(&unit.id())?.error()?.clone();
                Some((unit.clone(), error))
            })
            .collect()
    }

    /// Cancel every unit still `Pending` and return how many were cancelled.
    pub fn cancel_all_pending(&self) -> usize {
        let cancelled = self.units.iter().filter(|unit| unit.cancel()).count();
        tracing::debug!(cancelled, "pending units cancelled");
        cancelled
    }

    /// Results recorded by the last execution, for attempted units only.
    #[must_use]
    pub fn results(&self) -> HashMap<UnitId, SharedResult<C>> {
        lock(&self.ledger).results.clone()
    }

    /// Units that succeeded in the last execution.
    #[must_use]
    pub fn completed(&self) -> HashSet<UnitId> {
        lock(&self.ledger).completed.clone()
    }

    /// Units that failed in the last execution.
    #[must_use]
    pub fn failed(&self) -> HashSet<UnitId> {
        lock(&self.ledger).failed.clone()
    }
}
