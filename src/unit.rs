use crate::{
    config::Config,
    sync::Mutex,
    task::{BoxError, Executable},
    types::{HashMap, HashSet, UnitId},
    utils::lock,
};
use core::time::Duration;
use derive_more::Debug;
use serde_json::Value;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak, mpsc},
    thread,
    time::Instant,
};
use thiserror::Error;

/// Lifecycle state of a unit.
///
/// Legal transitions are `Pending -> Running -> Completed | Failed` and
/// `Pending -> Cancelled`. Terminal states never change again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnitState {
    /// Not yet attempted.
    Pending,
    /// Reserved: dependencies are checked on demand, so the scheduler never
    /// parks a unit here.
    Ready,
    /// The unit function is being invoked.
    Running,
    /// The unit function returned a value.
    Completed,
    /// The unit function returned an error, panicked or timed out.
    Failed,
    /// Cancelled before it was attempted.
    Cancelled,
}

impl UnitState {
    /// Whether the state can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a unit did not produce a value.
///
/// Always captured into the unit's [`UnitResult`], never raised to the
/// caller of `Partitioner::execute`.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum UnitError {
    /// The unit function returned an error.
    #[error("unit function failed: {0}")]
    Execution(#[source] Arc<dyn std::error::Error + Send + Sync>),
    /// The unit function panicked.
    #[error("unit function panicked: {0}")]
    Panicked(String),
    /// The unit function did not return within its timeout.
    #[error("unit timed out after {0:?}")]
    Timeout(Duration),
    /// The unit was cancelled before it could run.
    #[error("unit was cancelled")]
    Cancelled,
    /// Another caller is executing the unit right now.
    #[error("unit is already running")]
    AlreadyRunning,
}

/// Outcome of one attempt to run a unit.
#[must_use]
#[derive(Debug)]
pub struct UnitResult<O> {
    /// The value on success, the captured error otherwise.
    pub outcome: Result<O, UnitError>,
    /// Wall-clock time spent waiting on the unit function.
    pub duration: Duration,
}

impl<O> UnitResult<O> {
    fn failed(error: UnitError) -> Self {
        Self {
            outcome: Err(error),
            duration: Duration::ZERO,
        }
    }

    /// Whether the unit produced a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The produced value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&O> {
        self.outcome.as_ref().ok()
    }

    /// The captured error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&UnitError> {
        self.outcome.as_ref().err()
    }
}

/// Shared handle to a unit's result.
pub type SharedResult<C> = Arc<UnitResult<<C as Config>::Output>>;

/// Non-owning reference to a dependency. The id survives the dependency
/// being dropped so plans can report it.
#[derive(Debug)]
struct Dependency<C: Config> {
    id: UnitId,
    unit: Weak<Unit<C>>,
}

#[derive(Debug)]
struct UnitCell<C: Config> {
    state: UnitState,
    result: Option<SharedResult<C>>,
    dependencies: Vec<Dependency<C>>,
}

/// A single schedulable computation.
///
/// Units are shared through `Arc`. Dependencies are held as weak
/// references: the [`Partitioner`](crate::partitioner::Partitioner) owns the
/// authoritative collection.
#[derive(Debug)]
pub struct Unit<C: Config> {
    id: UnitId,
    name: String,
    #[debug(skip)]
    func: Arc<dyn Executable<C>>,
    timeout: Option<Duration>,
    metadata: HashMap<String, Value>,
    cell: Mutex<UnitCell<C>>,
}

impl<C: Config> Unit<C> {
    /// Start building a unit around `func`.
    pub fn builder<F>(func: F) -> UnitBuilder<C>
    where
        F: Fn(&C::Context) -> Result<C::Output, BoxError> + Send + Sync + 'static,
    {
        UnitBuilder::from_executable(Arc::new(func))
    }

    /// Unique id assigned at creation.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Free-form metadata attached at creation.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        lock(&self.cell).state
    }

    /// Dependencies that are still alive, in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Arc<Self>> {
        lock(&self.cell)
            .dependencies
            .iter()
            .filter_map(|dep| dep.unit.upgrade())
            .collect()
    }

    /// Ids of all declared dependencies, in declaration order.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<UnitId> {
        lock(&self.cell).dependencies.iter().map(|dep| dep.id).collect()
    }

    /// Declare one more dependency.
    ///
    /// Only a `Pending` unit accepts new dependencies; returns `false`
    /// otherwise. Cycles are not checked here, they are reported when an
    /// [`ExecutionPlan`](crate::plan::ExecutionPlan) is built.
    pub fn depends_on(&self, dependency: &Arc<Self>) -> bool {
        let mut cell = lock(&self.cell);
        if cell.state != UnitState::Pending {
            return false;
        }
        cell.dependencies.push(Dependency {
            id: dependency.id,
            unit: Arc::downgrade(dependency),
        });
        true
    }

    /// Whether the unit is `Pending` and every dependency is in `completed`.
    #[must_use]
    pub fn can_execute(&self, completed: &HashSet<UnitId>) -> bool {
        let cell = lock(&self.cell);
        cell.state == UnitState::Pending
            && cell.dependencies.iter().all(|dep| completed.contains(&dep.id))
    }

    /// Full result of the attempt, present once `Completed` or `Failed`.
    #[must_use]
    pub fn result(&self) -> Option<SharedResult<C>> {
        lock(&self.cell).result.clone()
    }

    /// The produced value if the unit completed successfully.
    ///
    /// `None` both before execution and after a failure; check
    /// [`state`](Self::state) to tell them apart.
    #[must_use]
    pub fn output(&self) -> Option<C::Output> {
        lock(&self.cell)
            .result
            .as_ref()
            .and_then(|result| result.value().cloned())
    }

    /// Cancel the unit if it has not been attempted yet.
    pub fn cancel(&self) -> bool {
        let mut cell = lock(&self.cell);
        if cell.state != UnitState::Pending {
            return false;
        }
        cell.state = UnitState::Cancelled;
        tracing::trace!(unit = %self.id, name = %self.name, "unit cancelled");
        true
    }

    /// Run the unit function with `context`, at most once.
    ///
    /// A terminal unit returns its cached result. A cancelled unit returns a
    /// fresh [`UnitError::Cancelled`] result without calling the function.
    /// Errors, panics and timeouts of the function become a failed result.
    pub fn execute(&self, context: &Arc<C::Context>) -> SharedResult<C> {
        {
            let mut cell = lock(&self.cell);
            match cell.state {
                UnitState::Completed | UnitState::Failed => {
                    if let Some(result) = &cell.result {
                        return result.clone();
                    }
                }
                UnitState::Cancelled => {
                    return Arc::new(UnitResult::failed(UnitError::Cancelled));
                }
                UnitState::Running => {
                    return Arc::new(UnitResult::failed(UnitError::AlreadyRunning));
                }
                UnitState::Pending | UnitState::Ready => {}
            }
            cell.state = UnitState::Running;
        }
        tracing::trace!(unit = %self.id, name = %self.name, "unit running");

        let started = Instant::now();
        let outcome = self.invoke(context);
        let result = Arc::new(UnitResult {
            outcome,
            duration: started.elapsed(),
        });

        let state = if result.is_success() {
            UnitState::Completed
        } else {
            UnitState::Failed
        };
        let mut cell = lock(&self.cell);
        cell.state = state;
        cell.result = Some(result.clone());
        drop(cell);
        tracing::trace!(
            unit = %self.id,
            name = %self.name,
            ?state,
            duration = ?result.duration,
            "unit finished"
        );
        result
    }

    fn invoke(&self, context: &Arc<C::Context>) -> Result<C::Output, UnitError> {
        let Some(limit) = self.timeout else {
            return call_guarded(self.func.as_ref(), context);
        };
        // The worker is detached on timeout; its late output is dropped
        // together with the channel.
        let (tx, rx) = mpsc::sync_channel(1);
        let func = self.func.clone();
        let context = context.clone();
        thread::Builder::new()
            .name(format!("qpart-unit-{}", self.id.short()))
            .spawn(move || {
                let _ = tx.send(call_guarded(func.as_ref(), &context));
            })
            .map_err(|err| UnitError::Execution(Arc::new(err)))?;
        match rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(UnitError::Timeout(limit)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(UnitError::Panicked(
                "unit worker exited without reporting".to_owned(),
            )),
        }
    }
}

fn call_guarded<C: Config>(
    func: &dyn Executable<C>,
    context: &C::Context,
) -> Result<C::Output, UnitError> {
    match panic::catch_unwind(AssertUnwindSafe(|| func.call(context))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(UnitError::Execution(Arc::from(err))),
        Err(payload) => Err(UnitError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Builder for [`Unit`].
#[must_use]
#[derive(Debug)]
pub struct UnitBuilder<C: Config> {
    #[debug(skip)]
    func: Arc<dyn Executable<C>>,
    name: Option<String>,
    timeout: Option<Duration>,
    metadata: HashMap<String, Value>,
    dependencies: Vec<Arc<Unit<C>>>,
}

impl<C: Config> UnitBuilder<C> {
    /// Start from an already shared computation.
    pub fn from_executable(func: Arc<dyn Executable<C>>) -> Self {
        Self {
            func,
            name: None,
            timeout: None,
            metadata: HashMap::default(),
            dependencies: Vec::new(),
        }
    }

    /// Human-readable name; defaults to `unit-` followed by the id prefix.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Fail the unit if its function runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add one dependency.
    pub fn depends_on(mut self, dependency: &Arc<Unit<C>>) -> Self {
        self.dependencies.push(dependency.clone());
        self
    }

    /// Add several dependencies, keeping their order.
    pub fn dependencies<'a>(
        mut self,
        dependencies: impl IntoIterator<Item = &'a Arc<Unit<C>>>,
    ) -> Self {
        self.dependencies.extend(dependencies.into_iter().cloned());
        self
    }

    /// Attach a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn timeout_or(mut self, default: Option<Duration>) -> Self {
        self.timeout = self.timeout.or(default);
        self
    }

    /// Create the unit in the `Pending` state.
    #[must_use]
    pub fn build(self) -> Arc<Unit<C>> {
        let Self {
            func,
            name,
            timeout,
            metadata,
            dependencies,
        } = self;
        let id = UnitId::new_v4();
        let dependencies = dependencies
            .iter()
            .map(|dep| Dependency {
                id: dep.id,
                unit: Arc::downgrade(dep),
            })
            .collect();
        Arc::new(Unit {
            id,
            name: name.unwrap_or_else(|| format!("unit-{}", id.short())),
            func,
            timeout,
            metadata,
            cell: Mutex::new(UnitCell {
                state: UnitState::Pending,
                result: None,
                dependencies,
            }),
        })
    }
}
