use core::{num::NonZeroUsize, time::Duration};

/// Configuration entry-point for instantiating the scheduler.
///
/// A concrete `Config` binds the context type shared by every unit of a
/// partitioner and the output type each unit produces.
pub trait Config: Sized + 'static {
    /// Read-only value passed to every unit function during an execution.
    type Context: Send + Sync + 'static;
    /// Value produced by a successful unit.
    type Output: Clone + Send + Sync + 'static;
}

/// Environment variable holding the default parallelism bound.
pub const MAX_PARALLEL_ENV: &str = "QPART_MAX_PARALLEL";
/// Environment variable holding the default per-unit timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS_ENV: &str = "QPART_DEFAULT_TIMEOUT_MS";

/// Runtime settings of a [`Partitioner`](crate::partitioner::Partitioner).
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionerConfig {
    /// Maximum number of units of one level running at the same time.
    ///
    /// `None` runs on rayon's global pool. An explicit `max_parallel`
    /// argument to `execute` takes precedence. Units that timed out are not
    /// counted: their functions finish on detached threads outside the pool.
    pub max_parallel: Option<NonZeroUsize>,
    /// Timeout applied to units added without one of their own.
    pub default_timeout: Option<Duration>,
}

impl PartitionerConfig {
    /// Unbounded parallelism and no default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `QPART_MAX_PARALLEL`: maximum concurrent units per level
    /// - `QPART_DEFAULT_TIMEOUT_MS`: default unit timeout in milliseconds
    ///
    /// Missing, unparsable or zero values leave the setting unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_parallel = lookup(MAX_PARALLEL_ENV)
            .and_then(|s| s.trim().parse::<usize>().ok())
            .and_then(NonZeroUsize::new);
        let default_timeout = lookup(DEFAULT_TIMEOUT_MS_ENV)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);
        Self {
            max_parallel,
            default_timeout,
        }
    }

    /// Bound the number of concurrently running units per level.
    pub fn with_max_parallel(mut self, max_parallel: NonZeroUsize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    /// Apply `timeout` to units that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}
