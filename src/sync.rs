#[cfg(feature = "loom")]
mod imp {
    use core::num::NonZeroUsize;
    pub(crate) use loom::sync::{Mutex, MutexGuard};
    use loom::thread;

    pub(crate) fn join(lhs: impl FnOnce() + Send + 'static, rhs: impl FnOnce() + Send + 'static) {
        let lhs = thread::spawn(lhs);
        let rhs = thread::spawn(rhs);
        lhs.join().expect("lhs dispatch thread panicked");
        rhs.join().expect("rhs dispatch thread panicked");
    }

    /// Under `loom` every model thread is spawned explicitly, so the
    /// parallelism bound is not applied.
    pub(crate) fn install<R: Send>(
        _max_parallel: Option<NonZeroUsize>,
        op: impl FnOnce() -> R + Send,
    ) -> Result<R, rayon::ThreadPoolBuildError> {
        Ok(op())
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use core::num::NonZeroUsize;
    pub(crate) use std::sync::{Mutex, MutexGuard};

    pub(crate) fn join(lhs: impl FnOnce() + Send, rhs: impl FnOnce() + Send) {
        rayon::join(lhs, rhs);
    }

    /// Runs `op` on a dedicated pool of `max_parallel` threads, or on the
    /// global rayon pool when unbounded.
    pub(crate) fn install<R: Send>(
        max_parallel: Option<NonZeroUsize>,
        op: impl FnOnce() -> R + Send,
    ) -> Result<R, rayon::ThreadPoolBuildError> {
        let Some(threads) = max_parallel else {
            return Ok(op());
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.get())
            .thread_name(|idx| format!("qpart-worker-{idx}"))
            .build()?;
        Ok(pool.install(op))
    }
}

pub(crate) use imp::*;
