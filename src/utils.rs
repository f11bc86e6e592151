use crate::sync::{Mutex, MutexGuard};
use core::ops::Range;
use std::sync::PoisonError;

pub(crate) trait RangeSplitAtHalf {
    fn split_at_half(&self) -> (Range<usize>, Range<usize>);
}

impl RangeSplitAtHalf for Range<usize> {
    #[inline]
    fn split_at_half(&self) -> (Range<usize>, Range<usize>) {
        let mid_abs = self.start + self.len() / 2;
        (self.start..mid_abs, mid_abs..self.end)
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before
/// any call that may unwind, so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
