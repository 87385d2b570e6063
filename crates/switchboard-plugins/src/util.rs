use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Lock `mutex`, recovering the guard if a plugin callback panicked while
/// holding it. Everything guarded in this crate is plain bookkeeping.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
