//! Scoped acquisition of the process-wide runtime mutex.

use crate::init::RuntimeState;

/// Holds the runtime's free mutex for the lifetime of the guard.
///
/// Brackets operations that must not interleave with concurrent runtime state
/// changes, allocator bookkeeping in particular. Not re-entrant: taking a
/// second guard on the same logical flow while one is held is caller error.
#[derive(Debug)]
pub struct FreeMutexGuard<'a> {
    state: &'a RuntimeState,
}

impl RuntimeState {
    /// Acquire the runtime's free mutex until the guard is dropped.
    pub fn free_mutex(&self) -> FreeMutexGuard<'_> {
        self.driver().lock_mutex();
        FreeMutexGuard { state: self }
    }
}

impl Drop for FreeMutexGuard<'_> {
    fn drop(&mut self) {
        self.state.driver().unlock_mutex();
    }
}
