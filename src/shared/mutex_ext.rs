//! Usage: Mutex extension trait that recovers from poisoning instead of panicking.

use std::sync::{Mutex, MutexGuard};

/// Lock helper for the session locks; poisoning is logged, never propagated.
pub(crate) trait MutexExt<T> {
    /// Acquire the lock; on poisoning, log the call site and take the inner data.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    mutex_type = std::any::type_name::<T>(),
                    file = loc.file(),
                    line = loc.line(),
                    "mutex poisoned by a panicking holder; recovered inner state"
                );
                poisoned.into_inner()
            }
        }
    }
}
