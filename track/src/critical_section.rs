//! A mutex that knows which thread holds it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context;

/// Owner value while nobody holds the lock. [`context::thread_id`] never returns 0.
const NO_OWNER: usize = 0;

/// Mutual exclusion around `T` with scope-bound acquisition.
///
/// Besides the plain mutex semantics it records the owning thread, so that code running on the
/// owning thread (for example an allocation hook entered from inside a symbol lookup) can detect
/// that it is nested in the critical section instead of deadlocking on it.
#[derive(Debug, Default)]
pub struct CriticalSection<T> {
    owner: AtomicUsize,
    inner: Mutex<T>,
}

impl<T> CriticalSection<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            inner: Mutex::new(value),
        }
    }

    /// Acquire the section, blocking until it is available.
    ///
    /// A panic while holding the lock does not poison it: the protected bookkeeping must stay
    /// usable for reporting even after a host thread died with the lock held.
    pub fn enter(&self) -> CriticalGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(context::thread_id(), Ordering::Release);
        CriticalGuard {
            section: self,
            guard,
        }
    }

    /// `true` if the calling thread currently holds the section.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == context::thread_id()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the critical section on drop.
pub struct CriticalGuard<'a, T> {
    section: &'a CriticalSection<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for CriticalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CriticalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CriticalGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `guard` is dropped, so the owner is cleared while the lock is still held.
        self.section.owner.store(NO_OWNER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracks_owner() {
        let section = Arc::new(CriticalSection::new(0usize));
        assert!(!section.is_held_by_current_thread());
        {
            let mut guard = section.enter();
            *guard += 1;
            assert!(section.is_held_by_current_thread());

            let other = Arc::clone(&section);
            let held_elsewhere = std::thread::spawn(move || other.is_held_by_current_thread())
                .join()
                .unwrap();
            assert!(!held_elsewhere);
        }
        assert!(!section.is_held_by_current_thread());
        assert_eq!(*section.enter(), 1);
    }

    #[test]
    fn released_on_early_return() {
        fn bump(section: &CriticalSection<Vec<u32>>, value: u32) -> Option<()> {
            let mut guard = section.enter();
            if value == 0 {
                return None;
            }
            guard.push(value);
            Some(())
        }

        let section = CriticalSection::new(Vec::new());
        assert!(bump(&section, 0).is_none());
        assert!(bump(&section, 3).is_some());
        assert!(!section.is_held_by_current_thread());
        assert_eq!(section.into_inner(), vec![3]);
    }
}
