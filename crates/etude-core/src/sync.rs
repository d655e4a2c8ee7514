//! Blocking synchronization primitives shared by the worker pool and the
//! credential connection pools.
//!
//! Both primitives recover from poisoning: a panicking task never leaves the
//! protected counters or queues structurally invalid, so the next holder can
//! carry on.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A mutex with scoped locking that never surfaces poisoning.
#[derive(Debug, Default)]
pub struct Locker<T> {
    inner: Mutex<T>,
}

impl<T> Locker<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Lock for the lifetime of the returned guard.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Condition variable paired with a [`Locker`] guard.
#[derive(Debug, Default)]
pub struct Cond {
    inner: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Self {
            inner: Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self
            .inner
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    pub fn signal(&self) {
        self.inner.notify_one();
    }
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Locker<usize>,
    cond: Cond,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Locker::new(permits),
            cond: Cond::new(),
        }
    }

    /// Block until a permit is available and take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            permits = self.cond.wait(permits);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available right now.
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Release one permit and wake one waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.signal();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}
