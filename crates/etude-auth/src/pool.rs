//! Fixed-size connection pool shared by every worker.
//!
//! All connections are created up front. `acquire` blocks on a counting
//! semaphore until one is free; the returned guard puts it back on drop.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use etude_core::CredentialError;
use etude_core::sync::{Locker, Semaphore};
use tracing::debug;

pub struct ConnectionPool<C> {
    name: &'static str,
    idle: Locker<VecDeque<C>>,
    free: Semaphore,
    size: usize,
}

impl<C> ConnectionPool<C> {
    /// Create `size` connections with `factory`. An empty pool or any
    /// factory failure is an initialization error.
    pub fn connect<F>(name: &'static str, size: usize, mut factory: F) -> Result<Self, CredentialError>
    where
        F: FnMut(usize) -> Result<C, CredentialError>,
    {
        if size == 0 {
            return Err(CredentialError::PoolInit(name, "pool size is zero".into()));
        }
        let mut idle = VecDeque::with_capacity(size);
        for i in 0..size {
            let conn = factory(i).map_err(|e| CredentialError::PoolInit(name, e.to_string()))?;
            idle.push_back(conn);
        }
        debug!(pool = name, size, "connection pool ready");
        Ok(Self {
            name,
            idle: Locker::new(idle),
            free: Semaphore::new(size),
            size,
        })
    }

    /// Wait for a free connection.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, CredentialError> {
        self.free.wait();
        self.take()
    }

    /// A free connection, or `None` if all are in use.
    pub fn try_acquire(&self) -> Option<PooledConnection<'_, C>> {
        if !self.free.try_wait() {
            return None;
        }
        self.take().ok()
    }

    fn take(&self) -> Result<PooledConnection<'_, C>, CredentialError> {
        match self.idle.lock().pop_front() {
            Some(conn) => Ok(PooledConnection {
                pool: self,
                conn: ManuallyDrop::new(conn),
            }),
            None => {
                // Permits and idle connections move together; hand the
                // permit back rather than lose it.
                self.free.post();
                Err(CredentialError::Unavailable(format!(
                    "pool `{}` has no idle connection",
                    self.name
                )))
            }
        }
    }

    fn release(&self, conn: C) {
        self.idle.lock().push_back(conn);
        self.free.post();
    }

    pub fn free_count(&self) -> usize {
        self.free.available()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A checked-out connection. Returned to the pool when dropped.
pub struct PooledConnection<'a, C> {
    pool: &'a ConnectionPool<C>,
    conn: ManuallyDrop<C>,
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, and never touched again.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guards_return_connections() {
        let pool = ConnectionPool::connect("test", 2, |i| Ok(i)).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_count(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!((*a, *b), (0, 1));
        assert_eq!(pool.free_count(), 0);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(*pool.acquire().unwrap(), 0);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(ConnectionPool::connect("test", 1, |_| Ok(String::new())).unwrap());
        let mut held = pool.acquire().unwrap();
        held.push_str("touched");

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|c| c.clone()).unwrap())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().unwrap(), "touched");
    }

    #[test]
    fn init_failures() {
        assert!(matches!(
            ConnectionPool::<u8>::connect("empty", 0, |_| Ok(0)),
            Err(CredentialError::PoolInit("empty", _))
        ));
        let failing = ConnectionPool::<u8>::connect("flaky", 3, |i| {
            if i == 2 {
                Err(CredentialError::Unavailable("refused".into()))
            } else {
                Ok(0)
            }
        });
        assert!(matches!(failing, Err(CredentialError::PoolInit("flaky", _))));
    }
}
