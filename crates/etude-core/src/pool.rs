// src/pool.rs
//! Fixed-size worker pool consuming a bounded FIFO task queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Locker, Semaphore};

/// Sizing for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub threads: usize,
    /// Queue capacity. `append` fails once this many tasks are waiting.
    pub max_requests: usize,
    /// Pin each worker to a core, wrapping around when there are more
    /// workers than cores.
    pub pin_cores: bool,
    pub name: String,
}

impl PoolConfig {
    pub fn new(threads: usize, max_requests: usize) -> Self {
        Self {
            threads,
            max_requests,
            pin_cores: false,
            name: "etude-worker".to_string(),
        }
    }
}

struct Shared<T> {
    queue: Locker<VecDeque<T>>,
    pending: Semaphore,
    max_requests: usize,
    stop: AtomicBool,
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `config.threads` workers, each running `handler` on the tasks it
    /// pops. The handler runs outside the queue lock.
    pub fn spawn<F>(config: PoolConfig, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if config.threads == 0 || config.max_requests == 0 {
            return Err(EtudeError::Config(
                "worker pool needs at least one thread and a non-zero queue".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Locker::new(VecDeque::with_capacity(config.max_requests.min(1024))),
            pending: Semaphore::new(0),
            max_requests: config.max_requests,
            stop: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);
        let core_ids = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(config.threads),
        };

        for i in 0..config.threads {
            let name = format!("{}-{}", config.name, i);
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };

            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                if let Some(id) = core_id {
                    if !core_affinity::set_for_current(id) {
                        debug!(worker = i, core = id.id, "failed to pin worker");
                    }
                }
                run_worker(&shared, handler.as_ref());
            });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    // Drop joins the workers that did start.
                    return Err(EtudeError::Spawn { name, source });
                }
            }
        }

        Ok(pool)
    }

    /// Enqueue a task without blocking. A full queue hands the task back.
    pub fn append(&self, task: T) -> Result<(), T> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.max_requests || self.shared.stop.load(Ordering::Acquire)
            {
                return Err(task);
            }
            queue.push_back(task);
        }
        self.shared.pending.post();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_requests
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker to stop and wait until all of them have exited.
    /// Tasks still queued are dropped. Idempotent.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        for _ in 0..self.handles.len() {
            self.shared.pending.post();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited by panic");
            }
        }
        self.shared.queue.lock().clear();
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T, F>(shared: &Shared<T>, handler: &F)
where
    F: Fn(T),
{
    loop {
        shared.pending.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(task) = shared.queue.lock().pop_front() else {
            continue;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
            error!("task handler panicked");
        }
    }
}
