// src/stats.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide server counters. The active-connection count doubles as the
/// input to the accept-time connection ceiling.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerStats {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub evictions: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active_conns.load(Ordering::Relaxed),
            requests: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active: usize,
    pub requests: usize,
    pub bytes_sent: usize,
    pub evictions: usize,
    pub rejected: usize,
}
