// src/slab.rs
use std::sync::Arc;

use crate::conn::Conn;

/// Connection slots indexed by file descriptor. A slot is allocated the first
/// time its descriptor is accepted and reused for every later socket that
/// gets the same number.
pub struct ConnectionSlab {
    entries: Vec<Option<Arc<Conn>>>,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries }
    }

    /// The slot for `fd`, created on first use. `None` if `fd` is out of range.
    pub fn claim(&mut self, fd: i32) -> Option<Arc<Conn>> {
        let slot = self.entries.get_mut(usize::try_from(fd).ok()?)?;
        Some(slot.get_or_insert_with(|| Arc::new(Conn::new())).clone())
    }

    #[inline(always)]
    pub fn get(&self, fd: i32) -> Option<&Arc<Conn>> {
        self.entries.get(usize::try_from(fd).ok()?)?.as_ref()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Every slot allocated so far, live or not.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Conn>> {
        self.entries.iter().flatten()
    }
}
