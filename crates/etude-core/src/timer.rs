// src/timer.rs
//! Hashed timing wheel for idle-connection deadlines.
//!
//! Entries hash into `slots` by deadline; an entry more than one revolution
//! away simply stays in its slot until the wheel comes round to its deadline.
//! Add, refresh and cancel are O(1); a tick only visits one slot.

use std::collections::{HashMap, HashSet};

use crate::sync::Locker;

pub const DEFAULT_SLOTS: usize = 60;

/// Identity of a live timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry<T> {
    deadline: u64,
    timeout: u64,
    slot: usize,
    payload: T,
}

struct Wheel<T> {
    now: u64,
    next_id: u64,
    slots: Vec<HashSet<TimerId>>,
    entries: HashMap<TimerId, Entry<T>>,
}

impl<T> Wheel<T> {
    fn place(&mut self, id: TimerId, deadline: u64) -> usize {
        let slot = (deadline % self.slots.len() as u64) as usize;
        self.slots[slot].insert(id);
        slot
    }
}

/// Thread-safe timer wheel. Callbacks run after the internal lock is
/// released, so an expiry handler may freely call [`TimerWheel::cancel`].
pub struct TimerWheel<T> {
    inner: Locker<Wheel<T>>,
}

impl<T> TimerWheel<T> {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            inner: Locker::new(Wheel {
                now: 0,
                next_id: 0,
                slots: (0..slots).map(|_| HashSet::new()).collect(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Insert an entry due `timeout` ticks from now (at least one).
    pub fn add(&self, timeout: u64, payload: T) -> TimerId {
        let timeout = timeout.max(1);
        let mut wheel = self.inner.lock();
        let id = TimerId(wheel.next_id);
        wheel.next_id += 1;
        let deadline = wheel.now + timeout;
        let slot = wheel.place(id, deadline);
        wheel.entries.insert(
            id,
            Entry {
                deadline,
                timeout,
                slot,
                payload,
            },
        );
        id
    }

    /// Push the deadline of `id` back to a full timeout from now.
    /// Returns `false` if the entry is gone.
    pub fn refresh(&self, id: TimerId) -> bool {
        let mut wheel = self.inner.lock();
        let now = wheel.now;
        let (old_slot, deadline) = match wheel.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = now + entry.timeout;
                (entry.slot, entry.deadline)
            }
            None => return false,
        };
        wheel.slots[old_slot].remove(&id);
        let slot = wheel.place(id, deadline);
        if let Some(entry) = wheel.entries.get_mut(&id) {
            entry.slot = slot;
        }
        true
    }

    /// Remove an entry, returning its payload if it was still live.
    pub fn cancel(&self, id: TimerId) -> Option<T> {
        let mut wheel = self.inner.lock();
        let entry = wheel.entries.remove(&id)?;
        wheel.slots[entry.slot].remove(&id);
        Some(entry.payload)
    }

    /// Advance time by one unit and hand every expired payload to `on_expire`.
    /// Returns the number of expired entries.
    pub fn tick(&self, mut on_expire: impl FnMut(T)) -> usize {
        let expired = {
            let mut wheel = self.inner.lock();
            wheel.now += 1;
            let now = wheel.now;
            let slot = (now % wheel.slots.len() as u64) as usize;

            let due: Vec<TimerId> = wheel.slots[slot]
                .iter()
                .copied()
                .filter(|id| wheel.entries.get(id).is_some_and(|e| e.deadline <= now))
                .collect();

            let mut expired = Vec::with_capacity(due.len());
            for id in due {
                wheel.slots[slot].remove(&id);
                if let Some(entry) = wheel.entries.remove(&id) {
                    expired.push(entry.payload);
                }
            }
            expired
        };

        let count = expired.len();
        for payload in expired {
            on_expire(payload);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}
