//! Priority work queue behind the fetch-slot waiters.
//!
//! Ordering contract:
//! - Total ordering on `(priority, id)`; smaller priority values run first.
//! - Equal priorities are processed in insertion order.
//! - Dropping items with `retain` never perturbs the order of the rest.

use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub u64);

#[derive(Debug)]
pub struct WorkQueue<T> {
    next_id: u64,
    ordered: BTreeMap<(i32, WorkId), T>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            ordered: BTreeMap::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn push(&mut self, priority: i32, payload: T) -> WorkId {
        let id = WorkId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.ordered.insert((priority, id), payload);
        id
    }

    /// Pops the next (lowest priority value, then oldest) item.
    pub fn pop_next(&mut self) -> Option<(WorkId, i32, T)> {
        let ((priority, id), payload) = self.ordered.pop_first()?;
        Some((id, priority, payload))
    }

    /// Drops every queued item for which `keep` returns `false`.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.ordered.retain(|_, payload| keep(payload));
    }
}
