//! Live streams by id, plus a bounded memory of ids this side reset.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::StreamId;

struct Inner<S> {
    streams: HashMap<StreamId, Arc<S>>,
    reset_ids: HashSet<StreamId>,
    reset_order: VecDeque<StreamId>,
}

/// Thread-safe stream map.
///
/// Handlers are never called with the table locked: lookups clone the `Arc`
/// out and release the lock first.
pub(crate) struct StreamTable<S> {
    inner: Mutex<Inner<S>>,
    reset_memory: usize,
}

impl<S> StreamTable<S> {
    pub fn new(reset_memory: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                reset_ids: HashSet::new(),
                reset_order: VecDeque::new(),
            }),
            reset_memory,
        }
    }

    pub fn insert(&self, id: StreamId, stream: Arc<S>) {
        self.lock().streams.insert(id, stream);
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<S>> {
        self.lock().streams.get(&id).cloned()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.lock().streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// Forget a stream. Ids reset by this side are remembered so late
    /// frames for them can be dropped quietly.
    pub fn remove(&self, id: StreamId, reset_locally: bool) -> Option<Arc<S>> {
        let mut inner = self.lock();
        let removed = inner.streams.remove(&id);
        if reset_locally && self.reset_memory > 0 && inner.reset_ids.insert(id) {
            inner.reset_order.push_back(id);
            while inner.reset_order.len() > self.reset_memory {
                if let Some(oldest) = inner.reset_order.pop_front() {
                    inner.reset_ids.remove(&oldest);
                }
            }
        }
        removed
    }

    pub fn was_reset_locally(&self, id: StreamId) -> bool {
        self.lock().reset_ids.contains(&id)
    }

    /// Remove every stream whose id matches `pred`.
    pub fn remove_where(&self, pred: impl Fn(StreamId) -> bool) -> Vec<Arc<S>> {
        let mut inner = self.lock();
        let ids: Vec<StreamId> = inner.streams.keys().copied().filter(|id| pred(*id)).collect();
        ids.iter()
            .filter_map(|id| inner.streams.remove(id))
            .collect()
    }

    /// Empty the table.
    pub fn drain(&self) -> Vec<Arc<S>> {
        self.lock().streams.drain().map(|(_, stream)| stream).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = StreamTable::new(4);
        table.insert(1, Arc::new("one"));
        table.insert(3, Arc::new("three"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(3).as_deref(), Some(&"three"));
        assert!(table.remove(3, false).is_some());
        assert!(!table.contains(3));
        assert!(!table.was_reset_locally(3));
    }

    #[test]
    fn test_reset_memory_is_bounded() {
        let table: StreamTable<()> = StreamTable::new(2);
        table.remove(1, true);
        table.remove(3, true);
        table.remove(5, true);

        assert!(!table.was_reset_locally(1));
        assert!(table.was_reset_locally(3));
        assert!(table.was_reset_locally(5));
    }

    #[test]
    fn test_zero_reset_memory() {
        let table: StreamTable<()> = StreamTable::new(0);
        table.remove(1, true);
        assert!(!table.was_reset_locally(1));
    }

    #[test]
    fn test_remove_where_and_drain() {
        let table = StreamTable::new(4);
        for id in 1..=6 {
            table.insert(id, Arc::new(id));
        }

        let mut odd: Vec<u32> = table
            .remove_where(|id| id % 2 == 1)
            .iter()
            .map(|s| **s)
            .collect();
        odd.sort_unstable();
        assert_eq!(odd, vec![1, 3, 5]);

        assert_eq!(table.drain().len(), 3);
        assert_eq!(table.len(), 0);
    }
}
