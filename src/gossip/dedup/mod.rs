//! A bounded FIFO set of recently observed message IDs, used for
//! gossip loop suppression. `contains`/`insert` are both O(1); once
//! `capacity` is exceeded the oldest id is evicted.
//!
//! Two independent instances exist in the gossip engine: one guards
//! re-broadcast of inbound gossip, the other guards messages received
//! on inbound links, matching the split between `serverReceived` and
//! `clientReceived` in the implementation this crate supersedes.

use std::collections::{HashSet, VecDeque};
use std::hash::BuildHasherDefault;

use twox_hash::XxHash64;
use uuid::Uuid;

type Hasher = BuildHasherDefault<XxHash64>;

/// Bounded FIFO set of [`Uuid`] message ids.
pub struct DedupSet {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid, Hasher>,
}

impl DedupSet {
    /// Spec default: 1000 entries per dedup instance.
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        DedupSet {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity_and_hasher(capacity, Hasher::default()),
        }
    }

    /// Returns `true` if `id` has already been inserted.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    /// Inserts `id`, evicting the oldest entry if the set is now over
    /// capacity. Returns `true` if `id` was newly inserted (i.e. it
    /// was not already present).
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut set = DedupSet::new(4);
        let id = Uuid::new_v4();
        assert!(!set.contains(&id));
        assert!(set.insert(id));
        assert!(set.contains(&id));
    }

    #[test]
    fn duplicate_insert_reports_false() {
        let mut set = DedupSet::new(4);
        let id = Uuid::new_v4();
        assert!(set.insert(id));
        assert!(!set.insert(id));
    }

    #[test]
    fn eviction_at_capacity() {
        let mut set = DedupSet::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        set.insert(a);
        set.insert(b);
        set.insert(c);

        assert!(!set.contains(&a), "oldest entry should have been evicted");
        assert!(set.contains(&b));
        assert!(set.contains(&c));
        assert_eq!(set.len(), 2);
    }
}
