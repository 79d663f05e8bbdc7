//! Slot registry for stale-operation detection.
//!
//! # Responsibilities
//! - Hand out a small identity token to every live binding
//! - Mark the token reclaimed once the binding starts closing
//! - Let stack-context operations detect that their token went stale
//!
//! # Design Decisions
//! - Free slots remember the generation at which they were reclaimed;
//!   `allocate` picks the oldest so a just-reclaimed index sits out as long
//!   as possible
//! - Every lease carries a unique number, so a stale token never matches a
//!   later lease of the same index
//! - Exhaustion is not fatal: the caller runs without a token (degraded mode)
//!   and loses stale detection for that binding
//! - The mutex is held only for the scan or the store, never across calls
//!   into the stack

use parking_lot::Mutex;

/// Identity of one lease on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotToken {
    index: usize,
    lease: u64,
}

impl SlotToken {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Free { reclaimed_at: u64 },
    Leased { lease: u64 },
}

#[derive(Debug)]
struct Inner {
    entries: Vec<Entry>,
    next_generation: u64,
    next_lease: u64,
}

/// Fixed-capacity pool of reclaimable slots.
#[derive(Debug)]
pub struct SlotRegistry {
    inner: Mutex<Inner>,
}

impl SlotRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: vec![Entry::Free { reclaimed_at: 0 }; capacity],
                next_generation: 1,
                next_lease: 1,
            }),
        }
    }

    /// Lease the least-recently-reclaimed free slot.
    ///
    /// Returns `None` when every slot is leased.
    pub fn allocate(&self) -> Option<SlotToken> {
        let mut inner = self.inner.lock();

        let mut best: Option<(usize, u64)> = None;
        for (index, entry) in inner.entries.iter().enumerate() {
            if let Entry::Free { reclaimed_at } = *entry {
                if best.map_or(true, |(_, oldest)| reclaimed_at < oldest) {
                    best = Some((index, reclaimed_at));
                }
            }
        }

        let (index, _) = best?;
        let lease = inner.next_lease;
        inner.next_lease += 1;
        inner.entries[index] = Entry::Leased { lease };
        Some(SlotToken { index, lease })
    }

    /// Return a slot to the pool. Returns false if the token was already stale.
    pub fn reclaim(&self, token: SlotToken) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(token.index) {
            Some(Entry::Leased { lease }) if *lease == token.lease => {
                let generation = inner.next_generation;
                inner.next_generation += 1;
                inner.entries[token.index] = Entry::Free { reclaimed_at: generation };
                true
            }
            _ => false,
        }
    }

    /// Whether an operation carrying `token` may touch its raw handle.
    ///
    /// A missing token means the binding runs degraded and is always allowed.
    pub fn is_live(&self, token: Option<SlotToken>) -> bool {
        let Some(token) = token else {
            return true;
        };
        let inner = self.inner.lock();
        matches!(
            inner.entries.get(token.index),
            Some(Entry::Leased { lease }) if *lease == token.lease
        )
    }

    /// Generation at which a free slot was reclaimed. `None` while leased.
    pub fn generation(&self, index: usize) -> Option<u64> {
        match self.inner.lock().entries.get(index) {
            Some(Entry::Free { reclaimed_at }) => Some(*reclaimed_at),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| matches!(e, Entry::Free { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn prefers_oldest_reclaimed_slot() {
        let slots = SlotRegistry::new(3);
        let a = slots.allocate().unwrap();
        let b = slots.allocate().unwrap();
        let c = slots.allocate().unwrap();
        assert!(slots.allocate().is_none());

        assert!(slots.reclaim(b));
        assert!(slots.reclaim(a));

        // b was reclaimed first, so it comes back first.
        let next = slots.allocate().unwrap();
        assert_eq!(next.index(), b.index());
        assert!(slots.reclaim(c));
        assert_eq!(slots.allocate().unwrap().index(), a.index());
    }

    #[test]
    fn stale_token_is_detected_after_reuse() {
        let slots = SlotRegistry::new(1);
        let first = slots.allocate().unwrap();
        assert!(slots.is_live(Some(first)));
        assert!(slots.reclaim(first));
        assert!(!slots.is_live(Some(first)));

        let second = slots.allocate().unwrap();
        assert_eq!(first.index(), second.index());
        assert!(!slots.is_live(Some(first)));
        assert!(slots.is_live(Some(second)));
        assert!(!slots.reclaim(first));
    }

    #[test]
    fn exhaustion_degrades_to_unchecked_operation() {
        // Without a token there is no stale detection at all; operations
        // always proceed. This is a known loss of protection under load.
        let slots = SlotRegistry::new(0);
        assert!(slots.allocate().is_none());
        assert!(slots.is_live(None));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Reclaim(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Allocate), (0usize..16).prop_map(Op::Reclaim)]
    }

    proptest! {
        #[test]
        fn leased_index_is_never_handed_out_twice(capacity in 1usize..8, ops in proptest::collection::vec(op(), 1..200)) {
            let slots = SlotRegistry::new(capacity);
            let mut held: Vec<SlotToken> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => {
                        if let Some(token) = slots.allocate() {
                            let indices: HashSet<usize> = held.iter().map(|t| t.index()).collect();
                            prop_assert!(!indices.contains(&token.index()));
                            held.push(token);
                        } else {
                            prop_assert_eq!(held.len(), capacity);
                        }
                    }
                    Op::Reclaim(pick) => {
                        if held.is_empty() {
                            continue;
                        }
                        let token = held.remove(pick % held.len());
                        let before = (0..capacity).filter_map(|i| slots.generation(i)).max();
                        prop_assert!(slots.reclaim(token));
                        let after = slots.generation(token.index()).unwrap();
                        if let Some(before) = before {
                            prop_assert!(after > before);
                        }
                    }
                }
                prop_assert_eq!(slots.free_count(), capacity - held.len());
            }
        }
    }
}
