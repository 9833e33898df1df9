// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::{atomic::Ordering, Arc},
};

use crossbeam_epoch::{Guard, Shared};
use crossbeam_utils::Backoff;

use super::record::PersistentRecord;
use crate::{
    arena::{Arena, ArenaHandle, MemoryLimiter, Unlimited},
    check_key,
    error::Result,
    set::{check_layout, durable_set_impl, RecoveryStats, Value},
    tag::{AtomicStateLink, State, StateLink},
    MAX_SENTINEL, MIN_SENTINEL,
};

/// In-memory index node. Caches the key and value of its record and the
/// polarity the record was (or will be) created with.
#[repr(align(32))]
struct VNode {
    key: i64,
    value: u64,
    record: *const PersistentRecord,
    polarity: bool,
    /// Successor, tagged with *this* node's state.
    next: AtomicStateLink<VNode>,
}

impl VNode {
    fn sentinel(key: i64, next: StateLink<VNode>) -> Box<VNode> {
        Box::new(VNode {
            key,
            value: 0,
            record: ptr::null(),
            polarity: false,
            next: AtomicStateLink::new(next),
        })
    }

    fn state(&self) -> State {
        self.next.load(Ordering::SeqCst).state()
    }

    fn record(&self) -> &PersistentRecord {
        debug_assert!(!self.record.is_null());
        // SAFETY: a record outlives the node that owns it.
        unsafe { &*self.record }
    }

    /// Completes a pending insertion: makes the record durable and moves the
    /// node to `Inserted`. Safe to run from any thread, any number of times.
    fn help_insert(&self) {
        self.record().create(self.key, self.value, self.polarity);
        self.next.transition(State::IntendToInsert, State::Inserted);
    }
}

/// Sorted lock-free list of volatile nodes, each owning one
/// [`PersistentRecord`] slot in the arena.
///
/// Only the records are durable. Recovery rebuilds the volatile nodes from
/// the valid records.
pub struct SoftList<V: Value = u64, M: MemoryLimiter = Unlimited> {
    head: Box<VNode>,
    tail: Box<VNode>,
    arena: Arc<Arena<M>>,
    _value: PhantomData<V>,
}

unsafe impl<V: Value, M: MemoryLimiter> Send for SoftList<V, M> {}
unsafe impl<V: Value, M: MemoryLimiter> Sync for SoftList<V, M> {}

impl<V: Value, M: MemoryLimiter> fmt::Debug for SoftList<V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftList").field("arena", &self.arena).finish()
    }
}

durable_set_impl!(SoftList);

impl<V: Value, M: MemoryLimiter> SoftList<V, M> {
    pub fn slot_layout() -> Layout {
        Layout::new::<PersistentRecord>()
    }

    pub fn with_arena(arena: Arc<Arena<M>>) -> Result<Self> {
        check_layout(&arena, Self::slot_layout())?;
        let tail = VNode::sentinel(MAX_SENTINEL, StateLink::null());
        let head = VNode::sentinel(MIN_SENTINEL, StateLink::from_ptr(&*tail));
        Ok(SoftList {
            head,
            tail,
            arena,
            _value: PhantomData,
        })
    }

    pub fn arena(&self) -> &Arc<Arena<M>> {
        &self.arena
    }

    /// Returns `(pred, pred_state, curr)`: `curr` is the first node with a key
    /// `>= key` that is not `Deleted`. Deleted nodes are unlinked on the way.
    fn find<'g>(&'g self, key: i64, handle: &ArenaHandle<M>, guard: &'g Guard) -> (&'g VNode, State, &'g VNode) {
        'retry: loop {
            let mut pred: &VNode = &self.head;
            let mut pred_state = State::Inserted;
            let mut curr: &VNode = unsafe { pred.next.load(Ordering::SeqCst).deref() };
            loop {
                let succ = curr.next.load(Ordering::SeqCst);
                if succ.state() == State::Deleted {
                    if !self.trim(pred, pred_state, curr, handle, guard) {
                        continue 'retry;
                    }
                } else {
                    if curr.key >= key {
                        return (pred, pred_state, curr);
                    }
                    pred = curr;
                    pred_state = succ.state();
                }
                curr = unsafe { succ.deref() };
            }
        }
    }

    /// Unlinks `curr` from `pred`, keeping `pred`'s state, and retires both
    /// halves of `curr` on success.
    fn trim(&self, pred: &VNode, pred_state: State, curr: &VNode, handle: &ArenaHandle<M>, guard: &Guard) -> bool {
        let succ = curr.next.load(Ordering::SeqCst).clean();
        let expected = StateLink::from_ptr(curr).with_state(pred_state);
        if pred
            .next
            .compare_exchange(expected, succ.with_state(pred_state))
            .is_err()
        {
            return false;
        }
        // SAFETY: our CAS made `curr` unreachable.
        unsafe {
            handle.retire(NonNull::from(curr.record()).cast(), guard);
            guard.defer_destroy(Shared::from(curr as *const VNode));
        }
        true
    }

    /// Read-only walk to the first node with a key `>= key`.
    fn seek<'g>(&'g self, key: i64, _guard: &'g Guard) -> &'g VNode {
        let mut curr: &VNode = unsafe { self.head.next.load(Ordering::SeqCst).deref() };
        while curr.key < key {
            curr = unsafe { curr.next.load(Ordering::SeqCst).deref() };
        }
        curr
    }

    pub fn insert(&self, key: i64, value: V, handle: &ArenaHandle<M>) -> bool {
        check_key(key);
        let guard = &handle.pin();
        let backoff = Backoff::new();
        loop {
            let (pred, pred_state, curr) = self.find(key, handle, guard);
            if curr.key == key {
                if curr.state() == State::IntendToInsert {
                    curr.help_insert();
                }
                return false;
            }

            let slot = handle.alloc().cast::<PersistentRecord>();
            let record = unsafe { slot.as_ref() };
            let node = Box::into_raw(Box::new(VNode {
                key,
                value: value.into_bits(),
                record,
                polarity: record.fresh_polarity(),
                next: AtomicStateLink::new(StateLink::from_ptr(curr).with_state(State::IntendToInsert)),
            }));
            let expected = StateLink::from_ptr(curr).with_state(pred_state);
            match pred
                .next
                .compare_exchange(expected, StateLink::from_ptr(node).with_state(pred_state))
            {
                Ok(_) => {
                    fail::fail_point!("soft_list::insert::linked");
                    let node = unsafe { &*node };
                    node.record().create(key, node.value, node.polarity);
                    fail::fail_point!("soft_list::insert::created");
                    node.next.transition(State::IntendToInsert, State::Inserted);
                    return true;
                }
                Err(_) => {
                    // SAFETY: never published.
                    drop(unsafe { Box::from_raw(node) });
                    handle.free(slot.cast());
                    backoff.spin();
                }
            }
        }
    }

    pub fn remove(&self, key: i64, handle: &ArenaHandle<M>) -> bool {
        check_key(key);
        let guard = &handle.pin();
        let (pred, pred_state, curr) = self.find(key, handle, guard);
        if curr.key != key || curr.state().is_out() {
            return false;
        }

        let won = curr.next.transition(State::Inserted, State::IntendToDelete);
        fail::fail_point!("soft_list::remove::intended");
        curr.record().destroy(curr.polarity);
        fail::fail_point!("soft_list::remove::destroyed");
        curr.next.transition(State::IntendToDelete, State::Deleted);
        if won {
            self.trim(pred, pred_state, curr, handle, guard);
        }
        won
    }

    pub fn contains(&self, key: i64, handle: &ArenaHandle<M>) -> bool {
        self.get(key, handle).is_some()
    }

    pub fn get(&self, key: i64, handle: &ArenaHandle<M>) -> Option<V> {
        check_key(key);
        let guard = &handle.pin();
        let curr = self.seek(key, guard);
        (curr.key == key && curr.state().is_present()).then(|| V::from_bits(curr.value))
    }

    pub fn keys(&self, handle: &ArenaHandle<M>) -> Vec<i64> {
        let _guard = handle.pin();
        let mut keys = Vec::new();
        let mut node: &VNode = unsafe { self.head.next.load(Ordering::SeqCst).deref() };
        while !ptr::eq(node, &*self.tail) {
            let next = node.next.load(Ordering::SeqCst);
            if next.state().is_present() {
                keys.push(node.key);
            }
            node = unsafe { next.deref() };
        }
        keys
    }

    /// Rebuilds the volatile index from the valid records of a previous
    /// run's arena. Every other record is normalized and released.
    pub fn recover(arena: Arc<Arena<M>>) -> Result<(Self, RecoveryStats)> {
        let arena = Arena::reopen(arena)?;
        let list = Self::with_arena(Arc::clone(&arena))?;
        let mut stats = RecoveryStats::default();

        for slot in arena.slots() {
            stats.scanned += 1;
            let record = unsafe { slot.cast::<PersistentRecord>().as_ref() };
            if record.is_valid() {
                list.quick_insert(record);
                stats.recovered += 1;
            } else {
                record.normalize();
                tracing::trace!(key = record.key(), "discarding SOFT record");
                stats.discarded += 1;
                arena.release(slot);
            }
        }

        tracing::info!(
            scanned = stats.scanned,
            recovered = stats.recovered,
            discarded = stats.discarded,
            "recovered SOFT list"
        );
        Ok((list, stats))
    }

    fn quick_insert(&self, record: &PersistentRecord) {
        let key = record.key();
        let mut pred: &VNode = &self.head;
        let mut curr: &VNode = unsafe { pred.next.load(Ordering::Relaxed).deref() };
        while curr.key < key {
            pred = curr;
            curr = unsafe { curr.next.load(Ordering::Relaxed).deref() };
        }
        assert!(curr.key != key, "duplicate key {key} found during recovery");
        let node = Box::into_raw(Box::new(VNode {
            key,
            value: record.value(),
            record,
            polarity: record.polarity(),
            next: AtomicStateLink::new(StateLink::from_ptr(curr)),
        }));
        pred.next.store(StateLink::from_ptr(node), Ordering::Relaxed);
    }
}

impl<V: Value, M: MemoryLimiter> Drop for SoftList<V, M> {
    fn drop(&mut self) {
        let mut link = self.head.next.load(Ordering::Relaxed);
        while !ptr::eq(link.as_ptr(), &*self.tail) {
            // SAFETY: every node still linked was allocated by `insert` or
            // `quick_insert` and is owned by the list alone now.
            let node = unsafe { Box::from_raw(link.as_ptr() as *mut VNode) };
            link = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persist::{flush_count, persist_obj},
        ArenaConfig,
    };

    fn small() -> ArenaConfig {
        ArenaConfig {
            chunk_size: 64 * std::mem::size_of::<PersistentRecord>(),
            durable_image: true,
        }
    }

    #[test]
    fn test_basic() {
        let list = SoftList::<u64>::new(small()).unwrap();
        let h = list.handle();
        assert!(list.insert(5, 1, &h));
        assert!(!list.insert(5, 2, &h));
        assert_eq!(list.get(5, &h), Some(1));
        assert!(list.remove(5, &h));
        assert!(!list.contains(5, &h));
        assert!(!list.remove(5, &h));
    }

    #[test]
    fn test_flushes_per_operation() {
        let list = SoftList::<u64>::new(small()).unwrap();
        let h = list.handle();
        let before = flush_count();
        assert!(list.insert(1, 1, &h));
        assert_eq!(flush_count(), before + 1);
        assert!(list.contains(1, &h));
        assert!(!list.insert(1, 1, &h));
        assert_eq!(flush_count(), before + 1);
        assert!(list.remove(1, &h));
        assert_eq!(flush_count(), before + 2);
    }

    #[test]
    fn test_help_pending_insert() {
        let list = SoftList::<u64>::new(small()).unwrap();
        let h = list.handle();
        assert!(list.insert(10, 0, &h));

        // Link a node the way `insert` does and stop before its record is
        // created.
        let guard = &h.pin();
        let (pred, pred_state, curr) = list.find(20, &h, guard);
        let slot = h.alloc().cast::<PersistentRecord>();
        let record = unsafe { slot.as_ref() };
        let node = Box::into_raw(Box::new(VNode {
            key: 20,
            value: 200,
            record,
            polarity: record.fresh_polarity(),
            next: AtomicStateLink::new(StateLink::from_ptr(curr).with_state(State::IntendToInsert)),
        }));
        pred.next
            .store(StateLink::from_ptr(node).with_state(pred_state), Ordering::SeqCst);

        assert!(!list.contains(20, &h));
        assert!(!list.remove(20, &h));
        assert!(!record.is_valid());

        // A second insert of the key completes the first one.
        assert!(!list.insert(20, 999, &h));
        assert!(record.is_valid());
        assert_eq!(list.get(20, &h), Some(200));
        assert_eq!(list.keys(&h), vec![10, 20]);
    }

    #[test]
    fn test_recover() {
        let list = SoftList::<u64>::new(small()).unwrap();
        let h = list.handle();
        for k in 0..20 {
            assert!(list.insert(k, k as u64 + 100, &h));
        }
        // A slot whose payload was written back but never validated.
        let torn = unsafe { h.alloc().cast::<PersistentRecord>().as_ref() };
        torn.stage(500, 0);
        persist_obj(torn);
        for k in (0..20).filter(|k| k % 3 == 0) {
            assert!(list.remove(k, &h));
        }
        drop(h);
        let arena = Arc::clone(list.arena());
        drop(list);

        let (list, stats) = SoftList::<u64>::recover(arena).unwrap();
        let h = list.handle();
        let expected: Vec<i64> = (0..20).filter(|k| k % 3 != 0).collect();
        assert_eq!(list.keys(&h), expected);
        assert_eq!(list.get(4, &h), Some(104));
        assert_eq!(stats.recovered, expected.len());
        assert_eq!(stats.scanned, 64);
        assert_eq!(stats.discarded, 64 - expected.len());

        assert!(list.insert(3, 3, &h));
        assert!(list.remove(4, &h));
        assert!(!list.contains(500, &h));
    }

    #[test]
    fn test_linked_node_without_record_is_lost() {
        let list = SoftList::<u64>::new(small()).unwrap();
        let h = list.handle();
        assert!(list.insert(1, 10, &h));
        assert!(list.insert(2, 20, &h));
        assert!(list.remove(1, &h));

        // Linked and moved to `Inserted` without its record ever being
        // created: invisible after a crash.
        {
            let guard = &h.pin();
            let (pred, pred_state, curr) = list.find(3, &h, guard);
            let record = unsafe { h.alloc().cast::<PersistentRecord>().as_ref() };
            let node = Box::into_raw(Box::new(VNode {
                key: 3,
                value: 30,
                record,
                polarity: record.fresh_polarity(),
                next: AtomicStateLink::new(StateLink::from_ptr(curr)),
            }));
            pred.next
                .store(StateLink::from_ptr(node).with_state(pred_state), Ordering::SeqCst);
        }
        assert_eq!(list.keys(&h), vec![2, 3]);
        drop(h);

        let arena = Arc::clone(list.arena());
        drop(list);
        let (list, _) = SoftList::<u64>::recover(arena).unwrap();
        let h = list.handle();
        assert_eq!(list.keys(&h), vec![2]);
        assert_eq!(list.get(2, &h), Some(20));
    }
}
