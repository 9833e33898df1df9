// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::{
        atomic::{fence, AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_epoch::Guard;
use crossbeam_utils::Backoff;

use crate::{
    arena::{Arena, ArenaHandle, MemoryLimiter, Unlimited},
    check_key,
    error::Result,
    persist::persist_obj,
    random_level,
    set::{check_layout, durable_set_impl, RecoveryStats, Value},
    tag::{AtomicMarked, Marked},
    validity::ValidityByte,
    MAX_LEVEL, MAX_SENTINEL, MIN_SENTINEL,
};

// Uses C layout to keep the tower at the end of the slot.
#[repr(C, align(64))]
pub(crate) struct Node {
    validity: ValidityByte,
    insert_flushed: AtomicBool,
    delete_flushed: AtomicBool,
    height: u8,
    key: i64,
    value: u64,
    next: [AtomicMarked<Node>; MAX_LEVEL],
}

impl Node {
    fn sentinel(key: i64, next: Marked<Node>) -> Box<Node> {
        Box::new(Node {
            validity: ValidityByte::default(),
            insert_flushed: AtomicBool::new(true),
            delete_flushed: AtomicBool::new(false),
            height: MAX_LEVEL as u8,
            key,
            value: 0,
            next: std::array::from_fn(|_| AtomicMarked::new(next)),
        })
    }

    /// # Safety
    ///
    /// `node` must be a slot owned exclusively by the caller.
    unsafe fn init(node: *mut Node, key: i64, value: u64, succs: &[&Node; MAX_LEVEL], height: usize) {
        (*node).validity.open();
        fence(Ordering::Release);
        ptr::addr_of_mut!((*node).key).write(key);
        ptr::addr_of_mut!((*node).value).write(value);
        ptr::addr_of_mut!((*node).height).write(height as u8);
        (*node).insert_flushed.store(false, Ordering::Relaxed);
        (*node).delete_flushed.store(false, Ordering::Relaxed);
        for (level, succ) in succs.iter().enumerate() {
            let link = if level < height {
                Marked::from_ptr(*succ)
            } else {
                Marked::null()
            };
            (*node).next[level].store(link, Ordering::Release);
        }
    }

    fn height(&self) -> usize {
        self.height as usize
    }

    fn flush_insert(&self) {
        if !self.insert_flushed.load(Ordering::Acquire) {
            persist_obj(self);
            self.insert_flushed.store(true, Ordering::Release);
        }
    }

    fn flush_delete(&self) {
        if !self.delete_flushed.load(Ordering::Acquire) {
            persist_obj(self);
            self.delete_flushed.store(true, Ordering::Release);
        }
    }

    fn is_marked(&self) -> bool {
        self.next[0].load(Ordering::SeqCst).is_marked()
    }

    /// Marks every tier from the top down. Returns whether this call set the
    /// tier-0 mark, i.e. performed the logical deletion.
    fn mark_tower(&self) -> bool {
        for level in (0..self.height()).rev() {
            let mut succ = self.next[level].load(Ordering::SeqCst);
            loop {
                if succ.is_marked() {
                    if level == 0 {
                        return false;
                    }
                    break;
                }
                match self.next[level].compare_exchange(succ, succ.marked()) {
                    Ok(_) => break,
                    Err(actual) => succ = actual,
                }
            }
        }
        true
    }

    fn slot(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }
}

/// A search result: the nodes adjacent to a key on every tier.
struct Position<'g> {
    /// Predecessors, all with a key `< key`.
    left: [&'g Node; MAX_LEVEL],
    /// Successors, all with a key `>= key`.
    right: [&'g Node; MAX_LEVEL],
}

impl<'g> Position<'g> {
    fn found(&self, key: i64) -> Option<&'g Node> {
        Some(self.right[0]).filter(|n| n.key == key)
    }
}

/// Lock-free skip list built on the same node protocol as
/// [`LinkFreeList`](crate::LinkFreeList).
///
/// Tier 0 is the list; higher tiers are shortcuts linked best-effort after the
/// tier-0 CAS.
pub struct LinkFreeSkipList<V: Value = u64, M: MemoryLimiter = Unlimited> {
    head: Box<Node>,
    tail: Box<Node>,
    arena: Arc<Arena<M>>,
    _value: PhantomData<V>,
}

unsafe impl<V: Value, M: MemoryLimiter> Send for LinkFreeSkipList<V, M> {}
unsafe impl<V: Value, M: MemoryLimiter> Sync for LinkFreeSkipList<V, M> {}

impl<V: Value, M: MemoryLimiter> fmt::Debug for LinkFreeSkipList<V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkFreeSkipList")
            .field("arena", &self.arena)
            .finish()
    }
}

durable_set_impl!(LinkFreeSkipList);

impl<V: Value, M: MemoryLimiter> LinkFreeSkipList<V, M> {
    pub fn slot_layout() -> Layout {
        Layout::new::<Node>()
    }

    pub fn with_arena(arena: Arc<Arena<M>>) -> Result<Self> {
        check_layout(&arena, Self::slot_layout())?;
        let tail = Node::sentinel(MAX_SENTINEL, Marked::null());
        let head = Node::sentinel(MIN_SENTINEL, Marked::from_ptr(&*tail));
        Ok(LinkFreeSkipList {
            head,
            tail,
            arena,
            _value: PhantomData,
        })
    }

    pub fn arena(&self) -> &Arc<Arena<M>> {
        &self.arena
    }

    /// Locates `key` on every tier, unlinking marked nodes on the way. A
    /// tier-0 victim is flushed before it is unlinked, and the thread whose
    /// tier-0 CAS unlinks it is not the one that frees it: the remover does,
    /// after its own search.
    fn find<'g>(&'g self, key: i64, _guard: &'g Guard) -> Position<'g> {
        'retry: loop {
            let mut pos = Position {
                left: [&*self.head; MAX_LEVEL],
                right: [&*self.tail; MAX_LEVEL],
            };
            let mut pred: &Node = &self.head;
            for level in (0..MAX_LEVEL).rev() {
                let mut curr: &Node = unsafe { pred.next[level].load(Ordering::SeqCst).deref() };
                loop {
                    let succ = curr.next[level].load(Ordering::SeqCst);
                    if succ.is_marked() {
                        if level == 0 {
                            curr.flush_delete();
                        }
                        if pred.next[level]
                            .compare_exchange(Marked::from_ptr(curr), succ.unmarked())
                            .is_err()
                        {
                            continue 'retry;
                        }
                        curr = unsafe { succ.deref() };
                        continue;
                    }
                    if curr.key < key {
                        pred = curr;
                        curr = unsafe { succ.deref() };
                    } else {
                        break;
                    }
                }
                pos.left[level] = pred;
                pos.right[level] = curr;
            }
            return pos;
        }
    }

    /// Read-only descent to the first tier-0 node with a key `>= key`.
    fn seek<'g>(&'g self, key: i64, _guard: &'g Guard) -> &'g Node {
        let mut pred: &Node = &self.head;
        for level in (1..MAX_LEVEL).rev() {
            loop {
                let curr: &Node = unsafe { pred.next[level].load(Ordering::SeqCst).deref() };
                if curr.key >= key {
                    break;
                }
                pred = curr;
            }
        }
        let mut curr: &Node = unsafe { pred.next[0].load(Ordering::SeqCst).deref() };
        while curr.key < key {
            curr = unsafe { curr.next[0].load(Ordering::SeqCst).deref() };
        }
        curr
    }

    pub fn insert(&self, key: i64, value: V, handle: &ArenaHandle<M>) -> bool {
        check_key(key);
        let guard = &handle.pin();
        let backoff = Backoff::new();
        let height = random_level();
        let mut pos = self.find(key, guard);
        let new: &Node = loop {
            if let Some(found) = pos.found(key) {
                found.validity.commit();
                found.flush_insert();
                return false;
            }

            let slot = handle.alloc().cast::<Node>();
            unsafe { Node::init(slot.as_ptr(), key, value.into_bits(), &pos.right, height) };
            let new = unsafe { slot.as_ref() };
            if pos.left[0].next[0]
                .compare_exchange(Marked::from_ptr(pos.right[0]), Marked::from_ptr(new))
                .is_ok()
            {
                break new;
            }
            new.next[0].store(Marked::null().marked(), Ordering::Relaxed);
            new.validity.commit();
            handle.free(new.slot());
            backoff.spin();
            pos = self.find(key, guard);
        };

        fail::fail_point!("linkfree_skiplist::insert::linked");
        new.validity.commit();
        new.flush_insert();

        'build: for level in 1..height {
            loop {
                let next = new.next[level].load(Ordering::SeqCst);
                if next.is_marked() {
                    break 'build;
                }
                let succ = Marked::from_ptr(pos.right[level]);
                if next != succ && new.next[level].compare_exchange(next, succ).is_err() {
                    // Only a concurrent remover touches our tower.
                    break 'build;
                }
                if pos.left[level].next[level]
                    .compare_exchange(succ, Marked::from_ptr(new))
                    .is_ok()
                {
                    break;
                }
                pos = self.find(key, guard);
                if !ptr::eq(pos.right[0], new) {
                    break 'build;
                }
            }
        }

        // A remover may have unlinked the tower before we finished linking
        // it. Unlink it again before our guard is released.
        if new.next[height - 1].load(Ordering::SeqCst).is_marked() {
            self.find(key, guard);
        }
        true
    }

    pub fn remove(&self, key: i64, handle: &ArenaHandle<M>) -> bool {
        check_key(key);
        let guard = &handle.pin();
        let pos = self.find(key, guard);
        let Some(node) = pos.found(key) else {
            return false;
        };
        node.validity.commit();
        if !node.mark_tower() {
            return false;
        }
        fail::fail_point!("linkfree_skiplist::remove::marked");
        node.flush_delete();
        self.find(key, guard);
        unsafe { handle.retire(node.slot(), guard) };
        true
    }

    pub fn contains(&self, key: i64, handle: &ArenaHandle<M>) -> bool {
        self.get(key, handle).is_some()
    }

    pub fn get(&self, key: i64, handle: &ArenaHandle<M>) -> Option<V> {
        check_key(key);
        let guard = &handle.pin();
        let curr = self.seek(key, guard);
        if curr.key != key {
            return None;
        }
        if curr.is_marked() {
            curr.flush_delete();
            return None;
        }
        curr.validity.commit();
        curr.flush_insert();
        Some(V::from_bits(curr.value))
    }

    pub fn keys(&self, handle: &ArenaHandle<M>) -> Vec<i64> {
        let _guard = handle.pin();
        let mut keys = Vec::new();
        let mut node: &Node = unsafe { self.head.next[0].load(Ordering::SeqCst).deref() };
        while !ptr::eq(node, &*self.tail) {
            let next = node.next[0].load(Ordering::SeqCst);
            if !next.is_marked() {
                keys.push(node.key);
            }
            node = unsafe { next.deref() };
        }
        keys
    }

    /// Rebuilds the skip list, tower heights included, from a previous run's
    /// arena. Slot handling matches [`LinkFreeList::recover`](crate::LinkFreeList::recover).
    pub fn recover(arena: Arc<Arena<M>>) -> Result<(Self, RecoveryStats)> {
        let arena = Arena::reopen(arena)?;
        let list = Self::with_arena(Arc::clone(&arena))?;
        let mut stats = RecoveryStats::default();

        for slot in arena.slots() {
            stats.scanned += 1;
            let node = unsafe { slot.cast::<Node>().as_ref() };
            let next = node.next[0].load(Ordering::Relaxed);
            if !node.validity.is_committed() || next.is_marked() {
                node.next[0].store(Marked::null().marked(), Ordering::Relaxed);
                node.validity.commit();
                persist_obj(node);
                tracing::trace!(key = node.key, "discarding link-free skip list node");
                stats.discarded += 1;
                arena.release(slot);
            } else if next.is_null() {
                stats.untouched += 1;
                arena.release(slot);
            } else {
                list.quick_insert(node);
                stats.recovered += 1;
            }
        }

        tracing::info!(
            scanned = stats.scanned,
            recovered = stats.recovered,
            discarded = stats.discarded,
            "recovered link-free skip list"
        );
        Ok((list, stats))
    }

    fn quick_insert(&self, node: &Node) {
        assert!(
            (1..=MAX_LEVEL).contains(&node.height()),
            "corrupt tower height {} for key {}",
            node.height,
            node.key
        );
        let mut left: [&Node; MAX_LEVEL] = [&*self.head; MAX_LEVEL];
        let mut pred: &Node = &self.head;
        for level in (0..MAX_LEVEL).rev() {
            let mut curr: &Node = unsafe { pred.next[level].load(Ordering::Relaxed).deref() };
            while curr.key < node.key {
                pred = curr;
                curr = unsafe { curr.next[level].load(Ordering::Relaxed).deref() };
            }
            if level == 0 {
                assert!(
                    curr.key != node.key,
                    "duplicate key {} found during recovery",
                    node.key
                );
            }
            left[level] = pred;
        }
        node.insert_flushed.store(true, Ordering::Relaxed);
        node.delete_flushed.store(false, Ordering::Relaxed);
        for (level, pred) in left.iter().enumerate() {
            if level < node.height() {
                node.next[level].store(pred.next[level].load(Ordering::Relaxed), Ordering::Relaxed);
                pred.next[level].store(Marked::from_ptr(node), Ordering::Relaxed);
            } else {
                node.next[level].store(Marked::null(), Ordering::Relaxed);
            }
        }
    }
}
