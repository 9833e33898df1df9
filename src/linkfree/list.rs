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
    set::{check_layout, durable_set_impl, RecoveryStats, Value},
    tag::{AtomicMarked, Marked},
    validity::ValidityByte,
    MAX_SENTINEL, MIN_SENTINEL,
};

#[repr(C, align(32))]
pub(crate) struct Node {
    validity: ValidityByte,
    insert_flushed: AtomicBool,
    delete_flushed: AtomicBool,
    key: i64,
    value: u64,
    next: AtomicMarked<Node>,
}

impl Node {
    fn sentinel(key: i64, next: Marked<Node>) -> Box<Node> {
        Box::new(Node {
            validity: ValidityByte::default(),
            insert_flushed: AtomicBool::new(true),
            delete_flushed: AtomicBool::new(false),
            key,
            value: 0,
            next: AtomicMarked::new(next),
        })
    }

    /// Initializes a slot for a new incarnation. The validity byte is opened
    /// before any field is touched so that a crash in between reads as
    /// uncommitted.
    ///
    /// # Safety
    ///
    /// `node` must be a slot owned exclusively by the caller.
    unsafe fn init(node: *mut Node, key: i64, value: u64, next: Marked<Node>) {
        (*node).validity.open();
        fence(Ordering::Release);
        ptr::addr_of_mut!((*node).key).write(key);
        ptr::addr_of_mut!((*node).value).write(value);
        (*node).insert_flushed.store(false, Ordering::Relaxed);
        (*node).delete_flushed.store(false, Ordering::Relaxed);
        (*node).next.store(next, Ordering::Release);
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
        self.next.load(Ordering::SeqCst).is_marked()
    }

    fn slot(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }
}

/// Sorted lock-free linked list with Harris-style deletion marks.
///
/// `insert` linearizes at the CAS into the predecessor, `remove` at the CAS
/// that marks the victim's own `next`. A node becomes durable the first time
/// some thread observes it committed and flushes it.
pub struct LinkFreeList<V: Value = u64, M: MemoryLimiter = Unlimited> {
    head: Box<Node>,
    tail: Box<Node>,
    arena: Arc<Arena<M>>,
    _value: PhantomData<V>,
}

unsafe impl<V: Value, M: MemoryLimiter> Send for LinkFreeList<V, M> {}
unsafe impl<V: Value, M: MemoryLimiter> Sync for LinkFreeList<V, M> {}

impl<V: Value, M: MemoryLimiter> fmt::Debug for LinkFreeList<V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkFreeList")
            .field("arena", &self.arena)
            .finish()
    }
}

durable_set_impl!(LinkFreeList);

impl<V: Value, M: MemoryLimiter> LinkFreeList<V, M> {
    pub fn slot_layout() -> Layout {
        Layout::new::<Node>()
    }

    pub fn with_arena(arena: Arc<Arena<M>>) -> Result<Self> {
        check_layout(&arena, Self::slot_layout())?;
        let tail = Node::sentinel(MAX_SENTINEL, Marked::null());
        let head = Node::sentinel(MIN_SENTINEL, Marked::from_ptr(&*tail));
        Ok(LinkFreeList {
            head,
            tail,
            arena,
            _value: PhantomData,
        })
    }

    pub fn arena(&self) -> &Arc<Arena<M>> {
        &self.arena
    }

    fn tail_link(&self) -> Marked<Node> {
        Marked::from_ptr(&*self.tail)
    }

    /// Returns `(pred, curr)` where `curr` is the first unmarked node with a
    /// key `>= key` and `pred` its unmarked predecessor. Marked nodes met on
    /// the way are flushed and unlinked.
    fn find<'g>(&'g self, key: i64, handle: &ArenaHandle<M>, guard: &'g Guard) -> (&'g Node, &'g Node) {
        'retry: loop {
            let mut pred: &Node = &self.head;
            let mut curr: &Node = unsafe { pred.next.load(Ordering::SeqCst).deref() };
            loop {
                let succ = curr.next.load(Ordering::SeqCst);
                if succ.is_marked() {
                    curr.flush_delete();
                    if pred
                        .next
                        .compare_exchange(Marked::from_ptr(curr), succ.unmarked())
                        .is_err()
                    {
                        continue 'retry;
                    }
                    // SAFETY: we performed the unlinking CAS.
                    unsafe { handle.retire(curr.slot(), guard) };
                    curr = unsafe { succ.deref() };
                    continue;
                }
                if curr.key >= key {
                    return (pred, curr);
                }
                pred = curr;
                curr = unsafe { succ.deref() };
            }
        }
    }

    /// Wait-free walk to the first node with a key `>= key`, marked or not.
    fn seek<'g>(&'g self, key: i64, _guard: &'g Guard) -> &'g Node {
        let mut curr: &Node = unsafe { self.head.next.load(Ordering::SeqCst).deref() };
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
            let (pred, curr) = self.find(key, handle, guard);
            if curr.key == key {
                curr.validity.commit();
                curr.flush_insert();
                return false;
            }

            let slot = handle.alloc().cast::<Node>();
            let new = slot.as_ptr();
            unsafe { Node::init(new, key, value.into_bits(), Marked::from_ptr(curr)) };
            match pred
                .next
                .compare_exchange(Marked::from_ptr(curr), Marked::from_ptr(new))
            {
                Ok(_) => {
                    fail::fail_point!("linkfree_list::insert::linked");
                    let new = unsafe { &*new };
                    new.validity.commit();
                    new.flush_insert();
                    return true;
                }
                Err(_) => {
                    // Never published: leave the slot looking deleted.
                    let new = unsafe { &*new };
                    new.next.store(Marked::null().marked(), Ordering::Relaxed);
                    new.validity.commit();
                    handle.free(slot.cast());
                    backoff.spin();
                }
            }
        }
    }

    pub fn remove(&self, key: i64, handle: &ArenaHandle<M>) -> bool {
        check_key(key);
        let guard = &handle.pin();
        loop {
            let (pred, curr) = self.find(key, handle, guard);
            if curr.key != key {
                return false;
            }
            let succ = curr.next.load(Ordering::SeqCst);
            if succ.is_marked() {
                continue;
            }
            curr.validity.commit();
            if curr.next.compare_exchange(succ, succ.marked()).is_err() {
                continue;
            }
            fail::fail_point!("linkfree_list::remove::marked");
            curr.flush_delete();
            if pred
                .next
                .compare_exchange(Marked::from_ptr(curr), succ)
                .is_ok()
            {
                unsafe { handle.retire(curr.slot(), guard) };
            }
            return true;
        }
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
        let mut link = self.head.next.load(Ordering::SeqCst);
        while link != self.tail_link() {
            let node = unsafe { link.deref() };
            let next = node.next.load(Ordering::SeqCst);
            if !next.is_marked() {
                keys.push(node.key);
            }
            link = next.unmarked();
        }
        keys
    }

    /// Rebuilds the list from every slot of a previous run's arena.
    ///
    /// A slot holding a committed, unmarked node is relinked. Uncommitted
    /// and marked slots are normalized to "committed and marked" and
    /// released. Slots that were never written are released as they are.
    pub fn recover(arena: Arc<Arena<M>>) -> Result<(Self, RecoveryStats)> {
        let arena = Arena::reopen(arena)?;
        let list = Self::with_arena(Arc::clone(&arena))?;
        let mut stats = RecoveryStats::default();

        for slot in arena.slots() {
            stats.scanned += 1;
            let node = unsafe { slot.cast::<Node>().as_ref() };
            let next = node.next.load(Ordering::Relaxed);
            if !node.validity.is_committed() || next.is_marked() {
                node.next.store(Marked::null().marked(), Ordering::Relaxed);
                node.validity.commit();
                persist_obj(node);
                tracing::trace!(
                    key = node.key,
                    parity = ?node.validity.load().parity(),
                    "discarding link-free node"
                );
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
            "recovered link-free list"
        );
        Ok((list, stats))
    }

    /// Single-threaded insertion used by recovery. Plain stores only.
    fn quick_insert(&self, node: &Node) {
        let mut pred: &Node = &self.head;
        let mut curr: &Node = unsafe { pred.next.load(Ordering::Relaxed).deref() };
        while curr.key < node.key {
            pred = curr;
            curr = unsafe { curr.next.load(Ordering::Relaxed).deref() };
        }
        assert!(
            curr.key != node.key,
            "duplicate key {} found during recovery",
            node.key
        );
        node.insert_flushed.store(true, Ordering::Relaxed);
        node.delete_flushed.store(false, Ordering::Relaxed);
        node.next.store(Marked::from_ptr(curr), Ordering::Relaxed);
        pred.next.store(Marked::from_ptr(node), Ordering::Relaxed);
    }
}
