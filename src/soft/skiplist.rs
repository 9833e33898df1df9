// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use crossbeam_epoch::Guard;
use crossbeam_utils::Backoff;

use super::record::PersistentRecord;
use crate::{
    arena::{Arena, ArenaHandle, MemoryLimiter, Unlimited},
    check_key,
    error::Result,
    random_level,
    set::{check_layout, durable_set_impl, RecoveryStats, Value},
    tag::{AtomicStateLink, State, StateLink},
    MAX_LEVEL, MAX_SENTINEL, MIN_SENTINEL,
};

/// Index node and durable record in one arena slot.
///
/// Tier 0 carries the node's [`State`]. Upper tiers only use `Inserted` and
/// `Deleted`, the latter as a removal mark.
#[repr(C, align(64))]
pub(crate) struct Node {
    record: PersistentRecord,
    polarity: AtomicBool,
    height: AtomicU8,
    next: [AtomicStateLink<Node>; MAX_LEVEL],
}

// Recovery reads `height`, which is only written back with the record's
// cache line.
const _: () = assert!(std::mem::offset_of!(Node, height) < 64);

impl Node {
    fn sentinel(key: i64, next: StateLink<Node>) -> Box<Node> {
        let node = Box::new(Node {
            record: PersistentRecord::default(),
            polarity: AtomicBool::new(false),
            height: AtomicU8::new(MAX_LEVEL as u8),
            next: std::array::from_fn(|_| AtomicStateLink::new(next)),
        });
        node.record.stage(key, 0);
        node
    }

    /// Prepares a slot for linking in `IntendToInsert`. Only volatile-facing
    /// fields are written: the record stays invalid until
    /// [`PersistentRecord::create`].
    fn init(&self, key: i64, value: u64, succs: &[&Node; MAX_LEVEL], height: usize) {
        self.polarity
            .store(self.record.fresh_polarity(), Ordering::Relaxed);
        self.height.store(height as u8, Ordering::Relaxed);
        self.record.stage(key, value);
        for (level, succ) in succs.iter().enumerate() {
            let link = match level {
                0 => StateLink::from_ptr(*succ).with_state(State::IntendToInsert),
                l if l < height => StateLink::from_ptr(*succ),
                _ => StateLink::null(),
            };
            self.next[level].store(link, Ordering::Release);
        }
    }

    fn key(&self) -> i64 {
        self.record.key()
    }

    fn height(&self) -> usize {
        self.height.load(Ordering::Relaxed) as usize
    }

    fn polarity(&self) -> bool {
        self.polarity.load(Ordering::Relaxed)
    }

    fn state(&self) -> State {
        self.next[0].load(Ordering::SeqCst).state()
    }

    fn help_insert(&self) {
        self.record
            .create(self.key(), self.record.value(), self.polarity());
        self.next[0].transition(State::IntendToInsert, State::Inserted);
    }

    /// Marks tiers `height - 1 ..= 1`, top down.
    fn mark_upper_tiers(&self) {
        for level in (1..self.height()).rev() {
            let mut succ = self.next[level].load(Ordering::SeqCst);
            while succ.state() != State::Deleted {
                match self.next[level].compare_exchange(succ, succ.with_state(State::Deleted)) {
                    Ok(_) => break,
                    Err(actual) => succ = actual,
                }
            }
        }
    }

    /// Whether tier `level` of this node is gone. On tier 0 that is the
    /// `Deleted` state, above it the removal mark.
    fn is_unlinked_at(&self, level: usize) -> bool {
        self.next[level].load(Ordering::SeqCst).state() == State::Deleted
    }

    fn slot(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }
}

struct Position<'g> {
    left: [&'g Node; MAX_LEVEL],
    right: [&'g Node; MAX_LEVEL],
}

impl<'g> Position<'g> {
    fn found(&self, key: i64) -> Option<&'g Node> {
        Some(self.right[0]).filter(|n| n.key() == key)
    }
}

/// Skip list whose nodes embed their durable record, so the whole node lives
/// in the arena and recovery needs no separate index allocation.
pub struct SoftSkipList<V: Value = u64, M: MemoryLimiter = Unlimited> {
    head: Box<Node>,
    tail: Box<Node>,
    arena: Arc<Arena<M>>,
    _value: PhantomData<V>,
}

unsafe impl<V: Value, M: MemoryLimiter> Send for SoftSkipList<V, M> {}
unsafe impl<V: Value, M: MemoryLimiter> Sync for SoftSkipList<V, M> {}

impl<V: Value, M: MemoryLimiter> fmt::Debug for SoftSkipList<V, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftSkipList")
            .field("arena", &self.arena)
            .finish()
    }
}

durable_set_impl!(SoftSkipList);

impl<V: Value, M: MemoryLimiter> SoftSkipList<V, M> {
    pub fn slot_layout() -> Layout {
        Layout::new::<Node>()
    }

    pub fn with_arena(arena: Arc<Arena<M>>) -> Result<Self> {
        check_layout(&arena, Self::slot_layout())?;
        let tail = Node::sentinel(MAX_SENTINEL, StateLink::null());
        let head = Node::sentinel(MIN_SENTINEL, StateLink::from_ptr(&*tail));
        Ok(SoftSkipList {
            head,
            tail,
            arena,
            _value: PhantomData,
        })
    }

    pub fn arena(&self) -> &Arc<Arena<M>> {
        &self.arena
    }

    /// Locates `key` on every tier and unlinks the deleted nodes met on the
    /// way. The state bits of each predecessor link are carried over.
    fn find<'g>(&'g self, key: i64, _guard: &'g Guard) -> Position<'g> {
        'retry: loop {
            let mut pos = Position {
                left: [&*self.head; MAX_LEVEL],
                right: [&*self.tail; MAX_LEVEL],
            };
            let mut pred: &Node = &self.head;
            for level in (0..MAX_LEVEL).rev() {
                let mut pred_link = pred.next[level].load(Ordering::SeqCst);
                if pred_link.state() == State::Deleted {
                    // `pred` was removed after we passed it.
                    continue 'retry;
                }
                let mut curr: &Node = unsafe { pred_link.deref() };
                loop {
                    let succ = curr.next[level].load(Ordering::SeqCst);
                    if succ.state() == State::Deleted {
                        let unlinked = succ.clean().with_state(pred_link.state());
                        if pred.next[level]
                            .compare_exchange(pred_link, unlinked)
                            .is_err()
                        {
                            continue 'retry;
                        }
                        pred_link = unlinked;
                        curr = unsafe { succ.deref() };
                        continue;
                    }
                    if curr.key() < key {
                        pred = curr;
                        pred_link = succ;
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

    fn seek<'g>(&'g self, key: i64, _guard: &'g Guard) -> &'g Node {
        let mut pred: &Node = &self.head;
        for level in (1..MAX_LEVEL).rev() {
            loop {
                let curr: &Node = unsafe { pred.next[level].load(Ordering::SeqCst).deref() };
                if curr.key() >= key {
                    break;
                }
                pred = curr;
            }
        }
        let mut curr: &Node = unsafe { pred.next[0].load(Ordering::SeqCst).deref() };
        while curr.key() < key {
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
                if found.state() == State::IntendToInsert {
                    found.help_insert();
                }
                return false;
            }

            let slot = handle.alloc().cast::<Node>();
            let new = unsafe { slot.as_ref() };
            new.init(key, value.into_bits(), &pos.right, height);
            let pred_link = pos.left[0].next[0].load(Ordering::SeqCst);
            if pred_link.state() != State::Deleted
                && pred_link.clean() == StateLink::from_ptr(pos.right[0])
                && pos.left[0].next[0]
                    .compare_exchange(pred_link, StateLink::from_ptr(new).with_state(pred_link.state()))
                    .is_ok()
            {
                break new;
            }
            handle.free(new.slot());
            backoff.spin();
            pos = self.find(key, guard);
        };

        fail::fail_point!("soft_skiplist::insert::linked");
        new.record.create(key, value.into_bits(), new.polarity());
        fail::fail_point!("soft_skiplist::insert::created");
        new.next[0].transition(State::IntendToInsert, State::Inserted);

        'build: for level in 1..height {
            loop {
                let next = new.next[level].load(Ordering::SeqCst);
                if next.state() == State::Deleted {
                    break 'build;
                }
                let succ = StateLink::from_ptr(pos.right[level]);
                if next != succ && new.next[level].compare_exchange(next, succ).is_err() {
                    break 'build;
                }
                if pos.left[level].next[level]
                    .compare_exchange(succ, StateLink::from_ptr(new))
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

        // A concurrent remove may have run its unlinking search before our
        // last tier was linked.
        if new.is_unlinked_at(height - 1) {
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
        if node.state().is_out() {
            return false;
        }

        node.mark_upper_tiers();
        let won = node.next[0].transition(State::Inserted, State::IntendToDelete);
        fail::fail_point!("soft_skiplist::remove::intended");
        node.record.destroy(node.polarity());
        fail::fail_point!("soft_skiplist::remove::destroyed");
        node.next[0].transition(State::IntendToDelete, State::Deleted);
        if won {
            self.find(key, guard);
            // SAFETY: the search above unlinked every tier, and only the
            // winner of the state transition retires.
            unsafe { handle.retire(node.slot(), guard) };
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
        (curr.key() == key && curr.state().is_present()).then(|| V::from_bits(curr.record.value()))
    }

    pub fn keys(&self, handle: &ArenaHandle<M>) -> Vec<i64> {
        let _guard = handle.pin();
        let mut keys = Vec::new();
        let mut node: &Node = unsafe { self.head.next[0].load(Ordering::SeqCst).deref() };
        while !ptr::eq(node, &*self.tail) {
            let next = node.next[0].load(Ordering::SeqCst);
            if next.state().is_present() {
                keys.push(node.key());
            }
            node = unsafe { next.deref() };
        }
        keys
    }

    /// Relinks every node whose record is valid, rebuilding its tower from
    /// the stored height. Everything else is normalized and released.
    pub fn recover(arena: Arc<Arena<M>>) -> Result<(Self, RecoveryStats)> {
        let arena = Arena::reopen(arena)?;
        let list = Self::with_arena(Arc::clone(&arena))?;
        let mut stats = RecoveryStats::default();

        for slot in arena.slots() {
            stats.scanned += 1;
            let node = unsafe { slot.cast::<Node>().as_ref() };
            if node.record.is_valid() {
                list.quick_insert(node);
                stats.recovered += 1;
            } else {
                node.record.normalize();
                tracing::trace!(key = node.key(), "discarding SOFT skip list node");
                stats.discarded += 1;
                arena.release(slot);
            }
        }

        tracing::info!(
            scanned = stats.scanned,
            recovered = stats.recovered,
            discarded = stats.discarded,
            "recovered SOFT skip list"
        );
        Ok((list, stats))
    }

    fn quick_insert(&self, node: &Node) {
        let key = node.key();
        let height = node.height();
        assert!(
            (1..=MAX_LEVEL).contains(&height),
            "corrupt tower height {height} for key {key}"
        );
        node.polarity.store(node.record.polarity(), Ordering::Relaxed);

        let mut pred: &Node = &self.head;
        for level in (0..MAX_LEVEL).rev() {
            let mut curr: &Node = unsafe { pred.next[level].load(Ordering::Relaxed).deref() };
            while curr.key() < key {
                pred = curr;
                curr = unsafe { curr.next[level].load(Ordering::Relaxed).deref() };
            }
            if level == 0 {
                assert!(curr.key() != key, "duplicate key {key} found during recovery");
            }
            if level < height {
                node.next[level].store(StateLink::from_ptr(curr), Ordering::Relaxed);
                pred.next[level].store(StateLink::from_ptr(node), Ordering::Relaxed);
            } else {
                node.next[level].store(StateLink::null(), Ordering::Relaxed);
            }
        }
    }
}
