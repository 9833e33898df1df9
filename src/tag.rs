// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Codecs that pack node state into the low bits of a node address.
//!
//! Every node type is at least 32-byte aligned, so the two lowest address bits
//! are always zero. [`Marked`] borrows bit 0 as a logical-deletion mark,
//! [`StateLink`] uses bits 0 and 1 for a [`State`]. Both come with an atomic
//! cell that stores the packed word in a single `AtomicUsize`, so the state and
//! the link target always change together in one CAS.

use std::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

const MARK_BIT: usize = 0b01;
const STATE_BITS: usize = 0b11;

/// A node address whose bit 0 flags the *owning* node as logically deleted.
pub(crate) struct Marked<T> {
    raw: usize,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for Marked<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Marked<T> {}

impl<T> PartialEq for Marked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Marked<T> {}

impl<T> fmt::Debug for Marked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marked")
            .field("addr", &format_args!("{:#x}", self.raw & !MARK_BIT))
            .field("marked", &self.is_marked())
            .finish()
    }
}

impl<T> Marked<T> {
    pub(crate) const fn null() -> Self {
        Self::from_raw(0)
    }

    const fn from_raw(raw: usize) -> Self {
        Marked {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_ptr(ptr: *const T) -> Self {
        debug_assert_eq!(ptr as usize & MARK_BIT, 0, "node is not aligned");
        Self::from_raw(ptr as usize)
    }

    pub(crate) fn is_null(self) -> bool {
        self.raw & !MARK_BIT == 0
    }

    pub(crate) fn is_marked(self) -> bool {
        self.raw & MARK_BIT == MARK_BIT
    }

    pub(crate) fn marked(self) -> Self {
        Self::from_raw(self.raw | MARK_BIT)
    }

    pub(crate) fn unmarked(self) -> Self {
        Self::from_raw(self.raw & !MARK_BIT)
    }

    pub(crate) fn as_ptr(self) -> *const T {
        (self.raw & !MARK_BIT) as *const T
    }

    /// # Safety
    ///
    /// The address must point at a live node, and the caller must keep the
    /// node from being reclaimed for `'a` (an epoch guard, or exclusive access).
    pub(crate) unsafe fn deref<'a>(self) -> &'a T {
        debug_assert!(!self.is_null());
        &*self.as_ptr()
    }
}

pub(crate) struct AtomicMarked<T> {
    raw: AtomicUsize,
    _marker: PhantomData<*const T>,
}

impl<T> fmt::Debug for AtomicMarked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl<T> AtomicMarked<T> {
    pub(crate) fn new(link: Marked<T>) -> Self {
        AtomicMarked {
            raw: AtomicUsize::new(link.raw),
            _marker: PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> Marked<T> {
        Marked::from_raw(self.raw.load(order))
    }

    pub(crate) fn store(&self, link: Marked<T>, order: Ordering) {
        self.raw.store(link.raw, order)
    }

    pub(crate) fn compare_exchange(
        &self,
        current: Marked<T>,
        new: Marked<T>,
    ) -> Result<Marked<T>, Marked<T>> {
        self.raw
            .compare_exchange(current.raw, new.raw, Ordering::SeqCst, Ordering::SeqCst)
            .map(Marked::from_raw)
            .map_err(Marked::from_raw)
    }
}

/// Life-cycle state of a node in the persistence-aware containers.
///
/// The state of a node is stored in the node's *own* level-0 link, which is
/// why a predecessor's link carries the predecessor's state and not the state
/// of the node it points to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum State {
    Inserted = 0,
    IntendToDelete = 1,
    IntendToInsert = 2,
    Deleted = 3,
}

impl State {
    fn from_bits(bits: usize) -> State {
        match bits & STATE_BITS {
            0 => State::Inserted,
            1 => State::IntendToDelete,
            2 => State::IntendToInsert,
            _ => State::Deleted,
        }
    }

    /// The node has not been linearized as present, or no longer is.
    pub fn is_out(self) -> bool {
        matches!(self, State::IntendToInsert | State::Deleted)
    }

    /// The node's record is durably valid.
    pub fn is_present(self) -> bool {
        matches!(self, State::Inserted | State::IntendToDelete)
    }
}

/// A node address carrying a [`State`] in its two low bits.
pub(crate) struct StateLink<T> {
    raw: usize,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for StateLink<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateLink<T> {}

impl<T> PartialEq for StateLink<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for StateLink<T> {}

impl<T> fmt::Debug for StateLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLink")
            .field("addr", &format_args!("{:#x}", self.raw & !STATE_BITS))
            .field("state", &self.state())
            .finish()
    }
}

impl<T> StateLink<T> {
    pub(crate) const fn null() -> Self {
        Self::from_raw(0)
    }

    const fn from_raw(raw: usize) -> Self {
        StateLink {
            raw,
            _marker: PhantomData,
        }
    }

    /// Link to `ptr` in the [`State::Inserted`] state.
    pub(crate) fn from_ptr(ptr: *const T) -> Self {
        debug_assert_eq!(ptr as usize & STATE_BITS, 0, "node is not aligned");
        Self::from_raw(ptr as usize)
    }

    pub(crate) fn state(self) -> State {
        State::from_bits(self.raw)
    }

    pub(crate) fn with_state(self, state: State) -> Self {
        Self::from_raw((self.raw & !STATE_BITS) | state as usize)
    }

    /// Same address, state bits cleared.
    pub(crate) fn clean(self) -> Self {
        Self::from_raw(self.raw & !STATE_BITS)
    }

    pub(crate) fn is_null(self) -> bool {
        self.raw & !STATE_BITS == 0
    }

    pub(crate) fn as_ptr(self) -> *const T {
        (self.raw & !STATE_BITS) as *const T
    }

    /// # Safety
    ///
    /// Same contract as [`Marked::deref`].
    pub(crate) unsafe fn deref<'a>(self) -> &'a T {
        debug_assert!(!self.is_null());
        &*self.as_ptr()
    }
}

pub(crate) struct AtomicStateLink<T> {
    raw: AtomicUsize,
    _marker: PhantomData<*const T>,
}

impl<T> fmt::Debug for AtomicStateLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl<T> AtomicStateLink<T> {
    pub(crate) fn new(link: StateLink<T>) -> Self {
        AtomicStateLink {
            raw: AtomicUsize::new(link.raw),
            _marker: PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> StateLink<T> {
        StateLink::from_raw(self.raw.load(order))
    }

    pub(crate) fn store(&self, link: StateLink<T>, order: Ordering) {
        self.raw.store(link.raw, order)
    }

    pub(crate) fn compare_exchange(
        &self,
        current: StateLink<T>,
        new: StateLink<T>,
    ) -> Result<StateLink<T>, StateLink<T>> {
        self.raw
            .compare_exchange(current.raw, new.raw, Ordering::SeqCst, Ordering::SeqCst)
            .map(StateLink::from_raw)
            .map_err(StateLink::from_raw)
    }

    /// Swaps `expected` for `new` while keeping the address bits.
    ///
    /// Fails if the state is not `expected`, or if the address changed between
    /// the read and the CAS.
    pub(crate) fn cas_state(&self, expected: State, new: State) -> bool {
        let current = self.load(Ordering::SeqCst);
        if current.state() != expected {
            return false;
        }
        self.compare_exchange(current, current.with_state(new))
            .is_ok()
    }

    /// Drives the state from `from` to `to`, retrying while it still reads
    /// `from`. Returns whether this call performed the transition; when it
    /// returns `false` some other thread moved the state on.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        while self.load(Ordering::SeqCst).state() == from {
            if self.cas_state(from, to) {
                return true;
            }
        }
        false
    }
}
