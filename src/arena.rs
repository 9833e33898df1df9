// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    fmt,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{Collector, Guard, LocalHandle};
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use crate::{
    error::{Error, Result},
    persist,
};

const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
const CHUNK_ALIGN: usize = 64;

pub trait MemoryLimiter: Send + Sync + 'static {
    fn acquire(&self, n: usize) -> bool;
    fn reclaim(&self, n: usize);
    fn mem_usage(&self) -> usize;
}

/// Accepts every request and only keeps count.
#[derive(Debug, Default)]
pub struct Unlimited {
    used: AtomicUsize,
}

impl MemoryLimiter for Unlimited {
    fn acquire(&self, n: usize) -> bool {
        self.used.fetch_add(n, Ordering::Relaxed);
        true
    }

    fn reclaim(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::Relaxed);
    }

    fn mem_usage(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// Refuses chunk acquisitions past a fixed byte budget.
#[derive(Debug)]
pub struct CapacityLimiter {
    capacity: usize,
    used: AtomicUsize,
}

impl CapacityLimiter {
    pub fn new(capacity: usize) -> Self {
        CapacityLimiter {
            capacity,
            used: AtomicUsize::new(0),
        }
    }
}

impl MemoryLimiter for CapacityLimiter {
    fn acquire(&self, n: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|total| *total <= self.capacity)
            })
            .is_ok()
    }

    fn reclaim(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
    }

    fn mem_usage(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes per chunk. Every chunk is carved into equally sized slots.
    pub chunk_size: usize,
    /// Keep a shadow copy of every chunk holding only written-back cache
    /// lines. [`Arena::reopen`] then restores the shadow, dropping every
    /// store that was never flushed. Doubles the memory footprint; meant for
    /// crash testing.
    pub durable_image: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            durable_image: false,
        }
    }
}

impl ArenaConfig {
    /// Checks the config against a slot layout and returns the layout of one
    /// chunk.
    pub fn validate(&self, slot: Layout) -> Result<Layout> {
        if slot.size() == 0 {
            return Err(Error::InvalidConfig("zero-sized slot".to_owned()));
        }
        if self.chunk_size < slot.pad_to_align().size() {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} cannot hold a single {}-byte slot",
                self.chunk_size,
                slot.pad_to_align().size()
            )));
        }
        Layout::from_size_align(self.chunk_size, slot.align().max(CHUNK_ALIGN)).map_err(|e| {
            Error::InvalidConfig(format!("chunk size {}: {e}", self.chunk_size))
        })
    }
}

struct Chunk {
    base: NonNull<u8>,
    len: usize,
    shadow: Option<NonNull<u8>>,
    next: *mut Chunk,
}

/// A fixed-slot allocator whose chunks survive for the lifetime of the
/// arena and can be enumerated after a restart.
///
/// Chunks are zero-initialized, so a slot that was never handed out reads
/// as all zeroes. Released slots are recycled through a shared queue.
/// Slots unlinked from a live structure are released through the arena's
/// epoch collector, only once no pinned thread can still observe them.
pub struct Arena<M: MemoryLimiter = Unlimited> {
    collector: Collector,
    slot: Layout,
    chunk_size: usize,
    chunk_layout: Layout,
    durable_image: bool,
    chunks: AtomicPtr<Chunk>,
    chunk_count: CachePadded<AtomicUsize>,
    released: Arc<SegQueue<usize>>,
    limiter: M,
}

// Chunks are only written through slots handed out to a single owner, and
// the chunk list is push-only.
unsafe impl<M: MemoryLimiter> Send for Arena<M> {}
unsafe impl<M: MemoryLimiter> Sync for Arena<M> {}

impl<M: MemoryLimiter> fmt::Debug for Arena<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("slot", &self.slot)
            .field("chunk_size", &self.chunk_size)
            .field("durable_image", &self.durable_image)
            .field("chunks", &self.chunk_count())
            .field("released", &self.released.len())
            .field("mem_usage", &self.mem_usage())
            .finish()
    }
}

impl<M: MemoryLimiter> Arena<M> {
    pub fn new(slot: Layout, config: ArenaConfig, limiter: M) -> Result<Arc<Self>> {
        let chunk_layout = config.validate(slot)?;
        Ok(Arc::new(Arena {
            collector: Collector::new(),
            slot: slot.pad_to_align(),
            chunk_size: config.chunk_size,
            chunk_layout,
            durable_image: config.durable_image,
            chunks: AtomicPtr::new(ptr::null_mut()),
            chunk_count: CachePadded::new(AtomicUsize::new(0)),
            released: Arc::new(SegQueue::new()),
            limiter,
        }))
    }

    /// Registers a new per-thread allocation handle.
    pub fn handle(self: &Arc<Self>) -> ArenaHandle<M> {
        ArenaHandle {
            local: self.collector.register(),
            arena: Arc::clone(self),
            cursor: Cell::new(0),
            end: Cell::new(0),
        }
    }

    pub fn slot_layout(&self) -> Layout {
        self.slot
    }

    pub fn slots_per_chunk(&self) -> usize {
        self.chunk_size / self.slot.size()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count.load(Ordering::Acquire)
    }

    pub fn mem_usage(&self) -> usize {
        self.limiter.mem_usage()
    }

    pub fn limiter(&self) -> &M {
        &self.limiter
    }

    /// Number of slots currently waiting for reuse.
    pub fn released_len(&self) -> usize {
        self.released.len()
    }

    /// Every chunk ever allocated, as `(base, len)`, newest first.
    pub fn chunks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        let mut cur = self.chunks.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            // SAFETY: chunks are never unlinked before the arena is dropped.
            let chunk = unsafe { &*cur };
            cur = chunk.next;
            Some((chunk.base, chunk.len))
        })
    }

    /// Every slot of every chunk, whether handed out or not.
    pub fn slots(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let slot = self.slot.size();
        let per_chunk = self.slots_per_chunk();
        self.chunks().flat_map(move |(base, _)| {
            (0..per_chunk).map(move |i| {
                // SAFETY: `i * slot` stays inside the chunk.
                unsafe { NonNull::new_unchecked(base.as_ptr().add(i * slot)) }
            })
        })
    }

    /// Puts a slot back on the free queue right away.
    pub fn release(&self, slot: NonNull<u8>) {
        self.released.push(slot.as_ptr() as usize);
    }

    fn grow(&self) -> NonNull<u8> {
        assert!(
            self.limiter.acquire(self.chunk_size),
            "memory limiter refused a {}-byte chunk",
            self.chunk_size
        );

        let base = self.alloc_chunk();
        let shadow = self.durable_image.then(|| {
            let shadow = self.alloc_chunk();
            // SAFETY: both allocations live until the arena is dropped, which
            // untracks them first.
            unsafe { persist::track(base, self.chunk_size, shadow) };
            shadow
        });

        let chunk = Box::into_raw(Box::new(Chunk {
            base,
            len: self.chunk_size,
            shadow,
            next: ptr::null_mut(),
        }));
        let mut head = self.chunks.load(Ordering::Acquire);
        loop {
            // SAFETY: not yet published.
            unsafe { (*chunk).next = head };
            match self
                .chunks
                .compare_exchange_weak(head, chunk, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        let count = self.chunk_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(chunks = count, chunk_size = self.chunk_size, "arena grew");
        base
    }

    fn alloc_chunk(&self) -> NonNull<u8> {
        // SAFETY: the layout was validated to have a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(self.chunk_layout) };
        match NonNull::new(base) {
            Some(base) => base,
            None => alloc::handle_alloc_error(self.chunk_layout),
        }
    }

    /// Whether [`Arena::reopen`] drops stores that were never written back.
    pub fn has_durable_image(&self) -> bool {
        self.durable_image
    }

    /// Simulates a restart of the process that owns this arena: the chunk
    /// bytes stay, everything volatile (epoch state, free-slot queue) is
    /// rebuilt from scratch. With a durable image the chunks are first reset
    /// to their last written-back contents.
    ///
    /// Fails with [`Error::ArenaInUse`] while containers or handles still
    /// reference the arena.
    pub fn reopen(this: Arc<Self>) -> Result<Arc<Self>> {
        let mut arena = Arc::try_unwrap(this).map_err(|a| Error::ArenaInUse(Arc::strong_count(&a) - 1))?;
        arena.collector = Collector::new();
        arena.released = Arc::new(SegQueue::new());
        let mut cur = *arena.chunks.get_mut();
        while !cur.is_null() {
            // SAFETY: we own every chunk exclusively now.
            let chunk = unsafe { &*cur };
            if let Some(shadow) = chunk.shadow {
                unsafe { ptr::copy_nonoverlapping(shadow.as_ptr(), chunk.base.as_ptr(), chunk.len) };
            }
            cur = chunk.next;
        }
        tracing::info!(chunks = arena.chunk_count(), slot = arena.slot.size(), "arena reopened");
        Ok(Arc::new(arena))
    }
}

impl<M: MemoryLimiter> Drop for Arena<M> {
    fn drop(&mut self) {
        let layout = self.chunk_layout;
        let mut cur = *self.chunks.get_mut();
        while !cur.is_null() {
            // SAFETY: we own every chunk exclusively now.
            let chunk = unsafe { Box::from_raw(cur) };
            cur = chunk.next;
            if let Some(shadow) = chunk.shadow {
                persist::untrack(chunk.base);
                unsafe { alloc::dealloc(shadow.as_ptr(), layout) };
            }
            unsafe { alloc::dealloc(chunk.base.as_ptr(), layout) };
            self.limiter.reclaim(chunk.len);
        }
    }
}

/// Per-thread allocation handle. Every container operation takes one.
///
/// A handle bump-allocates from a chunk it grew privately, prefers recycled
/// slots, and carries the thread's registration with the arena's epoch
/// collector.
pub struct ArenaHandle<M: MemoryLimiter = Unlimited> {
    local: LocalHandle,
    arena: Arc<Arena<M>>,
    cursor: Cell<usize>,
    end: Cell<usize>,
}

impl<M: MemoryLimiter> fmt::Debug for ArenaHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("remaining", &((self.end.get() - self.cursor.get()) / self.arena.slot.size()))
            .finish()
    }
}

impl<M: MemoryLimiter> ArenaHandle<M> {
    pub fn arena(&self) -> &Arc<Arena<M>> {
        &self.arena
    }

    pub fn pin(&self) -> Guard {
        self.local.pin()
    }

    /// Hands out one slot. Recycled slots keep their previous bytes, fresh
    /// ones are zeroed.
    pub fn alloc(&self) -> NonNull<u8> {
        if let Some(addr) = self.arena.released.pop() {
            // SAFETY: only non-null slot addresses are ever released.
            return unsafe { NonNull::new_unchecked(addr as *mut u8) };
        }
        let slot = self.arena.slot.size();
        if self.cursor.get() + slot > self.end.get() {
            let base = self.arena.grow().as_ptr() as usize;
            self.cursor.set(base);
            self.end.set(base + self.arena.slots_per_chunk() * slot);
        }
        let addr = self.cursor.get();
        self.cursor.set(addr + slot);
        // SAFETY: inside a live chunk.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Releases a slot that was never published.
    pub fn free(&self, slot: NonNull<u8>) {
        self.arena.release(slot);
    }

    /// Releases an unlinked slot once every thread pinned now has unpinned.
    ///
    /// # Safety
    ///
    /// The slot must be unreachable for threads that pin after this call, and
    /// must be retired at most once.
    pub unsafe fn retire(&self, slot: NonNull<u8>, guard: &Guard) {
        let released = Arc::clone(&self.arena.released);
        let addr = slot.as_ptr() as usize;
        guard.defer_unchecked(move || released.push(addr));
    }
}

impl<M: MemoryLimiter> Drop for ArenaHandle<M> {
    fn drop(&mut self) {
        let slot = self.arena.slot.size();
        let mut addr = self.cursor.get();
        while addr + slot <= self.end.get() {
            self.arena.released.push(addr);
            addr += slot;
        }
    }
}
