// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Cache-line write-back for objects that live in the durable arena.
//!
//! Arenas built with [`ArenaConfig::durable_image`](crate::ArenaConfig) also
//! register a shadow copy of each chunk here. Every write-back copies the
//! covered lines into the shadow, so the shadow holds exactly what would
//! survive a power failure.

use std::{
    mem,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        RwLock,
    },
};

const CACHE_LINE_SHIFT: usize = 6;
const CACHE_LINE: usize = 1 << CACHE_LINE_SHIFT;

struct Shadow {
    base: usize,
    len: usize,
    copy: usize,
}

static SHADOWS: RwLock<Vec<Shadow>> = RwLock::new(Vec::new());
static TRACKED: AtomicUsize = AtomicUsize::new(0);

/// Starts mirroring write-backs of `[base, base + len)` into `copy`.
///
/// # Safety
///
/// Both ranges must stay allocated until [`untrack`] is called for `base`,
/// and `copy` must be at least `len` bytes long.
pub(crate) unsafe fn track(base: NonNull<u8>, len: usize, copy: NonNull<u8>) {
    let mut shadows = SHADOWS.write().unwrap_or_else(|e| e.into_inner());
    shadows.push(Shadow {
        base: base.as_ptr() as usize,
        len,
        copy: copy.as_ptr() as usize,
    });
    TRACKED.fetch_add(1, Ordering::Release);
}

pub(crate) fn untrack(base: NonNull<u8>) {
    let mut shadows = SHADOWS.write().unwrap_or_else(|e| e.into_inner());
    let before = shadows.len();
    shadows.retain(|s| s.base != base.as_ptr() as usize);
    TRACKED.fetch_sub(before - shadows.len(), Ordering::Release);
}

/// Copies the lines covering `[start, end)` into whichever shadow holds them.
fn mirror(start: usize, end: usize) {
    let shadows = SHADOWS.read().unwrap_or_else(|e| e.into_inner());
    let Some(shadow) = shadows
        .iter()
        .find(|s| s.base <= start && start < s.base + s.len)
    else {
        return;
    };
    let from = start & !(CACHE_LINE - 1);
    let from = from.max(shadow.base);
    let to = ((end + CACHE_LINE - 1) & !(CACHE_LINE - 1)).min(shadow.base + shadow.len);
    let mut addr = from;
    // Live bytes may be stored to concurrently, so both sides are accessed
    // atomically.
    while addr < to {
        let dst = shadow.copy + (addr - shadow.base);
        if addr % 8 == 0 && addr + 8 <= to {
            // SAFETY: both addresses are inside tracked, 8-aligned ranges.
            unsafe {
                let word = (*(addr as *const AtomicU64)).load(Ordering::Acquire);
                (*(dst as *const AtomicU64)).store(word, Ordering::Release);
            }
            addr += 8;
        } else {
            // SAFETY: both addresses are inside tracked ranges.
            unsafe {
                let byte = (*(addr as *const AtomicU8)).load(Ordering::Acquire);
                (*(dst as *const AtomicU8)).store(byte, Ordering::Release);
            }
            addr += 1;
        }
    }
}

#[cfg(test)]
thread_local! {
    static FLUSHES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Number of `persist` calls issued by the current thread.
#[cfg(test)]
pub(crate) fn flush_count() -> usize {
    FLUSHES.with(|f| f.get())
}

/// Writes back every cache line covering `[ptr, ptr + len)` and fences, so
/// that the bytes are durable once this returns.
#[inline]
pub(crate) fn persist<T: ?Sized>(ptr: *const T, len: usize) {
    #[cfg(test)]
    FLUSHES.with(|f| f.set(f.get() + 1));

    if TRACKED.load(Ordering::Acquire) != 0 {
        let start = ptr as *const u8 as usize;
        mirror(start, start + len);
    }

    #[cfg(not(feature = "no_persist"))]
    {
        let start = ptr as *const u8 as usize;
        let end = start + len;
        let mut line = (start >> CACHE_LINE_SHIFT) << CACHE_LINE_SHIFT;
        while line < end {
            clflush(line as *const u8);
            line += CACHE_LINE;
        }
        sfence();
    }
    #[cfg(feature = "no_persist")]
    let _ = (ptr, len);
}

#[inline]
pub(crate) fn persist_obj<T>(obj: &T) {
    persist(obj as *const T, mem::size_of::<T>())
}

#[cfg(all(not(feature = "no_persist"), target_arch = "x86_64"))]
#[inline(always)]
fn clflush(line: *const u8) {
    // SAFETY: `clflush` only needs a mapped address; sse2 is part of the
    // x86_64 baseline.
    unsafe { std::arch::x86_64::_mm_clflush(line) }
}

#[cfg(all(not(feature = "no_persist"), not(target_arch = "x86_64")))]
#[inline(always)]
fn clflush(_line: *const u8) {}

/// Store fence ordering prior write-backs before later stores.
#[inline(always)]
pub(crate) fn sfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sse is part of the x86_64 baseline.
    unsafe {
        std::arch::x86_64::_mm_sfence()
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
