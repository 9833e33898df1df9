// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Concurrent ordered sets for byte-addressable persistent memory.
//!
//! Two families share one interface ([`DurableSet`]):
//!
//! * the *link-free* list and skip list keep a one-byte commit epoch in every
//!   node and flush lazily, at most once per insert and once per delete;
//! * the *SOFT* list and skip list order every durable write explicitly, so a
//!   node is only reported present once its record is durable.
//!
//! Nodes live in an [`Arena`] whose bytes outlive the structure. After a
//! crash (simulated by dropping the structure) `recover` rebuilds the index
//! from the surviving slots alone.

mod arena;
mod error;
mod hash;
mod linkfree;
mod persist;
mod set;
mod soft;
mod tag;
mod validity;
pub mod workload;

use rand::Rng;

/// Number of tiers in the skip lists.
pub const MAX_LEVEL: usize = 21;

/// Key of the head sentinel. Never accepted as a user key.
pub const MIN_SENTINEL: i64 = i64::MIN;
/// Key of the tail sentinel. Never accepted as a user key.
pub const MAX_SENTINEL: i64 = i64::MAX;

pub use arena::{Arena, ArenaConfig, ArenaHandle, CapacityLimiter, MemoryLimiter, Unlimited};
pub use error::{Error, Result};
pub use hash::{HashTable, DEFAULT_BUCKETS};
pub use linkfree::{LinkFreeList, LinkFreeSkipList};
pub use set::{DurableSet, Recover, RecoveryStats, Value};
pub use soft::{SoftList, SoftSkipList};
pub use tag::State;

#[inline]
pub(crate) fn check_key(key: i64) {
    assert!(
        key != MIN_SENTINEL && key != MAX_SENTINEL,
        "key {key} is reserved for a sentinel"
    );
}

/// Draws a tower height in `1..=MAX_LEVEL`, each extra tier with
/// probability one half.
pub(crate) fn random_level() -> usize {
    let mut rng = rand::thread_rng();
    let mut level = 1;
    while level < MAX_LEVEL && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}
