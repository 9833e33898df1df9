// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{alloc::Layout, sync::Arc};

use crate::{
    arena::{Arena, ArenaHandle, MemoryLimiter},
    error::Result,
};

/// Payload stored next to each key. Nodes keep it as a raw 64-bit word so
/// that a record has the same layout for every value type.
pub trait Value: Copy + Send + Sync + 'static {
    fn into_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_value {
    ($($t:ty),*) => {
        $(
            impl Value for $t {
                #[inline]
                fn into_bits(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_bits(bits: u64) -> Self {
                    bits as $t
                }
            }
        )*
    };
}

impl_value!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Value for bool {
    fn into_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

impl Value for () {
    fn into_bits(self) -> u64 {
        0
    }

    fn from_bits(_: u64) -> Self {}
}

/// What a recovery pass found in the arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Slots visited.
    pub scanned: usize,
    /// Entries reinserted into the rebuilt index.
    pub recovered: usize,
    /// Half-written, deleted or abandoned records that were normalized and
    /// released.
    pub discarded: usize,
    /// Slots that never held a record.
    pub untouched: usize,
}

/// An ordered set of `i64` keys whose nodes live in an [`Arena`].
///
/// Keys `i64::MIN` and `i64::MAX` are reserved for sentinels; passing one is
/// a programming error and panics.
pub trait DurableSet: Send + Sync + Sized {
    type Value: Value;
    type Limiter: MemoryLimiter;

    /// Layout of one arena slot for this container.
    fn slot_layout() -> Layout;

    /// Builds an empty container over an existing arena.
    fn with_arena(arena: Arc<Arena<Self::Limiter>>) -> Result<Self>;

    fn arena(&self) -> &Arc<Arena<Self::Limiter>>;

    fn handle(&self) -> ArenaHandle<Self::Limiter> {
        self.arena().handle()
    }

    /// Returns `true` if the key was absent and is now present.
    fn insert(&self, key: i64, value: Self::Value, handle: &ArenaHandle<Self::Limiter>) -> bool;

    /// Returns `true` if this call logically deleted the key.
    fn remove(&self, key: i64, handle: &ArenaHandle<Self::Limiter>) -> bool;

    fn contains(&self, key: i64, handle: &ArenaHandle<Self::Limiter>) -> bool;

    fn get(&self, key: i64, handle: &ArenaHandle<Self::Limiter>) -> Option<Self::Value>;

    /// Present keys in ascending order. Only meaningful while no thread is
    /// mutating the set.
    fn keys(&self, handle: &ArenaHandle<Self::Limiter>) -> Vec<i64>;

    fn len(&self, handle: &ArenaHandle<Self::Limiter>) -> usize {
        self.keys(handle).len()
    }

    fn is_empty(&self, handle: &ArenaHandle<Self::Limiter>) -> bool {
        self.len(handle) == 0
    }
}

/// Containers that can be rebuilt from the bytes of a previous run's arena.
pub trait Recover: DurableSet {
    /// Rebuilds the container from `arena`, which must not be shared with
    /// anything else. Runs single-threaded.
    fn recover(arena: Arc<Arena<Self::Limiter>>) -> Result<(Self, RecoveryStats)>;
}

/// Generates the inherent API of a container and forwards [`DurableSet`] and
/// [`Recover`] to it.
macro_rules! durable_set_impl {
    ($ty:ident) => {
        impl<V: $crate::Value> $ty<V, $crate::Unlimited> {
            pub fn new(config: $crate::ArenaConfig) -> $crate::Result<Self> {
                Self::with_limiter(config, $crate::Unlimited::default())
            }
        }

        impl<V: $crate::Value, M: $crate::MemoryLimiter> $ty<V, M> {
            pub fn with_limiter(config: $crate::ArenaConfig, limiter: M) -> $crate::Result<Self> {
                let arena = $crate::Arena::new(Self::slot_layout(), config, limiter)?;
                Self::with_arena(arena)
            }

            pub fn handle(&self) -> $crate::ArenaHandle<M> {
                self.arena.handle()
            }

            pub fn len(&self, handle: &$crate::ArenaHandle<M>) -> usize {
                self.keys(handle).len()
            }

            pub fn is_empty(&self, handle: &$crate::ArenaHandle<M>) -> bool {
                self.len(handle) == 0
            }
        }

        impl<V: $crate::Value, M: $crate::MemoryLimiter> $crate::DurableSet for $ty<V, M> {
            type Value = V;
            type Limiter = M;

            fn slot_layout() -> std::alloc::Layout {
                $ty::<V, M>::slot_layout()
            }

            fn with_arena(arena: std::sync::Arc<$crate::Arena<M>>) -> $crate::Result<Self> {
                $ty::with_arena(arena)
            }

            fn arena(&self) -> &std::sync::Arc<$crate::Arena<M>> {
                $ty::arena(self)
            }

            fn insert(&self, key: i64, value: V, handle: &$crate::ArenaHandle<M>) -> bool {
                $ty::insert(self, key, value, handle)
            }

            fn remove(&self, key: i64, handle: &$crate::ArenaHandle<M>) -> bool {
                $ty::remove(self, key, handle)
            }

            fn contains(&self, key: i64, handle: &$crate::ArenaHandle<M>) -> bool {
                $ty::contains(self, key, handle)
            }

            fn get(&self, key: i64, handle: &$crate::ArenaHandle<M>) -> Option<V> {
                $ty::get(self, key, handle)
            }

            fn keys(&self, handle: &$crate::ArenaHandle<M>) -> Vec<i64> {
                $ty::keys(self, handle)
            }
        }

        impl<V: $crate::Value, M: $crate::MemoryLimiter> $crate::Recover for $ty<V, M> {
            fn recover(
                arena: std::sync::Arc<$crate::Arena<M>>,
            ) -> $crate::Result<(Self, $crate::RecoveryStats)> {
                $ty::recover(arena)
            }
        }
    };
}

pub(crate) use durable_set_impl;

/// Fails with [`crate::Error::LayoutMismatch`] unless `arena` was built for
/// slots of `expected`.
pub(crate) fn check_layout<M: MemoryLimiter>(arena: &Arena<M>, expected: Layout) -> Result<()> {
    let expected = expected.pad_to_align();
    if arena.slot_layout() != expected {
        return Err(crate::Error::LayoutMismatch {
            expected,
            found: arena.slot_layout(),
        });
    }
    Ok(())
}
