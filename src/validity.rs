// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! One-byte commit epoch of the link-free nodes.
//!
//! Bit 7 (`v1`) is flipped when a slot starts a new incarnation, bit 0 (`v2`)
//! is copied from `v1` once the node's fields are fully written and linked.
//! `v1 == v2` therefore means "nothing half-written here".

use std::sync::atomic::{AtomicU8, Ordering};

const V1: u8 = 0x80;
const V2: u8 = 0x01;

/// Decoded form of the epoch byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Validity {
    /// A write to the slot started and has not been committed.
    Uncommitted,
    /// The last write to the slot completed; `parity` is the epoch bit.
    Committed { parity: bool },
}

impl Validity {
    pub(crate) fn decode(byte: u8) -> Validity {
        let v1 = byte & V1 != 0;
        let v2 = byte & V2 != 0;
        if v1 == v2 {
            Validity::Committed { parity: v1 }
        } else {
            Validity::Uncommitted
        }
    }

    pub(crate) fn is_committed(self) -> bool {
        matches!(self, Validity::Committed { .. })
    }

    /// Epoch bit of a committed slot.
    pub(crate) fn parity(self) -> Option<bool> {
        match self {
            Validity::Committed { parity } => Some(parity),
            Validity::Uncommitted => None,
        }
    }
}

#[derive(Debug, Default)]
#[repr(transparent)]
pub(crate) struct ValidityByte(AtomicU8);

impl ValidityByte {
    pub(crate) fn load(&self) -> Validity {
        Validity::decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.load().is_committed()
    }

    /// Starts a new incarnation of the slot. Only the allocating thread calls
    /// this, before the node is published.
    pub(crate) fn open(&self) {
        let old = self.0.load(Ordering::Relaxed);
        self.0.store(old ^ V1, Ordering::Release);
    }

    /// Copies `v1` into `v2`. Idempotent, any thread may call it.
    pub(crate) fn commit(&self) {
        let old = self.0.load(Ordering::Acquire);
        if Validity::decode(old).is_committed() {
            return;
        }
        let v1 = (old & V1) >> 7;
        self.0.store((old & !V2) | v1, Ordering::Release);
    }
}
