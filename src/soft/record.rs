// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::persist::persist_obj;

/// The durable half of an entry.
///
/// Each incarnation of a slot picks a polarity `p`, the complement of the
/// previous `valid_start`. Creation writes `valid_start = p`, then the
/// payload, then `valid_end = p`; destruction writes `deleted = p`. So after a
/// crash:
///
/// * `valid_start != valid_end`: creation was torn;
/// * `valid_start == valid_end != deleted`: created and not destroyed;
/// * `valid_start == valid_end == deleted`: destroyed, or never created.
#[repr(C, align(32))]
#[derive(Debug, Default)]
pub(crate) struct PersistentRecord {
    valid_start: AtomicBool,
    valid_end: AtomicBool,
    deleted: AtomicBool,
    key: AtomicI64,
    value: AtomicU64,
}

impl PersistentRecord {
    /// Polarity for the next incarnation of this slot.
    pub(crate) fn fresh_polarity(&self) -> bool {
        !self.valid_start.load(Ordering::Acquire)
    }

    /// Writes the payload without touching validity.
    pub(crate) fn stage(&self, key: i64, value: u64) {
        self.key.store(key, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
    }

    /// Durably commits the payload. Idempotent for a given incarnation, so
    /// helpers may race with the owner.
    pub(crate) fn create(&self, key: i64, value: u64, polarity: bool) {
        self.valid_start.store(polarity, Ordering::Relaxed);
        fence(Ordering::Release);
        self.stage(key, value);
        self.valid_end.store(polarity, Ordering::Release);
        persist_obj(self);
    }

    pub(crate) fn destroy(&self, polarity: bool) {
        self.deleted.store(polarity, Ordering::Release);
        persist_obj(self);
    }

    pub(crate) fn is_valid(&self) -> bool {
        let start = self.valid_start.load(Ordering::Acquire);
        let end = self.valid_end.load(Ordering::Acquire);
        start == end && end != self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        let start = self.valid_start.load(Ordering::Acquire);
        let end = self.valid_end.load(Ordering::Acquire);
        start == end && end == self.deleted.load(Ordering::Acquire)
    }

    /// Polarity of the incarnation that is currently durable.
    pub(crate) fn polarity(&self) -> bool {
        self.valid_start.load(Ordering::Acquire)
    }

    pub(crate) fn key(&self) -> i64 {
        self.key.load(Ordering::Relaxed)
    }

    pub(crate) fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Turns a torn or destroyed record into a clean "destroyed" one, so the
    /// next incarnation starts from a consistent polarity.
    pub(crate) fn normalize(&self) {
        if self.is_deleted() {
            return;
        }
        let end = self.valid_end.load(Ordering::Relaxed);
        self.valid_start.store(end, Ordering::Relaxed);
        self.deleted.store(end, Ordering::Relaxed);
        persist_obj(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::flush_count;

    #[test]
    fn test_fresh_record_is_deleted() {
        let record = PersistentRecord::default();
        assert!(!record.is_valid());
        assert!(record.is_deleted());
        assert!(record.fresh_polarity());
    }

    #[test]
    fn test_lifecycle() {
        let record = PersistentRecord::default();
        for _ in 0..3 {
            let p = record.fresh_polarity();
            record.create(7, 70, p);
            assert!(record.is_valid());
            assert_eq!((record.key(), record.value()), (7, 70));
            assert_eq!(record.polarity(), p);

            let before = flush_count();
            record.destroy(p);
            assert_eq!(flush_count(), before + 1);
            assert!(!record.is_valid());
            assert!(record.is_deleted());
        }
    }

    #[test]
    fn test_torn_create() {
        let record = PersistentRecord::default();
        let p = record.fresh_polarity();
        // Crash between `valid_start` and `valid_end`.
        record.valid_start.store(p, Ordering::Relaxed);
        record.stage(1, 1);
        assert!(!record.is_valid());
        assert!(!record.is_deleted());

        record.normalize();
        assert!(record.is_deleted());
        // The next incarnation still flips polarity and validates.
        let q = record.fresh_polarity();
        record.create(2, 2, q);
        assert!(record.is_valid());
    }
}
