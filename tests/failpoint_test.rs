// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Crash injection: a failpoint panics in the middle of an operation, the
//! structure is dropped and recovered from the written-back arena contents,
//! and the key must be present exactly when the operation had durably
//! completed.

#![cfg(feature = "failpoints")]

mod common;

use std::panic::{self, AssertUnwindSafe};

use durable_sets::{
    ArenaHandle, DurableSet, LinkFreeList, LinkFreeSkipList, Recover, SoftList, SoftSkipList,
};
use fail::FailScenario;

fn prepared<S: Recover<Value = u64>>(set: S) -> S {
    let h = set.handle();
    for k in 1..=3 {
        assert!(set.insert(k, k as u64, &h));
    }
    set
}

/// Runs `op` with `point` configured to panic, then crashes and recovers.
fn crash_at<S, F>(set: S, point: &str, op: F) -> S
where
    S: Recover<Value = u64>,
    F: FnOnce(&S, &ArenaHandle<S::Limiter>) -> bool,
{
    common::init_tracing();
    let h = set.handle();
    fail::cfg(point, "panic").unwrap();
    let res = panic::catch_unwind(AssertUnwindSafe(|| op(&set, &h)));
    fail::remove(point);
    assert!(res.is_err(), "{point} was not reached");
    drop(h);
    common::crash_and_recover(set).0
}

fn check<S: Recover<Value = u64>>(set: &S, expected: &[i64]) {
    assert_eq!(set.keys(&set.handle()), expected);
}

macro_rules! crash_tests {
    (@op $s:ident, $h:ident, insert, $key:literal) => { $s.insert($key, 0, $h) };
    (@op $s:ident, $h:ident, remove, $key:literal) => { $s.remove($key, $h) };
    ($($name:ident: $ty:ty, $point:literal, $op:ident($key:literal) => $expected:expr;)*) => {
        $(
            #[test]
            fn $name() {
                let scenario = FailScenario::setup();
                let set = prepared(<$ty>::new(common::durable_config()).unwrap());
                let set = crash_at(set, $point, |s, h| crash_tests!(@op s, h, $op, $key));
                check(&set, &$expected);
                scenario.teardown();
            }
        )*
    };
}

crash_tests! {
    test_linkfree_list_insert_linked: LinkFreeList<u64>,
        "linkfree_list::insert::linked", insert(10) => [1, 2, 3];
    // The mark is in place but was never flushed.
    test_linkfree_list_remove_marked: LinkFreeList<u64>,
        "linkfree_list::remove::marked", remove(2) => [1, 2, 3];
    test_linkfree_skiplist_insert_linked: LinkFreeSkipList<u64>,
        "linkfree_skiplist::insert::linked", insert(10) => [1, 2, 3];
    test_linkfree_skiplist_remove_marked: LinkFreeSkipList<u64>,
        "linkfree_skiplist::remove::marked", remove(2) => [1, 2, 3];
    test_soft_list_insert_linked: SoftList<u64>,
        "soft_list::insert::linked", insert(10) => [1, 2, 3];
    test_soft_list_insert_created: SoftList<u64>,
        "soft_list::insert::created", insert(10) => [1, 2, 3, 10];
    test_soft_list_remove_intended: SoftList<u64>,
        "soft_list::remove::intended", remove(2) => [1, 2, 3];
    test_soft_list_remove_destroyed: SoftList<u64>,
        "soft_list::remove::destroyed", remove(2) => [1, 3];
    test_soft_skiplist_insert_linked: SoftSkipList<u64>,
        "soft_skiplist::insert::linked", insert(10) => [1, 2, 3];
    test_soft_skiplist_insert_created: SoftSkipList<u64>,
        "soft_skiplist::insert::created", insert(10) => [1, 2, 3, 10];
    test_soft_skiplist_remove_intended: SoftSkipList<u64>,
        "soft_skiplist::remove::intended", remove(2) => [1, 2, 3];
    test_soft_skiplist_remove_destroyed: SoftSkipList<u64>,
        "soft_skiplist::remove::destroyed", remove(2) => [1, 3];
}

#[test]
fn test_soft_list_pending_insert_is_helped() {
    let scenario = FailScenario::setup();
    let set = prepared(SoftList::<u64>::new(common::durable_config()).unwrap());
    let h = set.handle();

    fail::cfg("soft_list::insert::linked", "panic").unwrap();
    let res = panic::catch_unwind(AssertUnwindSafe(|| set.insert(10, 100, &h)));
    fail::remove("soft_list::insert::linked");
    assert!(res.is_err());

    // The stalled insert is not visible until somebody completes it.
    assert!(!set.contains(10, &h));
    assert!(!set.insert(10, 5, &h));
    assert_eq!(set.get(10, &h), Some(100));
    drop(h);

    let (set, _) = common::crash_and_recover(set);
    check(&set, &[1, 2, 3, 10]);
    assert_eq!(set.get(10, &set.handle()), Some(100));
    scenario.teardown();
}

#[test]
fn test_linkfree_reader_commits_stalled_insert() {
    let scenario = FailScenario::setup();
    let set = prepared(LinkFreeList::<u64>::new(common::durable_config()).unwrap());
    let h = set.handle();

    fail::cfg("linkfree_list::insert::linked", "panic").unwrap();
    let res = panic::catch_unwind(AssertUnwindSafe(|| set.insert(10, 100, &h)));
    fail::remove("linkfree_list::insert::linked");
    assert!(res.is_err());

    // Observing the node commits and flushes it on the inserter's behalf.
    assert!(set.contains(10, &h));
    drop(h);

    let (set, _) = common::crash_and_recover(set);
    check(&set, &[1, 2, 3, 10]);
    scenario.teardown();
}

/// A remove stalled after its mark: whoever unlinks the node next writes the
/// mark back, so the removal survives a crash.
fn stalled_remove_completed_by_trim<S: Recover<Value = u64>>(set: S, point: &str) {
    let scenario = FailScenario::setup();
    let set = prepared(set);
    let h = set.handle();

    fail::cfg(point, "panic").unwrap();
    let res = panic::catch_unwind(AssertUnwindSafe(|| set.remove(2, &h)));
    fail::remove(point);
    assert!(res.is_err());

    // `keys` reads without writing anything back.
    assert_eq!(set.keys(&h), vec![1, 3]);
    assert!(set.insert(5, 5, &h));
    drop(h);

    let (set, _) = common::crash_and_recover(set);
    check(&set, &[1, 3, 5]);
    scenario.teardown();
}

#[test]
fn test_linkfree_list_stalled_remove_completed_by_trim() {
    stalled_remove_completed_by_trim(
        LinkFreeList::<u64>::new(common::durable_config()).unwrap(),
        "linkfree_list::remove::marked",
    );
}

#[test]
fn test_linkfree_skiplist_stalled_remove_completed_by_trim() {
    stalled_remove_completed_by_trim(
        LinkFreeSkipList::<u64>::new(common::durable_config()).unwrap(),
        "linkfree_skiplist::remove::marked",
    );
}
