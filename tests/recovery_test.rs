// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

mod common;

use std::{collections::BTreeSet, sync::Arc};

use durable_sets::{
    Arena, DurableSet, Error, LinkFreeList, LinkFreeSkipList, Recover, SoftList, SoftSkipList,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Inserts a range, removes the even keys, crashes and recovers: the odd
/// keys with their values must come back.
fn recovers_surviving_keys<S: Recover<Value = u64>>(set: S) {
    common::init_tracing();
    let h = set.handle();
    for k in 0..100 {
        assert!(set.insert(k, k as u64 * 3, &h));
    }
    for k in (0..100).step_by(2) {
        assert!(set.remove(k, &h));
    }
    drop(h);

    let (set, stats) = common::crash_and_recover(set);
    let h = set.handle();
    let odd: Vec<i64> = (1..100).step_by(2).collect();
    assert_eq!(set.keys(&h), odd);
    for &k in &odd {
        assert_eq!(set.get(k, &h), Some(k as u64 * 3));
    }
    assert_eq!(stats.recovered, 50);
    assert_eq!(stats.scanned, set.arena().slots().count());
    assert_eq!(stats.scanned, stats.recovered + stats.discarded + stats.untouched);
}

/// The recovered structure accepts new operations, reuses released slots and
/// survives a second crash.
fn keeps_working_after_recovery<S: Recover<Value = u64>>(set: S) {
    let mut model = BTreeSet::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut set = set;
    for round in 0..3 {
        let h = set.handle();
        for _ in 0..400 {
            let k = rng.gen_range(0..128);
            if rng.gen_bool(0.6) {
                assert_eq!(set.insert(k, k as u64, &h), model.insert(k), "round {round}");
            } else {
                assert_eq!(set.remove(k, &h), model.remove(&k), "round {round}");
            }
        }
        drop(h);
        let chunks = set.arena().chunk_count();
        let (recovered, _) = common::crash_and_recover(set);
        set = recovered;
        assert_eq!(set.keys(&set.handle()), model.iter().copied().collect::<Vec<_>>());
        assert_eq!(set.arena().chunk_count(), chunks);
    }
}

fn empty_arena_recovers_empty<S: Recover<Value = u64>>(set: S) {
    let (set, stats) = common::crash_and_recover(set);
    assert!(set.is_empty(&set.handle()));
    assert_eq!(stats.scanned, 0);
}

fn reopen_requires_sole_owner<S: Recover<Value = u64>>(set: S) {
    let arena = Arc::clone(set.arena());
    let h = set.handle();
    assert!(set.insert(1, 1, &h));
    // The set and the handle still hold the arena.
    assert!(matches!(S::recover(arena), Err(Error::ArenaInUse(_))));
    assert!(set.contains(1, &h));
}

macro_rules! recovery_tests {
    ($($name:ident => $ty:ty;)*) => {
        $(
            mod $name {
                use super::*;

                fn make() -> $ty {
                    <$ty>::new(common::small_config::<$ty>()).unwrap()
                }

                #[test]
                fn test_recovers_surviving_keys() {
                    recovers_surviving_keys(make());
                }

                #[test]
                fn test_keeps_working_after_recovery() {
                    keeps_working_after_recovery(make());
                }

                #[test]
                fn test_empty_arena_recovers_empty() {
                    empty_arena_recovers_empty(make());
                }

                #[test]
                fn test_reopen_requires_sole_owner() {
                    reopen_requires_sole_owner(make());
                }
            }
        )*
    };
}

recovery_tests! {
    linkfree_list => LinkFreeList<u64>;
    linkfree_skiplist => LinkFreeSkipList<u64>;
    soft_list => SoftList<u64>;
    soft_skiplist => SoftSkipList<u64>;
}

#[test]
fn test_recover_into_wrong_container() {
    let list = LinkFreeSkipList::<u64>::new(common::small_config::<LinkFreeSkipList>()).unwrap();
    let arena: Arc<Arena> = Arc::clone(list.arena());
    drop(list);
    assert!(matches!(
        SoftList::<u64>::recover(arena),
        Err(Error::LayoutMismatch { .. })
    ));
}
