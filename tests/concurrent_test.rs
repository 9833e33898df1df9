// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

mod common;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use durable_sets::{
    workload::{self, Workload},
    ArenaConfig, DurableSet, HashTable, LinkFreeList, LinkFreeSkipList, Recover, SoftList,
    SoftSkipList, Unlimited,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const THREADS: usize = 8;

fn assert_sorted_unique(keys: &[i64]) {
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "{} before {}", pair[0], pair[1]);
    }
}

fn random_ops_stay_sorted<S: DurableSet<Value = u64>>(set: S) {
    common::init_tracing();
    thread::scope(|s| {
        for tid in 0..THREADS {
            let set = &set;
            s.spawn(move || {
                let h = set.handle();
                let mut rng = StdRng::seed_from_u64(tid as u64);
                for _ in 0..5_000 {
                    let k = rng.gen_range(0..256);
                    match rng.gen_range(0..10) {
                        0..=3 => {
                            set.insert(k, tid as u64, &h);
                        }
                        4..=7 => {
                            set.remove(k, &h);
                        }
                        _ => {
                            set.contains(k, &h);
                        }
                    }
                }
            });
        }
    });
    let h = set.handle();
    let keys = set.keys(&h);
    assert_sorted_unique(&keys);
    for k in 0..256 {
        assert_eq!(set.contains(k, &h), keys.binary_search(&k).is_ok());
    }
}

fn disjoint_inserts_all_land<S: DurableSet<Value = u64>>(set: S) {
    thread::scope(|s| {
        for tid in 0..THREADS as i64 {
            let set = &set;
            s.spawn(move || {
                let h = set.handle();
                for i in 0..300 {
                    assert!(set.insert(i * THREADS as i64 + tid, 0, &h));
                }
            });
        }
    });
    let h = set.handle();
    assert_eq!(set.keys(&h), (0..300 * THREADS as i64).collect::<Vec<_>>());
}

fn each_key_removed_once<S: DurableSet<Value = u64>>(set: S) {
    let h = set.handle();
    for k in 0..500 {
        assert!(set.insert(k, 0, &h));
    }
    let wins = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..THREADS {
            let (set, wins) = (&set, &wins);
            s.spawn(move || {
                let h = set.handle();
                for k in 0..500 {
                    if set.remove(k, &h) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    assert_eq!(wins.load(Ordering::Relaxed), 500);
    assert!(set.is_empty(&h));
}

/// After a concurrent run has quiesced, recovery returns exactly the keys the
/// structure reported.
fn quiesced_run_recovers<S: Recover<Value = u64>>(set: S) {
    let w = Workload {
        threads: 4,
        duration: Duration::from_millis(200),
        read_ratio: 20,
        key_range: 512,
    };
    let report = workload::run(&set, &w).unwrap();
    assert!(report.total_ops > 0);
    let before = set.keys(&set.handle());
    assert_sorted_unique(&before);

    let (set, stats) = common::crash_and_recover(set);
    assert_eq!(set.keys(&set.handle()), before);
    assert_eq!(stats.recovered, before.len());
}

macro_rules! concurrent_tests {
    ($($name:ident => $make:expr;)*) => {
        $(
            mod $name {
                use super::*;

                #[test]
                fn test_random_ops_stay_sorted() {
                    random_ops_stay_sorted($make);
                }

                #[test]
                fn test_disjoint_inserts_all_land() {
                    disjoint_inserts_all_land($make);
                }

                #[test]
                fn test_each_key_removed_once() {
                    each_key_removed_once($make);
                }
            }
        )*
    };
}

concurrent_tests! {
    linkfree_list => LinkFreeList::<u64>::new(ArenaConfig::default()).unwrap();
    linkfree_skiplist => LinkFreeSkipList::<u64>::new(ArenaConfig::default()).unwrap();
    soft_list => SoftList::<u64>::new(ArenaConfig::default()).unwrap();
    soft_skiplist => SoftSkipList::<u64>::new(ArenaConfig::default()).unwrap();
    linkfree_hash => HashTable::<LinkFreeList>::new(16, ArenaConfig::default(), Unlimited::default()).unwrap();
    soft_hash => HashTable::<SoftList>::new(16, ArenaConfig::default(), Unlimited::default()).unwrap();
}

#[test]
fn test_quiesced_run_recovers_linkfree_list() {
    quiesced_run_recovers(LinkFreeList::<u64>::new(common::durable_config()).unwrap());
}

#[test]
fn test_quiesced_run_recovers_linkfree_skiplist() {
    quiesced_run_recovers(LinkFreeSkipList::<u64>::new(common::durable_config()).unwrap());
}

#[test]
fn test_quiesced_run_recovers_soft_list() {
    quiesced_run_recovers(SoftList::<u64>::new(common::durable_config()).unwrap());
}

#[test]
fn test_quiesced_run_recovers_soft_skiplist() {
    quiesced_run_recovers(SoftSkipList::<u64>::new(common::durable_config()).unwrap());
}
