// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Throughput workload shared by the `bench` binary and the tests.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Barrier,
    },
    thread,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::{Error, Result},
    set::{DurableSet, Value},
};

/// Containers the benchmark driver knows by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    LinkFreeList,
    LinkFreeSkipList,
    SoftList,
    SoftSkipList,
    LinkFreeHashTable,
    SoftHashTable,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::LinkFreeList,
        Algorithm::LinkFreeSkipList,
        Algorithm::SoftList,
        Algorithm::SoftSkipList,
        Algorithm::LinkFreeHashTable,
        Algorithm::SoftHashTable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::LinkFreeList => "LinkFreeList",
            Algorithm::LinkFreeSkipList => "LinkFreeSkipList",
            Algorithm::SoftList => "SOFTList",
            Algorithm::SoftSkipList => "SOFTSkipList",
            Algorithm::LinkFreeHashTable => "LinkFreeHashTable",
            Algorithm::SoftHashTable => "SOFTHashTable",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| Error::UnknownAlgorithm(s.to_owned()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Workload {
    pub threads: usize,
    pub duration: Duration,
    /// Percentage of `contains` calls. The rest is split evenly between
    /// `insert` and `remove`.
    pub read_ratio: u32,
    /// Keys are drawn from `0..key_range`.
    pub key_range: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Workload {
            threads: 1,
            duration: Duration::from_secs(5),
            read_ratio: 90,
            key_range: 1024,
        }
    }
}

impl Workload {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::InvalidWorkload("at least one thread is required".to_owned()));
        }
        if self.read_ratio > 100 {
            return Err(Error::InvalidWorkload(format!(
                "read ratio {} is not a percentage",
                self.read_ratio
            )));
        }
        if self.key_range < 2 || self.key_range > i64::MAX as u64 {
            return Err(Error::InvalidWorkload(format!(
                "key range {} out of bounds",
                self.key_range
            )));
        }
        if self.duration.is_zero() {
            return Err(Error::InvalidWorkload("duration must be positive".to_owned()));
        }
        Ok(())
    }

    /// Keys thread `tid` (1-based) inserts before the timed phase. Together
    /// the threads fill half of the key range.
    fn prefill_share(&self, tid: usize) -> u64 {
        let total = self.key_range / 2;
        let share = total / self.threads as u64;
        let missing = total - share * self.threads as u64;
        share + u64::from((tid as u64) <= missing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Report {
    pub total_ops: u64,
    pub elapsed: Duration,
}

impl Report {
    pub fn kops_per_sec(&self) -> f64 {
        self.total_ops as f64 / (self.elapsed.as_secs_f64() * 1000.)
    }
}

/// Runs `workload` against `set` and reports the operations completed in the
/// timed phase.
pub fn run<S: DurableSet>(set: &S, workload: &Workload) -> Result<Report> {
    workload.validate()?;
    let read_cut = workload.read_ratio * 10;
    let insert_cut = read_cut + (1000 - read_cut) / 2;

    let start = Barrier::new(workload.threads + 1);
    let stop = AtomicBool::new(false);
    tracing::info!(?workload, "starting workload");

    let (total_ops, elapsed) = thread::scope(|s| {
        let workers: Vec<_> = (1..=workload.threads)
            .map(|tid| {
                let (start, stop) = (&start, &stop);
                s.spawn(move || {
                    let handle = set.handle();
                    let value = S::Value::from_bits(tid as u64);
                    let mut op_rng = StdRng::seed_from_u64(tid as u64);
                    let mut key_rng = StdRng::seed_from_u64(tid as u64 + 1);
                    let mut key = || key_rng.gen_range(0..workload.key_range) as i64;

                    let mut filled = 0;
                    while filled < workload.prefill_share(tid) {
                        if set.insert(key(), value, &handle) {
                            filled += 1;
                        }
                    }
                    start.wait();

                    let mut ops = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let op = op_rng.gen_range(0..1000);
                        let k = key();
                        if op < read_cut {
                            set.contains(k, &handle);
                        } else if op < insert_cut {
                            set.insert(k, value, &handle);
                        } else {
                            set.remove(k, &handle);
                        }
                        ops += 1;
                    }
                    ops
                })
            })
            .collect();

        start.wait();
        let began = Instant::now();
        thread::sleep(workload.duration);
        stop.store(true, Ordering::Relaxed);
        let total: u64 = workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .sum();
        (total, began.elapsed())
    });

    let report = Report { total_ops, elapsed };
    tracing::info!(
        total_ops,
        kops_per_sec = report.kops_per_sec(),
        "workload finished"
    );
    Ok(report)
}
