// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{fs::OpenOptions, io::Write, path::PathBuf, time::Duration};

use durable_sets::{
    workload::{self, Algorithm, Workload},
    ArenaConfig, DurableSet, Error, HashTable, LinkFreeList, LinkFreeSkipList, Result, SoftList,
    SoftSkipList, Unlimited,
};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
#[structopt(name = "bench")]
struct Opt {
    /// algorithm
    #[structopt(short = "a", long, default_value = "LinkFreeList")]
    algorithm: String,

    /// number of threads
    #[structopt(short = "p", long, default_value = "1")]
    threads: usize,

    /// test duration in seconds
    #[structopt(short = "d", long, default_value = "5")]
    duration: u64,

    /// lookup ratio (0~100)
    #[structopt(short = "R", long, default_value = "90")]
    read_ratio: u32,

    /// key range
    #[structopt(short = "M", long, default_value = "1024")]
    key_range: u64,

    /// iteration number, the header is only printed for the first one
    #[structopt(short = "I", long, default_value = "1")]
    iteration: u32,

    /// hash table buckets
    #[structopt(short = "b", long, default_value = "1024")]
    buckets: usize,

    /// append the throughput to this file
    #[structopt(short = "o", long)]
    output: Option<PathBuf>,
}

fn run<S: DurableSet>(set: S, opt: &Opt, workload: &Workload) -> Result<f64> {
    if opt.iteration == 1 {
        println!(
            "Running {}: Reads {} Key Range {} Num Threads {}",
            opt.algorithm, opt.read_ratio, opt.key_range, opt.threads
        );
    }
    let report = workload::run(&set, workload)?;
    Ok(report.kops_per_sec())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let opt = Opt::from_args();
    let algorithm = match opt.algorithm.parse::<Algorithm>() {
        Ok(a) => a,
        Err(Error::UnknownAlgorithm(name)) => {
            println!("Algorithm not found.");
            println!("{name}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let workload = Workload {
        threads: opt.threads,
        duration: Duration::from_secs(opt.duration),
        read_ratio: opt.read_ratio,
        key_range: opt.key_range,
    };
    workload.validate()?;

    let config = ArenaConfig::default();
    let kops = match algorithm {
        Algorithm::LinkFreeList => run(LinkFreeList::<i64>::new(config)?, &opt, &workload)?,
        Algorithm::LinkFreeSkipList => run(LinkFreeSkipList::<i64>::new(config)?, &opt, &workload)?,
        Algorithm::SoftList => run(SoftList::<i64>::new(config)?, &opt, &workload)?,
        Algorithm::SoftSkipList => run(SoftSkipList::<i64>::new(config)?, &opt, &workload)?,
        Algorithm::LinkFreeHashTable => run(
            HashTable::<LinkFreeList<i64>>::new(opt.buckets, config, Unlimited::default())?,
            &opt,
            &workload,
        )?,
        Algorithm::SoftHashTable => run(
            HashTable::<SoftList<i64>>::new(opt.buckets, config, Unlimited::default())?,
            &opt,
            &workload,
        )?,
    };
    println!("{kops}");

    if let Some(path) = &opt.output {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if opt.iteration == 1 {
            writeln!(file, "Threads Num: {}", opt.threads)?;
        }
        writeln!(file, "{kops}")?;
    }
    Ok(())
}
