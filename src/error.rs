// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::alloc::Layout;

/// Errors surfaced while building arenas, containers and workloads.
///
/// Container operations themselves never fail: `insert`/`remove` report
/// whether their effect happened, and contention is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arena configuration: {0}")]
    InvalidConfig(String),

    #[error("arena slot layout {found:?} does not match the record layout {expected:?}")]
    LayoutMismatch { expected: Layout, found: Layout },

    #[error("arena is still referenced by {0} other owner(s) and cannot be reopened")]
    ArenaInUse(usize),

    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
