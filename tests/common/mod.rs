// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use durable_sets::{Arena, ArenaConfig, DurableSet, Recover, RecoveryStats};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test-friendly subscriber once per test binary. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=durable_sets=trace`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Default chunks, keeping a durable image for [`crash_and_recover`].
pub fn durable_config() -> ArenaConfig {
    ArenaConfig {
        durable_image: true,
        ..ArenaConfig::default()
    }
}

/// Chunks small enough that the tests exercise arena growth.
pub fn small_config<S: DurableSet>() -> ArenaConfig {
    ArenaConfig {
        chunk_size: 32 * S::slot_layout().pad_to_align().size(),
        durable_image: true,
    }
}

/// Drops `set` (the volatile half of the process dies) and runs recovery on
/// the written-back contents of its arena. Stores that were never flushed
/// are lost.
pub fn crash_and_recover<S: Recover>(set: S) -> (S, RecoveryStats) {
    let arena: Arc<Arena<S::Limiter>> = Arc::clone(set.arena());
    assert!(arena.has_durable_image(), "crash tests need a durable image");
    drop(set);
    S::recover(arena).unwrap()
}
