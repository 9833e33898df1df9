// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Containers that order every durable write explicitly ("SOFT"): a node is
//! linked while its state is `IntendToInsert`, its record is made durable, and
//! only then does it become `Inserted`. Removal mirrors this through
//! `IntendToDelete`. Any thread that meets an intermediate state may complete
//! it.

mod list;
mod record;
mod skiplist;

pub use list::SoftList;
pub use skiplist::SoftSkipList;
