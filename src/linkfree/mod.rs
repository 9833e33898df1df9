// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Lock-free containers whose nodes carry a one-byte commit epoch and two
//! "already flushed" flags instead of an explicit durability protocol.

mod list;
mod skiplist;

pub use list::LinkFreeList;
pub use skiplist::LinkFreeSkipList;
