//! Shared foundational types used across the Kiln build core.
//!
//! This crate provides content hashing, dense ID-indexed arenas, and the
//! lexical path helpers that the planner, cache, and scheduler agree on.

#![warn(missing_docs)]

pub mod arena;
pub mod hash;
pub mod ids;
pub mod paths;

pub use arena::{Arena, ArenaId};
pub use hash::{ContentHash, StableHasher};
pub use ids::{NodeId, TaskId};
