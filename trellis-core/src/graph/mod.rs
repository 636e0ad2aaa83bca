//! Node Graph
//!
//! This module implements the store of observable nodes.
//!
//! # Overview
//!
//! Observable state forms a tree:
//!
//! - A root node owns a backing value
//! - Child nodes stand for keys inside that value and are created lazily,
//!   the first time the key is read through its parent
//! - Every node carries its own listeners and lock flag
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena and refer to each other by [`NodeId`], so parent
//!    back-links are plain indices instead of weak pointers.
//!
//! 2. Handles carry a slot generation. Destroying a node frees its slot, and
//!    any handle still held for it resolves to nothing afterwards.
//!
//! 3. Only roots hold values; see [`NodeStore`] for how children resolve.

mod node;
mod store;

pub use node::{Node, NodeId};
pub(crate) use node::Activator;
pub use store::NodeStore;
