//! B+ tree implementation.
//!
//! This module provides a disk-based B+ tree that supports:
//! - Point lookups (get)
//! - Insertions (put)
//! - Deletions (remove)
//! - Sorted-order iteration via [`Cursor`]

mod cursor;
mod node;
mod tree;

pub use cursor::Cursor;
pub use node::{Inode, InodeView, Leaf, LeafView};
pub use tree::BTree;
