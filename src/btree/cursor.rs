//! B+ tree cursor for in-order iteration.
//!
//! Unlike a stack-based cursor over an arbitrary tree, a B+ tree cursor only
//! ever needs to remember where it is among the leaves: every leaf already
//! links to its sorted neighbors, so advancing or retreating never touches
//! an internal node.

use crate::device::BlockDevice;
use crate::error::Result;
use crate::types::PageId;

use super::tree::BTree;

/// A cursor over a [`BTree`]'s entries in sorted key order.
///
/// Positioned either at a `(leaf, slot)` pair or at the end sentinel
/// (`PageId::INVALID`, any slot), past the last entry.
pub struct Cursor<'a, D> {
    tree: &'a BTree<D>,
    leaf: PageId,
    slot: usize,
}

impl<'a, D: BlockDevice> Cursor<'a, D> {
    /// A cursor positioned at the smallest key in `tree`.
    pub fn first(tree: &'a BTree<D>) -> Result<Self> {
        let leaf = tree.first_leaf()?.unwrap_or(PageId::INVALID);
        Ok(Self { tree, leaf, slot: 0 })
    }

    /// A cursor positioned at the largest key in `tree`.
    pub fn last(tree: &'a BTree<D>) -> Result<Self> {
        match tree.last_leaf()? {
            Some(leaf) => {
                let len = tree.leaf_len(leaf)?;
                if len == 0 {
                    Ok(Self { tree, leaf: PageId::INVALID, slot: 0 })
                } else {
                    Ok(Self { tree, leaf, slot: len - 1 })
                }
            }
            None => Ok(Self { tree, leaf: PageId::INVALID, slot: 0 }),
        }
    }

    /// A cursor positioned at `key`, or at the first key greater than it if
    /// `key` is absent.
    pub fn seek(tree: &'a BTree<D>, key: &[u8]) -> Result<Self> {
        match tree.seek_leaf(key)? {
            Some((leaf, pos)) => {
                let mut cursor = Self { tree, leaf, slot: pos };
                if pos >= tree.leaf_len(leaf)? {
                    cursor.advance_to_next_leaf()?;
                }
                Ok(cursor)
            }
            None => Ok(Self { tree, leaf: PageId::INVALID, slot: 0 }),
        }
    }

    /// Whether the cursor has run off either end of the tree.
    pub fn is_end(&self) -> bool {
        !self.leaf.is_valid()
    }

    /// The entry the cursor is positioned at, or `None` at the end sentinel.
    pub fn entry(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.is_end() {
            return Ok(None);
        }
        Ok(Some(self.tree.leaf_entry(self.leaf, self.slot)?))
    }

    /// Advance to the next entry in sorted order.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.slot += 1;
        if self.slot >= self.tree.leaf_len(self.leaf)? {
            self.advance_to_next_leaf()?;
        }
        Ok(())
    }

    fn advance_to_next_leaf(&mut self) -> Result<()> {
        let next = self.tree.leaf_next(self.leaf)?;
        self.leaf = next;
        self.slot = 0;
        Ok(())
    }

    /// Retreat to the previous entry in sorted order.
    pub fn prev(&mut self) -> Result<()> {
        if self.is_end() {
            if let Some(leaf) = self.tree.last_leaf()? {
                let len = self.tree.leaf_len(leaf)?;
                if len > 0 {
                    self.leaf = leaf;
                    self.slot = len - 1;
                }
            }
            return Ok(());
        }
        if self.slot > 0 {
            self.slot -= 1;
            return Ok(());
        }
        let prev = self.tree.leaf_prev(self.leaf)?;
        if !prev.is_valid() {
            self.leaf = PageId::INVALID;
            self.slot = 0;
            return Ok(());
        }
        self.leaf = prev;
        self.slot = self.tree.leaf_len(prev)?.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::device::MemoryBlockDevice;
    use crate::types::{BTreeConfig, PAGE_SIZE};

    fn populated(n: u32) -> BTree<MemoryBlockDevice> {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 8).unwrap();
        let t = BTree::new(bm, BTreeConfig::default());
        for i in 0..n {
            t.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        t
    }

    #[test]
    fn forward_iteration_is_sorted() {
        let t = populated(500);
        let mut cursor = Cursor::first(&t).unwrap();
        let mut seen = Vec::new();
        while !cursor.is_end() {
            let (k, _) = cursor.entry().unwrap().unwrap();
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            cursor.next().unwrap();
        }
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn backward_iteration_is_sorted() {
        let t = populated(500);
        let mut cursor = Cursor::last(&t).unwrap();
        let mut seen = Vec::new();
        while !cursor.is_end() {
            let (k, _) = cursor.entry().unwrap().unwrap();
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            cursor.prev().unwrap();
        }
        assert_eq!(seen, (0..500).rev().collect::<Vec<_>>());
    }

    #[test]
    fn seek_lands_on_or_after_key() {
        let t = populated(500);
        let cursor = Cursor::seek(&t, &250u32.to_be_bytes()).unwrap();
        let (k, _) = cursor.entry().unwrap().unwrap();
        assert_eq!(u32::from_be_bytes(k.try_into().unwrap()), 250);
    }

    #[test]
    fn seek_past_end_is_end() {
        let t = populated(10);
        let cursor = Cursor::seek(&t, &999u32.to_be_bytes()).unwrap();
        assert!(cursor.is_end());
    }

    #[test]
    fn empty_tree_cursor_is_end() {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 8).unwrap();
        let t: BTree<MemoryBlockDevice> = BTree::new(bm, BTreeConfig::default());
        assert!(Cursor::first(&t).unwrap().is_end());
        assert!(Cursor::last(&t).unwrap().is_end());
    }
}
