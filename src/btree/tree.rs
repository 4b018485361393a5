//! The B+ tree itself: lookup, insert, and delete over pages owned by a
//! [`BufferManager`], plus the split/merge/borrow machinery that keeps every
//! leaf and internal node within its configured slot-size bounds.
//!
//! Keys live only in leaves and in the separators of their ancestors; a
//! separator `key_i` in an internal node equals the smallest key reachable
//! through the child immediately to its right. Splits and merges propagate
//! exactly one level at a time, along each node's own `parent` pointer, so a
//! deep tree is never re-walked from the root to fix up an ancestor.

use crate::buffer::BufferManager;
use crate::device::BlockDevice;
use crate::error::{Result, StorageError};
use crate::page::PageHeader;
use crate::types::{BTreeConfig, InsertPolicy, PageId, RebalancePolicy};
use tracing::trace;

use super::node::{Inode, InodeView, Leaf, LeafView};

/// A B+ tree over pages owned by a [`BufferManager`]. Cheap to clone: it
/// holds only the (already-cheap-to-clone) buffer manager handle and a
/// config, with the root page id and tree height persisted in the
/// superblock rather than held here.
pub struct BTree<D> {
    buffer: BufferManager<D>,
    config: BTreeConfig,
}

impl<D: BlockDevice> Clone for BTree<D> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: BlockDevice> BTree<D> {
    pub fn new(buffer: BufferManager<D>, config: BTreeConfig) -> Self {
        Self { buffer, config }
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// The buffer manager backing this tree, for callers that need to flush
    /// or otherwise reach the page cache directly.
    pub fn buffer(&self) -> &BufferManager<D> {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        !self.root().0.is_valid()
    }

    fn root(&self) -> (PageId, u32) {
        self.buffer.root()
    }

    fn is_leaf_kind(&self, kind: u16) -> bool {
        kind == self.config.leaf_page_kind
    }

    fn kind_of(&self, pid: PageId) -> Result<u16> {
        let handle = self.buffer.fetch_page(pid)?;
        Ok(PageHeader::read(&handle.read()).kind)
    }

    // ---- lookup -----------------------------------------------------

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (root, _) = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut pid = root;
        loop {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            if self.is_leaf_kind(PageHeader::read(&page).kind) {
                let view = LeafView::new(&page);
                return Ok(match view.find(key) {
                    Ok(i) => Some(view.value_at(i).to_vec()),
                    Err(_) => None,
                });
            }
            let view = InodeView::new(&page);
            pid = view.child(view.find_child_index(key));
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // ---- insert -------------------------------------------------------

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let max_key = self.config.max_key_size();
        if key.len() > max_key {
            return Err(StorageError::KeyTooLarge { size: key.len(), max: max_key });
        }
        let max_value = self.config.max_value_size();
        if value.len() > max_value {
            return Err(StorageError::ValueTooLarge { size: value.len(), max: max_value });
        }

        let (root, height) = self.root();
        if !root.is_valid() {
            let handle = self.buffer.new_page()?;
            let pid = handle.page_id();
            {
                let mut page = handle.write();
                let mut leaf = Leaf::init(&mut page, pid);
                leaf.insert_at(0, key, value)?;
            }
            drop(handle);
            self.buffer.set_root(pid, 1)?;
            return Ok(());
        }

        if let Some((sep, new_pid)) = self.insert_rec(root, key, value)? {
            let handle = self.buffer.new_page()?;
            let new_root = handle.page_id();
            {
                let mut page = handle.write();
                let mut inode = Inode::init(&mut page, new_root, new_pid);
                inode.insert_at(0, &sep, root)?;
            }
            drop(handle);
            self.set_parent(root, new_root)?;
            self.set_parent(new_pid, new_root)?;
            self.buffer.set_root(new_root, height + 1)?;
        }
        Ok(())
    }

    fn set_parent(&self, pid: PageId, parent: PageId) -> Result<()> {
        let kind = self.kind_of(pid)?;
        let handle = self.buffer.fetch_page(pid)?;
        let mut page = handle.write();
        if self.is_leaf_kind(kind) {
            Leaf::attach(&mut page).set_parent(parent);
        } else {
            Inode::attach(&mut page).set_parent(parent);
        }
        Ok(())
    }

    /// Insert into the subtree rooted at `pid`. `Some((sep, new_pid))` means
    /// `pid` split and the caller must link `new_pid` in as `pid`'s new
    /// right neighbor, separated by `sep`.
    fn insert_rec(&self, pid: PageId, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, PageId)>> {
        let kind = self.kind_of(pid)?;
        if self.is_leaf_kind(kind) {
            return self.insert_leaf(pid, key, value);
        }
        let (idx, child) = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            let view = InodeView::new(&page);
            let idx = view.find_child_index(key);
            (idx, view.child(idx))
        };
        match self.insert_rec(child, key, value)? {
            None => Ok(None),
            Some((sep, new_pid)) => self.insert_into_inode(pid, idx, sep, new_pid),
        }
    }

    fn insert_leaf(&self, pid: PageId, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, PageId)>> {
        let handle = self.buffer.fetch_page(pid)?;
        let found = {
            let page = handle.read();
            LeafView::new(&page).find(key)
        };
        match found {
            Ok(i) => match self.config.insert_policy {
                InsertPolicy::Insert => Err(StorageError::KeyExists),
                InsertPolicy::Upsert => {
                    let fits = {
                        let mut page = handle.write();
                        Leaf::attach(&mut page).update_value_at(i, key, value)
                    };
                    match fits {
                        Ok(()) => Ok(None),
                        Err(_) => {
                            {
                                let mut page = handle.write();
                                Leaf::attach(&mut page).remove_at(i);
                            }
                            drop(handle);
                            self.insert_leaf_fresh(pid, i, key, value)
                        }
                    }
                }
            },
            Err(pos) => {
                drop(handle);
                self.insert_leaf_fresh(pid, pos, key, value)
            }
        }
    }

    /// Insert `(key, value)` at `pos`, a position already known not to hold
    /// `key`. `pos` must still be valid after any earlier removal at the
    /// same slot (true for the upsert-grew-past-capacity path, since removing
    /// and reinserting the same key never changes its sorted position).
    fn insert_leaf_fresh(
        &self,
        pid: PageId,
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let handle = self.buffer.fetch_page(pid)?;
        let can = {
            let mut page = handle.write();
            Leaf::attach(&mut page).can_insert(key, value)
        };
        if can {
            let is_first = {
                let mut page = handle.write();
                let mut leaf = Leaf::attach(&mut page);
                leaf.insert_at(pos, key, value)?;
                pos == 0
            };
            drop(handle);
            if is_first {
                self.fixup_first_key(pid)?;
            }
            return Ok(None);
        }
        drop(handle);
        self.handle_leaf_overflow(pid, pos, key, value)
    }

    fn handle_leaf_overflow(
        &self,
        pid: PageId,
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        match self.config.rebalance_policy {
            RebalancePolicy::ForceSplit => self.split_leaf_and_insert(pid, pos, key, value),
            RebalancePolicy::NeighborShare | RebalancePolicy::LocalRebalance => {
                if self.try_leaf_neighbor_share(pid, key, value)? {
                    Ok(None)
                } else {
                    self.split_leaf_and_insert(pid, pos, key, value)
                }
            }
        }
    }

    /// Try to relieve a full leaf by pushing one record onto a same-parent
    /// sibling, then inserting `key`/`value` into whichever slot that leaves
    /// open. Returns `false` (no mutation performed) if neither sibling can
    /// help.
    fn try_leaf_neighbor_share(&self, pid: PageId, key: &[u8], value: &[u8]) -> Result<bool> {
        let (parent, next, prev) = {
            let handle = self.buffer.fetch_page(pid)?;
            let view = LeafView::new(&handle.read());
            (view.parent(), view.next(), view.prev())
        };
        if !parent.is_valid() {
            return Ok(false);
        }

        if next.is_valid() && self.shares_parent(next, parent)? {
            let moved = {
                let handle = self.buffer.fetch_page(pid)?;
                let page = handle.read();
                let view = LeafView::new(&page);
                if view.len() > 1 {
                    let (k, v) = view.entry_at(view.len() - 1);
                    Some((k.to_vec(), v.to_vec()))
                } else {
                    None
                }
            };
            if let Some((mk, mv)) = moved {
                let next_handle = self.buffer.fetch_page(next)?;
                let fits = {
                    let mut page = next_handle.write();
                    Leaf::attach(&mut page).can_insert(&mk, &mv)
                };
                if fits {
                    {
                        let handle = self.buffer.fetch_page(pid)?;
                        let mut page = handle.write();
                        let mut leaf = Leaf::attach(&mut page);
                        let last = leaf.len() - 1;
                        leaf.remove_at(last);
                    }
                    {
                        let mut page = next_handle.write();
                        Leaf::attach(&mut page).insert_at(0, &mk, &mv)?;
                    }
                    drop(next_handle);
                    self.fixup_first_key(next)?;
                    return self.reinsert_after_share(pid, key, value);
                }
            }
        }

        if prev.is_valid() && self.shares_parent(prev, parent)? {
            let moved = {
                let handle = self.buffer.fetch_page(pid)?;
                let page = handle.read();
                let view = LeafView::new(&page);
                if view.len() > 1 {
                    let (k, v) = view.entry_at(0);
                    Some((k.to_vec(), v.to_vec()))
                } else {
                    None
                }
            };
            if let Some((mk, mv)) = moved {
                let prev_handle = self.buffer.fetch_page(prev)?;
                let fits = {
                    let mut page = prev_handle.write();
                    Leaf::attach(&mut page).can_insert(&mk, &mv)
                };
                if fits {
                    {
                        let handle = self.buffer.fetch_page(pid)?;
                        let mut page = handle.write();
                        Leaf::attach(&mut page).remove_at(0);
                    }
                    self.fixup_first_key(pid)?;
                    {
                        let plen = {
                            let mut page = prev_handle.write();
                            Leaf::attach(&mut page).len()
                        };
                        let mut page = prev_handle.write();
                        Leaf::attach(&mut page).insert_at(plen, &mk, &mv)?;
                    }
                    drop(prev_handle);
                    return self.reinsert_after_share(pid, key, value);
                }
            }
        }

        Ok(false)
    }

    fn shares_parent(&self, sibling: PageId, parent: PageId) -> Result<bool> {
        let handle = self.buffer.fetch_page(sibling)?;
        Ok(LeafView::new(&handle.read()).parent() == parent)
    }

    fn reinsert_after_share(&self, pid: PageId, key: &[u8], value: &[u8]) -> Result<bool> {
        let pos = {
            let handle = self.buffer.fetch_page(pid)?;
            LeafView::new(&handle.read()).find(key).unwrap_err()
        };
        let is_first = {
            let handle = self.buffer.fetch_page(pid)?;
            let mut page = handle.write();
            let mut leaf = Leaf::attach(&mut page);
            leaf.insert_at(pos, key, value)?;
            pos == 0
        };
        if is_first {
            self.fixup_first_key(pid)?;
        }
        Ok(true)
    }

    /// Split a full leaf in half (after conceptually inserting `key`/`value`
    /// at `pos`), link the new right neighbor into the sibling chain, and
    /// return the separator to splice into the parent.
    fn split_leaf_and_insert(
        &self,
        pid: PageId,
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let (mut entries, parent, prev, next) = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            let view = LeafView::new(&page);
            (view.entries(), view.parent(), view.prev(), view.next())
        };
        entries.insert(pos, (key.to_vec(), value.to_vec()));

        let mid = entries.len() / 2;
        let left = entries[..mid].to_vec();
        let right = entries[mid..].to_vec();
        let promoted = right[0].0.clone();

        {
            let handle = self.buffer.fetch_page(pid)?;
            let mut page = handle.write();
            let mut leaf = Leaf::init(&mut page, pid);
            leaf.set_parent(parent);
            leaf.set_prev(prev);
            for (i, (k, v)) in left.iter().enumerate() {
                leaf.insert_at(i, k, v)?;
            }
        }

        let right_pid = {
            let handle = self.buffer.new_page()?;
            let rp = handle.page_id();
            let mut page = handle.write();
            let mut leaf = Leaf::init(&mut page, rp);
            leaf.set_parent(parent);
            leaf.set_prev(pid);
            leaf.set_next(next);
            for (i, (k, v)) in right.iter().enumerate() {
                leaf.insert_at(i, k, v)?;
            }
            rp
        };

        {
            let handle = self.buffer.fetch_page(pid)?;
            let mut page = handle.write();
            Leaf::attach(&mut page).set_next(right_pid);
        }
        if next.is_valid() {
            let handle = self.buffer.fetch_page(next)?;
            let mut page = handle.write();
            Leaf::attach(&mut page).set_prev(right_pid);
        }

        trace!(left = pid.value(), right = right_pid.value(), "split leaf");
        Ok(Some((promoted, right_pid)))
    }

    /// Splice a split child's new right half into its parent. `j` is the
    /// index the child occupied before the split.
    fn insert_into_inode(
        &self,
        pid: PageId,
        j: usize,
        sep: Vec<u8>,
        new_pid: PageId,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let len = { let handle = self.buffer.fetch_page(pid)?; InodeView::new(&handle.read()).len() };
        let handle = self.buffer.fetch_page(pid)?;
        let fits = {
            let mut page = handle.write();
            Inode::attach(&mut page).can_insert(&sep)
        };
        if !fits {
            drop(handle);
            return self.split_inode_and_insert(pid, j, sep, new_pid);
        }

        {
            let mut page = handle.write();
            let mut inode = Inode::attach(&mut page);
            if j < len {
                let key_j = inode.view().key_at(j).to_vec();
                let old_child = inode.view().child_at(j);
                inode.update_child_at(j, &key_j, new_pid)?;
                inode.insert_at(j, &sep, old_child)?;
            } else {
                let old_rightmost = inode.rightmost();
                inode.set_rightmost(new_pid);
                inode.insert_at(j, &sep, old_rightmost)?;
            }
        }
        drop(handle);
        self.set_parent(new_pid, pid)?;
        Ok(None)
    }

    /// Split an internal node that cannot absorb the incoming separator.
    /// Builds the full `N+2`-child picture in memory, splits it down the
    /// middle, and promotes the middle key to the caller. Internal-node
    /// overflow always force-splits rather than trying neighbor sharing:
    /// with this engine's modest fan-out the saved page allocation is not
    /// worth a second round of parent-key maintenance.
    fn split_inode_and_insert(
        &self,
        pid: PageId,
        j: usize,
        sep: Vec<u8>,
        new_pid: PageId,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let (mut keys, mut children, grandparent) = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            let view = InodeView::new(&page);
            let keys: Vec<Vec<u8>> = (0..view.len()).map(|i| view.key_at(i).to_vec()).collect();
            let mut children: Vec<PageId> = (0..view.len()).map(|i| view.child_at(i)).collect();
            children.push(view.rightmost());
            (keys, children, view.parent())
        };

        if j < keys.len() {
            let old_child = children[j];
            children[j] = new_pid;
            keys.insert(j, sep);
            children.insert(j, old_child);
        } else {
            let last = children.len() - 1;
            let old_rightmost = children[last];
            children[last] = new_pid;
            keys.push(sep);
            children.insert(last, old_rightmost);
        }

        let mid = keys.len() / 2;
        let promoted = keys[mid].clone();
        let left_keys = keys[..mid].to_vec();
        let left_children = children[..=mid].to_vec();
        let left_rightmost = *left_children.last().unwrap();
        let right_keys = keys[mid + 1..].to_vec();
        let right_children = children[mid + 1..].to_vec();
        let right_rightmost = *right_children.last().unwrap();

        {
            let handle = self.buffer.fetch_page(pid)?;
            let mut page = handle.write();
            let mut inode = Inode::init(&mut page, pid, left_rightmost);
            inode.set_parent(grandparent);
            for (i, k) in left_keys.iter().enumerate() {
                inode.insert_at(i, k, left_children[i])?;
            }
        }

        let right_pid = {
            let handle = self.buffer.new_page()?;
            let rp = handle.page_id();
            let mut page = handle.write();
            let mut inode = Inode::init(&mut page, rp, right_rightmost);
            inode.set_parent(grandparent);
            for (i, k) in right_keys.iter().enumerate() {
                inode.insert_at(i, k, right_children[i])?;
            }
            rp
        };

        for &c in right_children.iter() {
            self.set_parent(c, right_pid)?;
        }

        trace!(left = pid.value(), right = right_pid.value(), "split inode");
        Ok(Some((promoted, right_pid)))
    }

    /// Propagate a changed first key up to the nearest ancestor separator
    /// that names it. Stops as soon as it finds a non-leftmost slot to
    /// update; climbs further only while `pid` remains its parent's own
    /// leftmost child (in which case the parent's reachable minimum changed
    /// too, with no local separator to fix yet).
    fn fixup_first_key(&self, mut pid: PageId) -> Result<()> {
        loop {
            let (parent, new_key) = {
                let handle = self.buffer.fetch_page(pid)?;
                let page = handle.read();
                if self.is_leaf_kind(PageHeader::read(&page).kind) {
                    let view = LeafView::new(&page);
                    (view.parent(), view.key_at(0).to_vec())
                } else {
                    let view = InodeView::new(&page);
                    (view.parent(), view.key_at(0).to_vec())
                }
            };
            if !parent.is_valid() {
                return Ok(());
            }
            let slot = self.find_child_slot(parent, pid)?;
            if slot == 0 {
                pid = parent;
                continue;
            }
            self.set_inode_key(parent, slot - 1, &new_key)?;
            return Ok(());
        }
    }

    fn find_child_slot(&self, parent: PageId, child: PageId) -> Result<usize> {
        let handle = self.buffer.fetch_page(parent)?;
        let page = handle.read();
        let view = InodeView::new(&page);
        for j in 0..=view.len() {
            if view.child(j) == child {
                return Ok(j);
            }
        }
        Err(StorageError::corruption("child not found in its recorded parent"))
    }

    fn set_inode_key(&self, pid: PageId, idx: usize, new_key: &[u8]) -> Result<()> {
        let handle = self.buffer.fetch_page(pid)?;
        let child = { let page = handle.read(); InodeView::new(&page).child_at(idx) };
        let mut page = handle.write();
        Inode::attach(&mut page).update_child_at(idx, new_key, child)
    }

    // ---- remove ---------------------------------------------------------

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (root, _) = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let removed = self.remove_rec(root, key)?;
        if removed.is_some() {
            self.maybe_collapse_root()?;
        }
        Ok(removed)
    }

    fn remove_rec(&self, pid: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let kind = self.kind_of(pid)?;
        if self.is_leaf_kind(kind) {
            let handle = self.buffer.fetch_page(pid)?;
            let found = {
                let page = handle.read();
                LeafView::new(&page).find(key)
            };
            let pos = match found {
                Ok(pos) => pos,
                Err(_) => return Ok(None),
            };
            let was_first = pos == 0;
            let value = {
                let page = handle.read();
                LeafView::new(&page).value_at(pos).to_vec()
            };
            {
                let mut page = handle.write();
                Leaf::attach(&mut page).remove_at(pos);
            }
            let still_has_entries = { let page = handle.read(); !LeafView::new(&page).is_empty() };
            drop(handle);
            if was_first && still_has_entries {
                self.fixup_first_key(pid)?;
            }
            return Ok(Some(value));
        }

        let idx = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            InodeView::new(&page).find_child_index(key)
        };
        let child = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            InodeView::new(&page).child(idx)
        };
        let removed = self.remove_rec(child, key)?;
        if removed.is_some() {
            self.fix_underflow(pid, idx)?;
        }
        Ok(removed)
    }

    fn fix_underflow(&self, parent_pid: PageId, idx: usize) -> Result<()> {
        let child = {
            let handle = self.buffer.fetch_page(parent_pid)?;
            InodeView::new(&handle.read()).child(idx)
        };
        let (leaf_kind, underflow) = {
            let handle = self.buffer.fetch_page(child)?;
            let page = handle.read();
            let kind = PageHeader::read(&page).kind;
            if self.is_leaf_kind(kind) {
                let v = LeafView::new(&page);
                (true, v.is_empty() || v.is_underflow())
            } else {
                let v = InodeView::new(&page);
                (false, v.is_empty() || v.is_underflow())
            }
        };
        if !underflow {
            return Ok(());
        }
        if leaf_kind {
            self.fix_leaf_underflow(parent_pid, idx, child)
        } else {
            self.fix_inode_underflow(parent_pid, idx, child)
        }
    }

    fn fix_leaf_underflow(&self, parent_pid: PageId, idx: usize, child: PageId) -> Result<()> {
        let parent_len = { let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).len() };
        let left = if idx > 0 {
            Some({ let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).child(idx - 1) })
        } else {
            None
        };
        let right = if idx < parent_len {
            Some({ let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).child(idx + 1) })
        } else {
            None
        };

        // Merge is preferred over borrow: it shrinks the tree instead of just
        // redistributing it, so try the right sibling first, then the left,
        // and only fall back to borrowing from the richer one if neither
        // sibling has enough spare room to absorb `child` outright.
        let max_slot = self.config.leaf_max_slot_size;
        if let Some(right_pid) = right {
            let mergeable = {
                let hc = self.buffer.fetch_page(child)?;
                let hr = self.buffer.fetch_page(right_pid)?;
                LeafView::new(&hc.read()).can_merge_with(&LeafView::new(&hr.read()), max_slot)
            };
            if mergeable {
                trace!(left = child.value(), right = right_pid.value(), "merging leaves (right preferred)");
                return self.merge_leaves(parent_pid, idx, child, right_pid);
            }
        }
        if let Some(left_pid) = left {
            let mergeable = {
                let hl = self.buffer.fetch_page(left_pid)?;
                let hc = self.buffer.fetch_page(child)?;
                LeafView::new(&hl.read()).can_merge_with(&LeafView::new(&hc.read()), max_slot)
            };
            if mergeable {
                trace!(left = left_pid.value(), right = child.value(), "merging leaves");
                return self.merge_leaves(parent_pid, idx - 1, left_pid, child);
            }
        }

        if let Some(left_pid) = left {
            let left_len = { let h = self.buffer.fetch_page(left_pid)?; LeafView::new(&h.read()).len() };
            if left_len > 1 {
                let (k, v) = {
                    let h = self.buffer.fetch_page(left_pid)?;
                    let page = h.read();
                    let view = LeafView::new(&page);
                    let (k, v) = view.entry_at(left_len - 1);
                    (k.to_vec(), v.to_vec())
                };
                {
                    let h = self.buffer.fetch_page(left_pid)?;
                    let mut page = h.write();
                    Leaf::attach(&mut page).remove_at(left_len - 1);
                }
                {
                    let h = self.buffer.fetch_page(child)?;
                    let mut page = h.write();
                    Leaf::attach(&mut page).insert_at(0, &k, &v)?;
                }
                self.fixup_first_key(child)?;
                trace!(from = left_pid.value(), into = child.value(), "borrowed leaf entry from left");
                return Ok(());
            }
        }

        if let Some(right_pid) = right {
            let right_len = { let h = self.buffer.fetch_page(right_pid)?; LeafView::new(&h.read()).len() };
            if right_len > 1 {
                let (k, v) = {
                    let h = self.buffer.fetch_page(right_pid)?;
                    let page = h.read();
                    let view = LeafView::new(&page);
                    let (k, v) = view.entry_at(0);
                    (k.to_vec(), v.to_vec())
                };
                {
                    let h = self.buffer.fetch_page(right_pid)?;
                    let mut page = h.write();
                    Leaf::attach(&mut page).remove_at(0);
                }
                let child_len = { let h = self.buffer.fetch_page(child)?; LeafView::new(&h.read()).len() };
                {
                    let h = self.buffer.fetch_page(child)?;
                    let mut page = h.write();
                    Leaf::attach(&mut page).insert_at(child_len, &k, &v)?;
                }
                self.fixup_first_key(right_pid)?;
                trace!(from = right_pid.value(), into = child.value(), "borrowed leaf entry from right");
                return Ok(());
            }
        }

        // Sole child of its parent, or both siblings too full to merge or
        // lend: nothing to do here. If `child` itself is still underflowing
        // the parent may now be underflowing too, for the caller one level
        // up to handle.
        Ok(())
    }

    fn merge_leaves(&self, parent_pid: PageId, sep_idx: usize, left_pid: PageId, right_pid: PageId) -> Result<()> {
        let (right_entries, right_next) = {
            let h = self.buffer.fetch_page(right_pid)?;
            let page = h.read();
            let view = LeafView::new(&page);
            (view.entries(), view.next())
        };
        {
            let h = self.buffer.fetch_page(left_pid)?;
            let mut page = h.write();
            let mut leaf = Leaf::attach(&mut page);
            let base = leaf.len();
            for (i, (k, v)) in right_entries.iter().enumerate() {
                leaf.insert_at(base + i, k, v)?;
            }
            leaf.set_next(right_next);
        }
        if right_next.is_valid() {
            let h = self.buffer.fetch_page(right_next)?;
            let mut page = h.write();
            Leaf::attach(&mut page).set_prev(left_pid);
        }
        self.buffer.free_page(right_pid)?;
        trace!(into = left_pid.value(), freed = right_pid.value(), "merged leaves");
        self.remove_inode_child(parent_pid, sep_idx, left_pid)
    }

    fn fix_inode_underflow(&self, parent_pid: PageId, idx: usize, child: PageId) -> Result<()> {
        let parent_len = { let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).len() };
        let left = if idx > 0 {
            Some({ let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).child(idx - 1) })
        } else {
            None
        };
        let right = if idx < parent_len {
            Some({ let h = self.buffer.fetch_page(parent_pid)?; InodeView::new(&h.read()).child(idx + 1) })
        } else {
            None
        };

        // As with leaves, prefer merging (right sibling first) over borrowing.
        let max_slot = self.config.inode_max_slot_size;
        if let Some(right_pid) = right {
            let mergeable = {
                let hc = self.buffer.fetch_page(child)?;
                let hr = self.buffer.fetch_page(right_pid)?;
                InodeView::new(&hc.read()).can_merge_with(&InodeView::new(&hr.read()), max_slot)
            };
            if mergeable {
                trace!(left = child.value(), right = right_pid.value(), "merging inodes (right preferred)");
                return self.merge_inodes(parent_pid, idx, child, right_pid);
            }
        }
        if let Some(left_pid) = left {
            let mergeable = {
                let hl = self.buffer.fetch_page(left_pid)?;
                let hc = self.buffer.fetch_page(child)?;
                InodeView::new(&hl.read()).can_merge_with(&InodeView::new(&hc.read()), max_slot)
            };
            if mergeable {
                trace!(left = left_pid.value(), right = child.value(), "merging inodes");
                return self.merge_inodes(parent_pid, idx - 1, left_pid, child);
            }
        }

        if let Some(left_pid) = left {
            let left_len = { let h = self.buffer.fetch_page(left_pid)?; InodeView::new(&h.read()).len() };
            if left_len > 1 {
                self.borrow_inode_from_left(parent_pid, idx, left_pid, child)?;
                trace!(from = left_pid.value(), into = child.value(), "borrowed inode entry from left");
                return Ok(());
            }
        }
        if let Some(right_pid) = right {
            let right_len = { let h = self.buffer.fetch_page(right_pid)?; InodeView::new(&h.read()).len() };
            if right_len > 1 {
                self.borrow_inode_from_right(parent_pid, idx, child, right_pid)?;
                trace!(from = right_pid.value(), into = child.value(), "borrowed inode entry from right");
                return Ok(());
            }
        }
        // Sole child of its parent, or both siblings too full to merge or
        // lend: nothing to do here. `can_merge_with` already proved a merge
        // won't fit; forcing one anyway would `Inode::init` (wipe) the left
        // page and then fail partway through replaying its entries. If
        // `child` is still underflowing, the parent may now be underflowing
        // too, for the caller one level up to handle.
        Ok(())
    }

    /// Rotate through the parent: `left`'s last child moves to become
    /// `child`'s new first child, the parent's separator moves down to bound
    /// it, and `left`'s last key moves up to replace that separator.
    fn borrow_inode_from_left(&self, parent_pid: PageId, idx: usize, left_pid: PageId, child: PageId) -> Result<()> {
        let old_parent_sep = {
            let h = self.buffer.fetch_page(parent_pid)?;
            InodeView::new(&h.read()).key_at(idx - 1).to_vec()
        };
        let (last_idx, last_key, moved_child) = {
            let h = self.buffer.fetch_page(left_pid)?;
            let view = InodeView::new(&h.read());
            let last = view.len() - 1;
            (last, view.key_at(last).to_vec(), view.child_at(last))
        };
        {
            let h = self.buffer.fetch_page(left_pid)?;
            let mut page = h.write();
            let mut inode = Inode::attach(&mut page);
            inode.set_rightmost(moved_child);
            inode.remove_at(last_idx);
        }
        {
            let h = self.buffer.fetch_page(child)?;
            let mut page = h.write();
            Inode::attach(&mut page).insert_at(0, &old_parent_sep, moved_child)?;
        }
        self.set_parent(moved_child, child)?;
        {
            let h = self.buffer.fetch_page(parent_pid)?;
            let left_id = InodeView::new(&h.read()).child_at(idx - 1);
            let mut page = h.write();
            Inode::attach(&mut page).update_child_at(idx - 1, &last_key, left_id)?;
        }
        Ok(())
    }

    /// Mirror of [`Self::borrow_inode_from_left`]: `right`'s first child
    /// becomes `child`'s new rightmost, via the same parent-separator
    /// rotation.
    fn borrow_inode_from_right(&self, parent_pid: PageId, idx: usize, child: PageId, right_pid: PageId) -> Result<()> {
        let old_parent_sep = {
            let h = self.buffer.fetch_page(parent_pid)?;
            InodeView::new(&h.read()).key_at(idx).to_vec()
        };
        let (first_key, first_child) = {
            let h = self.buffer.fetch_page(right_pid)?;
            let view = InodeView::new(&h.read());
            (view.key_at(0).to_vec(), view.child_at(0))
        };
        {
            let h = self.buffer.fetch_page(right_pid)?;
            let mut page = h.write();
            Inode::attach(&mut page).remove_at(0);
        }
        {
            let h = self.buffer.fetch_page(child)?;
            let old_rightmost = InodeView::new(&h.read()).rightmost();
            let child_len = InodeView::new(&h.read()).len();
            let mut page = h.write();
            let mut inode = Inode::attach(&mut page);
            inode.insert_at(child_len, &old_parent_sep, old_rightmost)?;
            inode.set_rightmost(first_child);
        }
        self.set_parent(first_child, child)?;
        {
            let h = self.buffer.fetch_page(parent_pid)?;
            let child_id = InodeView::new(&h.read()).child_at(idx);
            let mut page = h.write();
            Inode::attach(&mut page).update_child_at(idx, &first_key, child_id)?;
        }
        Ok(())
    }

    /// Fold `right` into `left`, pulling the parent's separator between them
    /// down as the connecting key.
    fn merge_inodes(&self, parent_pid: PageId, sep_idx: usize, left_pid: PageId, right_pid: PageId) -> Result<()> {
        let pulled_key = {
            let h = self.buffer.fetch_page(parent_pid)?;
            InodeView::new(&h.read()).key_at(sep_idx).to_vec()
        };
        let (left_keys, left_children, left_rightmost) = {
            let h = self.buffer.fetch_page(left_pid)?;
            let page = h.read();
            let view = InodeView::new(&page);
            let keys: Vec<Vec<u8>> = (0..view.len()).map(|i| view.key_at(i).to_vec()).collect();
            let children: Vec<PageId> = (0..view.len()).map(|i| view.child_at(i)).collect();
            (keys, children, view.rightmost())
        };
        let (right_keys, right_children, right_rightmost) = {
            let h = self.buffer.fetch_page(right_pid)?;
            let page = h.read();
            let view = InodeView::new(&page);
            let keys: Vec<Vec<u8>> = (0..view.len()).map(|i| view.key_at(i).to_vec()).collect();
            let children: Vec<PageId> = (0..view.len()).map(|i| view.child_at(i)).collect();
            (keys, children, view.rightmost())
        };

        let mut keys = left_keys;
        keys.push(pulled_key);
        keys.extend(right_keys);
        let mut children = left_children;
        children.push(left_rightmost);
        children.extend(right_children.clone());

        {
            let h = self.buffer.fetch_page(left_pid)?;
            let grandparent = InodeView::new(&h.read()).parent();
            let mut page = h.write();
            let mut inode = Inode::init(&mut page, left_pid, right_rightmost);
            inode.set_parent(grandparent);
            for (i, k) in keys.iter().enumerate() {
                inode.insert_at(i, k, children[i])?;
            }
        }
        for &c in right_children.iter().chain(std::iter::once(&right_rightmost)) {
            self.set_parent(c, left_pid)?;
        }
        self.buffer.free_page(right_pid)?;
        trace!(into = left_pid.value(), freed = right_pid.value(), "merged inodes");
        self.remove_inode_child(parent_pid, sep_idx, left_pid)
    }

    /// Remove separator `sep_idx` from `parent`, leaving `merged_into` as
    /// the child that now covers the range the two merged siblings used to
    /// split between them.
    fn remove_inode_child(&self, parent_pid: PageId, sep_idx: usize, merged_into: PageId) -> Result<()> {
        let handle = self.buffer.fetch_page(parent_pid)?;
        let new_len = {
            let mut page = handle.write();
            let mut inode = Inode::attach(&mut page);
            inode.remove_at(sep_idx);
            inode.len()
        };
        if sep_idx < new_len {
            let key = { let page = handle.read(); InodeView::new(&page).key_at(sep_idx).to_vec() };
            let mut page = handle.write();
            Inode::attach(&mut page).update_child_at(sep_idx, &key, merged_into)?;
        } else {
            let mut page = handle.write();
            Inode::attach(&mut page).set_rightmost(merged_into);
        }
        Ok(())
    }

    /// Collapse the root downward while it has become a pass-through: an
    /// internal root with no separators left (just its `rightmost`), or a
    /// leaf root that emptied out entirely.
    fn maybe_collapse_root(&self) -> Result<()> {
        loop {
            let (root, height) = self.root();
            if !root.is_valid() {
                return Ok(());
            }
            let handle = self.buffer.fetch_page(root)?;
            let kind = { let page = handle.read(); PageHeader::read(&page).kind };
            if self.is_leaf_kind(kind) {
                let empty = { let page = handle.read(); LeafView::new(&page).is_empty() };
                if empty {
                    drop(handle);
                    self.buffer.free_page(root)?;
                    self.buffer.set_root(PageId::INVALID, 0)?;
                    trace!("collapsed empty leaf root, tree is now empty");
                }
                return Ok(());
            }
            let (empty, new_root) = {
                let page = handle.read();
                let view = InodeView::new(&page);
                (view.is_empty(), view.rightmost())
            };
            if !empty {
                return Ok(());
            }
            drop(handle);
            self.set_parent(new_root, PageId::INVALID)?;
            self.buffer.free_page(root)?;
            self.buffer.set_root(new_root, height - 1)?;
            trace!(new_root = new_root.value(), new_height = height - 1, "collapsed root down one level");
        }
    }

    // ---- cursor support ---------------------------------------------------

    pub(crate) fn first_leaf(&self) -> Result<Option<PageId>> {
        let (root, _) = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut pid = root;
        loop {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            if self.is_leaf_kind(PageHeader::read(&page).kind) {
                return Ok(Some(pid));
            }
            pid = InodeView::new(&page).child(0);
        }
    }

    pub(crate) fn last_leaf(&self) -> Result<Option<PageId>> {
        let (root, _) = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut pid = root;
        loop {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            if self.is_leaf_kind(PageHeader::read(&page).kind) {
                return Ok(Some(pid));
            }
            pid = InodeView::new(&page).rightmost();
        }
    }

    /// Descend to the leaf that would hold `key`, and that leaf's
    /// lower-bound position for it (present or not).
    pub(crate) fn seek_leaf(&self, key: &[u8]) -> Result<Option<(PageId, usize)>> {
        let (root, _) = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut pid = root;
        loop {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            if self.is_leaf_kind(PageHeader::read(&page).kind) {
                let view = LeafView::new(&page);
                let pos = match view.find(key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                return Ok(Some((pid, pos)));
            }
            let view = InodeView::new(&page);
            pid = view.child(view.find_child_index(key));
        }
    }

    pub(crate) fn leaf_entry(&self, pid: PageId, i: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        let handle = self.buffer.fetch_page(pid)?;
        let page = handle.read();
        let view = LeafView::new(&page);
        Ok((view.key_at(i).to_vec(), view.value_at(i).to_vec()))
    }

    pub(crate) fn leaf_len(&self, pid: PageId) -> Result<usize> {
        let handle = self.buffer.fetch_page(pid)?;
        Ok(LeafView::new(&handle.read()).len())
    }

    pub(crate) fn leaf_next(&self, pid: PageId) -> Result<PageId> {
        let handle = self.buffer.fetch_page(pid)?;
        Ok(LeafView::new(&handle.read()).next())
    }

    pub(crate) fn leaf_prev(&self, pid: PageId) -> Result<PageId> {
        let handle = self.buffer.fetch_page(pid)?;
        Ok(LeafView::new(&handle.read()).prev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use crate::types::PAGE_SIZE;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn tree(capacity: usize) -> BTree<MemoryBlockDevice> {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), capacity).unwrap();
        BTree::new(bm, BTreeConfig::default())
    }

    #[test]
    fn put_get_roundtrip() {
        let t = tree(16);
        t.put(b"a", b"1").unwrap();
        t.put(b"b", b"2").unwrap();
        assert_eq!(t.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(t.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(t.get(b"c").unwrap(), None);
    }

    #[test]
    fn upsert_overwrites_existing_key() {
        let t = tree(16);
        t.put(b"a", b"1").unwrap();
        t.put(b"a", b"2").unwrap();
        assert_eq!(t.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn insert_policy_rejects_duplicate() {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 16).unwrap();
        let cfg = BTreeConfig::default().with_insert_policy(InsertPolicy::Insert);
        let t = BTree::new(bm, cfg);
        t.put(b"a", b"1").unwrap();
        assert!(matches!(t.put(b"a", b"2"), Err(StorageError::KeyExists)));
    }

    #[test]
    fn many_inserts_force_splits_and_stay_queryable() {
        let t = tree(8);
        for i in 0..2000u32 {
            t.put(&i.to_be_bytes(), &(i * 2).to_be_bytes()).unwrap();
        }
        for i in 0..2000u32 {
            assert_eq!(t.get(&i.to_be_bytes()).unwrap(), Some((i * 2).to_be_bytes().to_vec()));
        }
    }

    #[test]
    fn remove_then_reinsert() {
        let t = tree(8);
        for i in 0..500u32 {
            t.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        for i in 0..250u32 {
            assert_eq!(t.remove(&i.to_be_bytes()).unwrap(), Some(i.to_be_bytes().to_vec()));
        }
        for i in 0..250u32 {
            assert_eq!(t.get(&i.to_be_bytes()).unwrap(), None);
        }
        for i in 250..500u32 {
            assert_eq!(t.get(&i.to_be_bytes()).unwrap(), Some(i.to_be_bytes().to_vec()));
        }
        for i in 0..250u32 {
            t.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        for i in 0..500u32 {
            assert_eq!(t.get(&i.to_be_bytes()).unwrap(), Some(i.to_be_bytes().to_vec()));
        }
    }

    #[test]
    fn remove_everything_collapses_to_empty_tree() {
        let t = tree(8);
        for i in 0..300u32 {
            t.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        for i in 0..300u32 {
            t.remove(&i.to_be_bytes()).unwrap();
        }
        assert!(t.is_empty());
        for i in 0..300u32 {
            assert_eq!(t.get(&i.to_be_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn matches_reference_btreemap_under_mixed_workload() {
        let t = tree(8);
        let mut model: BTreeMap<u32, u32> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut present: Vec<u32> = Vec::new();

        for _ in 0..15_000u32 {
            let op = rng.gen_range(0..3);
            match op {
                0 => {
                    let k: u32 = rng.gen_range(0..5000);
                    let v: u32 = rng.gen();
                    t.put(&k.to_be_bytes(), &v.to_be_bytes()).unwrap();
                    if model.insert(k, v).is_none() {
                        present.push(k);
                    }
                }
                1 => {
                    if !present.is_empty() {
                        let idx = rng.gen_range(0..present.len());
                        let k = present.swap_remove(idx);
                        let expect = model.remove(&k).map(|v| v.to_be_bytes().to_vec());
                        assert_eq!(t.remove(&k.to_be_bytes()).unwrap(), expect);
                    }
                }
                _ => {
                    let k: u32 = rng.gen_range(0..5000);
                    let expect = model.get(&k).map(|v| v.to_be_bytes().to_vec());
                    assert_eq!(t.get(&k.to_be_bytes()).unwrap(), expect);
                }
            }
        }

        for (k, v) in model.iter() {
            assert_eq!(t.get(&k.to_be_bytes()).unwrap(), Some(v.to_be_bytes().to_vec()));
        }
    }

    /// Scenario: 15,000 mixed operations (60% upsert, 40% remove) over a
    /// small keyspace against a deterministic PRNG, with the in-order key
    /// stream checked against a reference sorted map every 500 steps.
    #[test]
    fn matches_reference_map_under_seeded_mixed_workload_with_periodic_checks() {
        use crate::btree::Cursor;

        fn in_order_keys(t: &BTree<MemoryBlockDevice>) -> Vec<Vec<u8>> {
            let mut keys = Vec::new();
            let mut cursor = Cursor::first(t).unwrap();
            while let Some((k, _)) = cursor.entry().unwrap() {
                keys.push(k);
                cursor.next().unwrap();
            }
            keys
        }

        let t = tree(64);
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);

        for step in 1..=15_000u32 {
            let key_num: u32 = rng.gen_range(0..=2000);
            let key = key_num.to_be_bytes().to_vec();
            let value = key_num.to_string().into_bytes();

            if rng.gen_bool(0.6) {
                t.put(&key, &value).unwrap();
                reference.insert(key, value);
            } else {
                t.remove(&key).unwrap();
                reference.remove(&key);
            }

            if step % 500 == 0 {
                let tree_keys = in_order_keys(&t);
                let ref_keys: Vec<Vec<u8>> = reference.keys().cloned().collect();
                assert_eq!(tree_keys, ref_keys, "divergence at step {step}");
            }
        }

        let tree_keys = in_order_keys(&t);
        let ref_keys: Vec<Vec<u8>> = reference.keys().cloned().collect();
        assert_eq!(tree_keys, ref_keys);
        for (k, v) in &reference {
            assert_eq!(t.get(k).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn variable_length_keys_and_values() {
        let t = tree(8);
        let entries: Vec<(String, String)> = (0..400)
            .map(|i| (format!("key-{i:04}"), "x".repeat(i % 200)))
            .collect();
        for (k, v) in &entries {
            t.put(k.as_bytes(), v.as_bytes()).unwrap();
        }
        for (k, v) in &entries {
            assert_eq!(t.get(k.as_bytes()).unwrap(), Some(v.as_bytes().to_vec()));
        }
    }
}
