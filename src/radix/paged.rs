//! Buffer-manager-backed radix trie level storage.

use super::level::{RadixLevel, RadixLevelView};
use super::{Model, RadixSlot};
use crate::buffer::BufferManager;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::types::{PageId, RadixConfig};

/// [`Model`] that stores each trie level as its own page through a
/// [`BufferManager`].
pub struct PagedModel<D> {
    buffer: BufferManager<D>,
    config: RadixConfig,
}

impl<D: BlockDevice> PagedModel<D> {
    pub fn new(buffer: BufferManager<D>, config: RadixConfig) -> Self {
        Self { buffer, config }
    }
}

impl<D: BlockDevice> Model for PagedModel<D> {
    type NodeRef = PageId;

    fn fan_out(&self) -> usize {
        self.config.fan_out as usize
    }

    fn alloc_level(&mut self, level: u16, parent: Option<PageId>) -> Result<PageId> {
        let handle = self.buffer.new_page()?;
        let pid = handle.page_id();
        let mut page = handle.write();
        RadixLevel::init(
            &mut page,
            self.config.page_kind,
            pid,
            parent.unwrap_or(PageId::INVALID),
            level,
            self.config.fan_out as u16,
        );
        Ok(pid)
    }

    fn free_level(&mut self, node: PageId) -> Result<()> {
        self.buffer.free_page(node)
    }

    fn get_slot(&mut self, node: PageId, idx: usize) -> Result<RadixSlot<PageId>> {
        let handle = self.buffer.fetch_page(node)?;
        let page = handle.read();
        Ok(RadixLevelView::new(&page).slot(idx))
    }

    fn set_slot(&mut self, node: PageId, idx: usize, slot: RadixSlot<PageId>) -> Result<()> {
        let handle = self.buffer.fetch_page(node)?;
        let mut page = handle.write();
        RadixLevel::attach(&mut page).set_slot(idx, slot);
        Ok(())
    }

    fn set_parent(&mut self, node: PageId, parent: Option<PageId>) -> Result<()> {
        let handle = self.buffer.fetch_page(node)?;
        let mut page = handle.write();
        RadixLevel::attach(&mut page).set_parent(parent.unwrap_or(PageId::INVALID));
        Ok(())
    }

    fn populated_count(&mut self, node: PageId) -> Result<usize> {
        let handle = self.buffer.fetch_page(node)?;
        let page = handle.read();
        Ok(RadixLevelView::new(&page).populated_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::device::MemoryBlockDevice;
    use crate::radix::Trie;
    use crate::types::PAGE_SIZE;

    fn trie() -> Trie<u32, PagedModel<MemoryBlockDevice>> {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 16).unwrap();
        Trie::new(PagedModel::new(bm, RadixConfig::default()))
    }

    #[test]
    fn paged_trie_roundtrips_through_eviction() {
        let mut t = trie();
        for k in 0..2_000u32 {
            t.set(k, k + 1).unwrap();
        }
        for k in 0..2_000u32 {
            assert_eq!(t.get(k).unwrap(), Some(k + 1));
        }
    }

    #[test]
    fn paged_trie_remove_frees_levels() {
        let mut t = trie();
        t.set(10, 1).unwrap();
        t.set(70_000, 2).unwrap();
        assert!(t.remove(70_000).unwrap());
        assert_eq!(t.get(70_000).unwrap(), None);
        assert_eq!(t.get(10).unwrap(), Some(1));
    }
}
