//! Slab store: many fixed-size objects packed onto shared pages.
//!
//! Pages with free slots form a doubly-linked list, rooted wherever the
//! caller's [`RootManager`] keeps it. Allocating pops the head page, takes
//! its first free slot, and unlinks the page once it fills; freeing an
//! object links its page back in if it had been full, and returns the page
//! to the underlying allocator once it empties out completely.

mod page;

use crate::buffer::BufferManager;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::page::{StableDirectory, StableDirectoryView};
use crate::types::{page_kind, PageId};
use tracing::debug;

/// A stable identifier for one object in a [`SlabStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabId {
    pub page: PageId,
    pub slot: u16,
}

/// Where the slab store's free-page-list head lives. The default in-memory
/// implementation is fine when the store's owner already tracks its own
/// root (e.g. in a superblock field); implement this trait to persist it
/// elsewhere instead.
pub trait RootManager {
    fn head(&self) -> Option<PageId>;
    fn set_head(&mut self, head: Option<PageId>);
}

/// A [`RootManager`] that simply keeps the head in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryRoot(Option<PageId>);

impl RootManager for InMemoryRoot {
    fn head(&self) -> Option<PageId> {
        self.0
    }

    fn set_head(&mut self, head: Option<PageId>) {
        self.0 = head;
    }
}

/// Fixed-size object store backed by pages of `SLOT_SIZE`-byte slots.
pub struct SlabStore<D, R = InMemoryRoot, const SLOT_SIZE: u16 = 64> {
    buffer: BufferManager<D>,
    root: R,
}

impl<D: BlockDevice, R: RootManager, const SLOT_SIZE: u16> SlabStore<D, R, SLOT_SIZE> {
    pub fn new(buffer: BufferManager<D>, root: R) -> Self {
        Self { buffer, root }
    }

    /// Unlink the free-list head and return it, linking the next page's
    /// `prev` back to nothing.
    fn pop_free_head(&mut self) -> Result<Option<PageId>> {
        let Some(head) = self.root.head() else { return Ok(None) };
        let next = {
            let handle = self.buffer.fetch_page(head)?;
            page::next(&handle.read())
        };
        if next.is_valid() {
            let handle = self.buffer.fetch_page(next)?;
            page::set_prev(&mut handle.write(), PageId::INVALID);
        }
        self.root.set_head(if next.is_valid() { Some(next) } else { None });
        Ok(Some(head))
    }

    /// Link `pid` in at the head of the free list.
    fn push_free_head(&mut self, pid: PageId) -> Result<()> {
        let old_head = self.root.head();
        {
            let handle = self.buffer.fetch_page(pid)?;
            let mut page = handle.write();
            page::set_prev(&mut page, PageId::INVALID);
            page::set_next(&mut page, old_head.unwrap_or(PageId::INVALID));
        }
        if let Some(old_head) = old_head {
            let handle = self.buffer.fetch_page(old_head)?;
            page::set_prev(&mut handle.write(), pid);
        }
        self.root.set_head(Some(pid));
        Ok(())
    }

    /// Unlink `pid` from wherever it sits in the free list.
    fn unlink(&mut self, pid: PageId) -> Result<()> {
        let (prev, next) = {
            let handle = self.buffer.fetch_page(pid)?;
            let page = handle.read();
            (page::prev(&page), page::next(&page))
        };
        if prev.is_valid() {
            let handle = self.buffer.fetch_page(prev)?;
            page::set_next(&mut handle.write(), next);
        } else if self.root.head() == Some(pid) {
            self.root.set_head(if next.is_valid() { Some(next) } else { None });
        }
        if next.is_valid() {
            let handle = self.buffer.fetch_page(next)?;
            page::set_prev(&mut handle.write(), prev);
        }
        Ok(())
    }

    /// Store `bytes` (must fit in `SLOT_SIZE` bytes) and return its id.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<SlabId> {
        if let Some(pid) = self.root.head() {
            let (slot, became_full) = {
                let handle = self.buffer.fetch_page(pid)?;
                let mut page = handle.write();
                let mut dir = StableDirectory::attach(page::directory_mut(&mut page));
                let slot = dir.first_free().expect("free-list page must have a free slot");
                dir.put(slot, bytes);
                (slot, dir.occupied() == dir.capacity())
            };
            if became_full {
                self.unlink(pid)?;
                debug!(page = pid.value(), "slab page filled, unlinked from free list");
            }
            return Ok(SlabId { page: pid, slot: slot as u16 });
        }

        let handle = self.buffer.new_page()?;
        let pid = handle.page_id();
        {
            let mut page = handle.write();
            page::init(&mut page, page_kind::SLAB_STORE, pid, SLOT_SIZE);
            let mut dir = StableDirectory::attach(page::directory_mut(&mut page));
            dir.put(0, bytes);
        }
        self.root.set_head(Some(pid));
        debug!(page = pid.value(), "allocated fresh slab page");
        Ok(SlabId { page: pid, slot: 0 })
    }

    /// Read the bytes stored at `id`.
    pub fn get(&self, id: SlabId) -> Result<Vec<u8>> {
        let handle = self.buffer.fetch_page(id.page)?;
        let page = handle.read();
        let dir = StableDirectoryView::new(page::directory(&page));
        Ok(dir.get(id.slot as usize).to_vec())
    }

    /// Overwrite the bytes stored at `id`.
    pub fn update(&self, id: SlabId, bytes: &[u8]) -> Result<()> {
        let handle = self.buffer.fetch_page(id.page)?;
        let mut page = handle.write();
        let mut dir = StableDirectory::attach(page::directory_mut(&mut page));
        dir.update(id.slot as usize, bytes);
        Ok(())
    }

    /// Free the object at `id`, returning its page to the underlying
    /// allocator once the page empties out entirely.
    pub fn remove(&mut self, id: SlabId) -> Result<()> {
        let (was_full, now_empty) = {
            let handle = self.buffer.fetch_page(id.page)?;
            let mut page = handle.write();
            let mut dir = StableDirectory::attach(page::directory_mut(&mut page));
            let was_full = dir.occupied() == dir.capacity();
            dir.remove(id.slot as usize);
            (was_full, dir.occupied() == 0)
        };

        if now_empty {
            self.unlink(id.page)?;
            self.buffer.free_page(id.page)?;
            debug!(page = id.page.value(), "slab page emptied, returned to allocator");
        } else if was_full {
            self.push_free_head(id.page)?;
            debug!(page = id.page.value(), "slab page had a slot freed, relinked into free list");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use crate::types::PAGE_SIZE;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn store() -> SlabStore<MemoryBlockDevice, InMemoryRoot, 64> {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 16).unwrap();
        SlabStore::new(bm, InMemoryRoot::default())
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut s = store();
        let id = s.insert(b"hello slab").unwrap();
        assert_eq!(s.get(id).unwrap(), b"hello slab");
    }

    #[test]
    fn update_overwrites_in_place() {
        let mut s = store();
        let id = s.insert(b"before").unwrap();
        s.update(id, b"after!").unwrap();
        assert_eq!(s.get(id).unwrap(), b"after!");
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut s = store();
        let a = s.insert(b"a").unwrap();
        s.remove(a).unwrap();
        let b = s.insert(b"b").unwrap();
        assert_eq!(b.page, a.page);
        assert_eq!(s.get(b).unwrap(), b"b");
    }

    #[test]
    fn filling_a_page_allocates_a_new_one() {
        let mut s = store();
        let mut ids = Vec::new();
        let first_page = s.insert(b"seed").unwrap().page;
        ids.push(s.insert(b"seed").unwrap());
        loop {
            let id = s.insert(b"x").unwrap();
            let wrapped = id.page != first_page;
            ids.push(id);
            if wrapped {
                break;
            }
        }
        assert!(ids.iter().any(|id| id.page != first_page));
    }

    #[test]
    fn emptying_a_page_returns_it_to_the_allocator() {
        let mut s = store();
        let id = s.insert(b"only object on this page").unwrap();
        s.remove(id).unwrap();
        assert!(s.root.head().is_none());
    }

    #[test]
    fn stress_many_objects_random_destroy_order() {
        let mut s = store();
        let mut rng = StdRng::seed_from_u64(0xBEEF);
        let mut ids: Vec<(SlabId, Vec<u8>)> = (0..1_000)
            .map(|i: u32| {
                let bytes = i.to_le_bytes().to_vec();
                let id = s.insert(&bytes).unwrap();
                (id, bytes)
            })
            .collect();

        for (id, bytes) in &ids {
            assert_eq!(&s.get(*id).unwrap(), bytes);
        }

        ids.shuffle(&mut rng);
        for (id, bytes) in &ids {
            assert_eq!(&s.get(*id).unwrap(), bytes);
            s.remove(*id).unwrap();
        }
        assert!(s.root.head().is_none());
    }
}
