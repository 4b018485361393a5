//! Buffer manager: pins pages in memory, evicts by LRU among unpinned frames.
//!
//! The system is single-threaded, so there is no `parking_lot::RwLock` here
//! unlike a concurrent buffer pool. Interior mutability is scoped to one
//! `Rc<RefCell<Inner<D>>>` shared between the manager handle and every
//! [`PageHandle`] it hands out, which is what lets more than one page be
//! pinned at a time (a B-tree split touches a parent and a child
//! simultaneously) without the manager itself needing `&mut` borrowed for
//! the handles' whole lifetime.

use super::lru::LruCache;
use crate::device::{BlockDevice, PageAllocator};
use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::types::PageId;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

struct Frame {
    page_id: PageId,
    data: PageBuf,
    pin_count: u32,
    dirty: bool,
    generation: u32,
}

impl Frame {
    fn empty() -> Self {
        Self {
            page_id: PageId::INVALID,
            data: PageBuf::new(),
            pin_count: 0,
            dirty: false,
            generation: 0,
        }
    }
}

struct Inner<D> {
    allocator: PageAllocator<D>,
    frames: Vec<Frame>,
    page_table: HashMap<u32, usize>,
    lru: LruCache,
    unused: Vec<usize>,
}

impl<D: BlockDevice> Inner<D> {
    fn acquire_frame(&mut self) -> Result<usize> {
        if let Some(idx) = self.unused.pop() {
            return Ok(idx);
        }
        let victim = self.lru.pop_lru().ok_or_else(|| {
            debug!(frames = self.frames.len(), "buffer pool exhausted, nothing unpinned to evict");
            StorageError::BufferPoolExhausted
        })? as usize;
        let evicted_id = self.frames[victim].page_id;
        if self.frames[victim].dirty {
            let bytes = self.frames[victim].data.as_bytes().to_vec();
            self.allocator.write_page(evicted_id, &bytes)?;
            trace!(page = evicted_id.value(), frame = victim, "evicted dirty frame, wrote back");
        } else {
            trace!(page = evicted_id.value(), frame = victim, "evicted clean frame");
        }
        self.page_table.remove(&evicted_id.value());
        Ok(victim)
    }
}

/// Shared handle to the buffer manager. Cheap to clone (an `Rc` bump).
pub struct BufferManager<D>(Rc<RefCell<Inner<D>>>);

impl<D: BlockDevice> Clone for BufferManager<D> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: BlockDevice> BufferManager<D> {
    pub fn new(device: D, capacity: usize) -> Result<Self> {
        let allocator = PageAllocator::open(device)?;
        let frames = (0..capacity).map(|_| Frame::empty()).collect();
        let unused = (0..capacity).collect();
        Ok(Self(Rc::new(RefCell::new(Inner {
            allocator,
            frames,
            page_table: HashMap::new(),
            lru: LruCache::new(capacity),
            unused,
        }))))
    }

    /// Pin and return the page at `id`, loading it from the device if not cached.
    pub fn fetch_page(&self, id: PageId) -> Result<PageHandle<D>> {
        let mut inner = self.0.borrow_mut();
        if let Some(&idx) = inner.page_table.get(&id.value()) {
            if inner.frames[idx].pin_count == 0 {
                inner.lru.remove(idx as u32);
            }
            inner.frames[idx].pin_count += 1;
            let generation = inner.frames[idx].generation;
            return Ok(PageHandle {
                manager: self.0.clone(),
                frame_idx: idx,
                generation,
            });
        }

        let idx = inner.acquire_frame()?;
        let block_size = inner.allocator.block_size();
        let mut buf = vec![0u8; block_size];
        inner.allocator.read_page(id, &mut buf)?;

        let generation = {
            let frame = &mut inner.frames[idx];
            frame.data = PageBuf::from_bytes(&buf);
            frame.page_id = id;
            frame.pin_count = 1;
            frame.dirty = false;
            frame.generation = frame.generation.wrapping_add(1);
            frame.generation
        };
        inner.page_table.insert(id.value(), idx);

        Ok(PageHandle {
            manager: self.0.clone(),
            frame_idx: idx,
            generation,
        })
    }

    /// Allocate a fresh page and return it pinned, marked dirty.
    pub fn new_page(&self) -> Result<PageHandle<D>> {
        self.new_page_with(true)
    }

    /// Allocate a fresh page and return it pinned, dirty iff `mark_dirty`.
    /// Callers that will write through [`PageHandle::write`] immediately
    /// after can pass `false` here since `write` marks the frame dirty
    /// itself; this only matters for a caller that wants a clean handle to
    /// a freshly allocated page it does not intend to touch yet.
    pub fn new_page_with(&self, mark_dirty: bool) -> Result<PageHandle<D>> {
        let mut inner = self.0.borrow_mut();
        let id = inner.allocator.allocate_page()?;
        let idx = inner.acquire_frame()?;

        let generation = {
            let frame = &mut inner.frames[idx];
            frame.data = PageBuf::new();
            frame.page_id = id;
            frame.pin_count = 1;
            frame.dirty = mark_dirty;
            frame.generation = frame.generation.wrapping_add(1);
            frame.generation
        };
        inner.page_table.insert(id.value(), idx);

        Ok(PageHandle {
            manager: self.0.clone(),
            frame_idx: idx,
            generation,
        })
    }

    /// Release a page back to the device's free list. The caller must not be
    /// holding a [`PageHandle`] to `id` when calling this.
    pub fn free_page(&self, id: PageId) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if let Some(idx) = inner.page_table.remove(&id.value()) {
            debug_assert_eq!(inner.frames[idx].pin_count, 0, "freeing a pinned page");
            inner.lru.remove(idx as u32);
            inner.unused.push(idx);
            inner.frames[idx].page_id = PageId::INVALID;
        }
        inner.allocator.deallocate_page(id)
    }

    /// Write `id`'s frame back to the device if it is resident and dirty.
    /// A no-op if `id` is not currently cached or is already clean.
    pub fn flush(&self, id: PageId) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let Some(&idx) = inner.page_table.get(&id.value()) else {
            return Ok(());
        };
        if !inner.frames[idx].dirty {
            return Ok(());
        }
        let bytes = inner.frames[idx].data.as_bytes().to_vec();
        inner.allocator.write_page(id, &bytes)?;
        inner.frames[idx].dirty = false;
        trace!(page = id.value(), "flushed single frame");
        Ok(())
    }

    /// Reclaim every frame with a pin count of zero, flushing first if dirty.
    /// Unlike ordinary eviction (which only reclaims as many frames as a
    /// `fetch`/`new_page` needs), this walks every frame in the pool.
    pub fn evict_inactive(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let mut reclaimed = 0u32;
        for idx in 0..inner.frames.len() {
            if inner.frames[idx].pin_count != 0 || inner.frames[idx].page_id == PageId::INVALID {
                continue;
            }
            if inner.frames[idx].dirty {
                let id = inner.frames[idx].page_id;
                let bytes = inner.frames[idx].data.as_bytes().to_vec();
                inner.allocator.write_page(id, &bytes)?;
            }
            let evicted_id = inner.frames[idx].page_id;
            inner.page_table.remove(&evicted_id.value());
            inner.lru.remove(idx as u32);
            inner.frames[idx].page_id = PageId::INVALID;
            inner.frames[idx].dirty = false;
            inner.unused.push(idx);
            reclaimed += 1;
        }
        debug!(reclaimed, "evicted all inactive frames");
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let mut flushed = 0u32;
        for idx in 0..inner.frames.len() {
            if inner.frames[idx].dirty {
                let id = inner.frames[idx].page_id;
                let bytes = inner.frames[idx].data.as_bytes().to_vec();
                inner.allocator.write_page(id, &bytes)?;
                inner.frames[idx].dirty = false;
                flushed += 1;
            }
        }
        debug!(flushed, "flushed dirty frames");
        inner.allocator.sync()
    }

    pub fn page_count(&self) -> u32 {
        self.0.borrow().allocator.page_count()
    }

    /// Number of pages currently on the device's free list.
    pub fn free_count(&self) -> u32 {
        self.0.borrow().allocator.superblock().free_count
    }

    pub fn capacity(&self) -> usize {
        self.0.borrow().frames.len()
    }

    pub fn root(&self) -> (PageId, u32) {
        let sb = self.0.borrow().allocator.superblock();
        (sb.root_page, sb.tree_height)
    }

    pub fn set_root(&self, id: PageId, height: u32) -> Result<()> {
        self.0.borrow_mut().allocator.set_root(id, height)
    }
}

/// An RAII pin on one cached page. Dropping it unpins the frame; once the
/// pin count reaches zero the frame becomes eligible for eviction again.
pub struct PageHandle<D> {
    manager: Rc<RefCell<Inner<D>>>,
    frame_idx: usize,
    generation: u32,
}

impl<D: BlockDevice> PageHandle<D> {
    pub fn page_id(&self) -> PageId {
        self.manager.borrow().frames[self.frame_idx].page_id
    }

    pub fn read(&self) -> Ref<'_, [u8]> {
        Ref::map(self.manager.borrow(), |inner| {
            inner.frames[self.frame_idx].data.as_bytes()
        })
    }

    /// Borrow the page mutably, marking the frame dirty.
    pub fn write(&self) -> RefMut<'_, [u8]> {
        let mut inner = self.manager.borrow_mut();
        inner.frames[self.frame_idx].dirty = true;
        RefMut::map(inner, |inner| inner.frames[self.frame_idx].data.as_bytes_mut())
    }

    pub fn is_dirty(&self) -> bool {
        self.manager.borrow().frames[self.frame_idx].dirty
    }
}

impl<D> Clone for PageHandle<D> {
    fn clone(&self) -> Self {
        {
            let mut inner = self.manager.borrow_mut();
            inner.frames[self.frame_idx].pin_count += 1;
        }
        Self {
            manager: self.manager.clone(),
            frame_idx: self.frame_idx,
            generation: self.generation,
        }
    }
}

impl<D> Drop for PageHandle<D> {
    fn drop(&mut self) {
        let mut inner = self.manager.borrow_mut();
        if inner.frames[self.frame_idx].generation != self.generation {
            // Frame was already recycled out from under a stale handle; nothing to unpin.
            return;
        }
        let pin_count = {
            let frame = &mut inner.frames[self.frame_idx];
            frame.pin_count = frame.pin_count.saturating_sub(1);
            frame.pin_count
        };
        if pin_count == 0 {
            inner.lru.access(self.frame_idx as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use crate::types::PAGE_SIZE;

    fn manager(capacity: usize) -> BufferManager<MemoryBlockDevice> {
        BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), capacity).unwrap()
    }

    #[test]
    fn new_page_is_dirty_and_fetchable() {
        let bm = manager(4);
        let id = {
            let handle = bm.new_page().unwrap();
            handle.write()[0] = 42;
            handle.page_id()
        };
        bm.flush_all().unwrap();
        let handle = bm.fetch_page(id).unwrap();
        assert_eq!(handle.read()[0], 42);
    }

    #[test]
    fn eviction_flushes_dirty_frames() {
        let bm = manager(2);
        let a = bm.new_page().unwrap();
        a.write()[0] = 1;
        let a_id = a.page_id();
        drop(a);

        let b = bm.new_page().unwrap();
        b.write()[0] = 2;
        drop(b);

        // A third page forces eviction of whichever of a/b is least recently used.
        let c = bm.new_page().unwrap();
        c.write()[0] = 3;
        drop(c);

        let reread = bm.fetch_page(a_id).unwrap();
        assert_eq!(reread.read()[0], 1);
    }

    #[test]
    fn exhausted_pool_errors_when_everything_is_pinned() {
        let bm = manager(1);
        let _first = bm.new_page().unwrap();
        assert!(matches!(
            bm.new_page(),
            Err(StorageError::BufferPoolExhausted)
        ));
    }

    /// Scenario: with a 2-frame pool, create page A (write its header),
    /// drop; create page B, drop; flush everything; fetching A again must
    /// force eviction of a resident frame, and the returned page's header
    /// must match what was written.
    #[test]
    fn eviction_correctness_with_two_frame_pool() {
        use crate::page::PageHeader;
        use crate::types::page_kind;

        let bm = manager(2);

        let handle_a = bm.new_page().unwrap();
        let pid_a = handle_a.page_id();
        {
            let mut page = handle_a.write();
            PageHeader::init(page_kind::BPT_LEAF, page.len(), pid_a, 0).write(&mut page);
        }
        drop(handle_a);

        let handle_b = bm.new_page().unwrap();
        drop(handle_b);

        bm.flush_all().unwrap();

        let handle_a_again = bm.fetch_page(pid_a).unwrap();
        let page = handle_a_again.read();
        let header = PageHeader::read(&page);
        assert_eq!(header.kind, page_kind::BPT_LEAF);
        assert_eq!(header.self_pid(), pid_a);
    }

    #[test]
    fn flush_writes_back_single_page_only() {
        let bm = manager(4);
        let a = bm.new_page().unwrap();
        a.write()[0] = 9;
        let a_id = a.page_id();
        let b = bm.new_page().unwrap();
        b.write()[0] = 7;
        let b_id = b.page_id();
        drop(a);
        drop(b);

        bm.flush(a_id).unwrap();
        assert!(!bm.fetch_page(a_id).unwrap().is_dirty());
        assert!(bm.fetch_page(b_id).unwrap().is_dirty());
    }

    #[test]
    fn evict_inactive_reclaims_unpinned_frames() {
        let bm = manager(2);
        let a = bm.new_page().unwrap();
        a.write()[0] = 1;
        let a_id = a.page_id();
        drop(a);

        bm.evict_inactive().unwrap();
        // Both frames are now free; a fresh page should not report exhaustion.
        let b = bm.new_page().unwrap();
        let c = bm.new_page().unwrap();
        assert_ne!(b.page_id(), c.page_id());
        drop(b);
        drop(c);

        let reread = bm.fetch_page(a_id).unwrap();
        assert_eq!(reread.read()[0], 1);
    }

    #[test]
    fn new_page_with_clean_flag_is_not_dirty() {
        let bm = manager(2);
        let handle = bm.new_page_with(false).unwrap();
        assert!(!handle.is_dirty());
    }

    #[test]
    fn multiple_pages_pinned_simultaneously() {
        let bm = manager(4);
        let a = bm.new_page().unwrap();
        let b = bm.new_page().unwrap();
        assert_ne!(a.page_id(), b.page_id());
    }
}
