//! Long-store: a chained-page byte stream for payloads too large to live in
//! a single slot.
//!
//! A chain is anchored by a head page holding the logical `total_size` and a
//! link to the first chunk; chunks link to each other in turn. Reads and
//! writes each carry their own cursor (`gpos`, `spos`) so interleaving a read
//! and a write doesn't disturb either one's position.

mod page;

use crate::buffer::BufferManager;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::types::{page_kind, PageId};
use tracing::debug;

use page::{ChunkPage, HeaderPage, CHUNK_BODY_OFFSET, HEAD_BODY_OFFSET};

/// A position in the chain: the page it names, the byte offset within that
/// page's body, and the logical offset from the start of the chain.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    pid: PageId,
    offset: usize,
    logical: usize,
}

/// Handle to one long-store chain.
pub struct LongStoreHandle<D> {
    buffer: BufferManager<D>,
    header: PageId,
    gpos: Cursor,
    spos: Cursor,
}

impl<D: BlockDevice> LongStoreHandle<D> {
    /// Allocate a fresh, empty chain.
    pub fn create(buffer: BufferManager<D>) -> Result<Self> {
        let handle = buffer.new_page()?;
        let pid = handle.page_id();
        {
            let mut page = handle.write();
            HeaderPage::init(&mut page, page_kind::LONG_STORE_HEAD, pid);
        }
        let start = Cursor { pid, offset: 0, logical: 0 };
        Ok(Self { buffer, header: pid, gpos: start, spos: start })
    }

    /// Open an existing chain by its head page id.
    pub fn open(buffer: BufferManager<D>, header: PageId) -> Result<Self> {
        let start = Cursor { pid: header, offset: 0, logical: 0 };
        Ok(Self { buffer, header, gpos: start, spos: start })
    }

    pub fn header_pid(&self) -> PageId {
        self.header
    }

    pub fn total_size(&self) -> Result<usize> {
        let handle = self.buffer.fetch_page(self.header)?;
        Ok(HeaderPage::total_size(&handle.read()) as usize)
    }

    fn is_head(&self, pid: PageId) -> bool {
        pid == self.header
    }

    fn page_capacity(&self, pid: PageId) -> Result<usize> {
        let handle = self.buffer.fetch_page(pid)?;
        let len = handle.read().len();
        Ok(if self.is_head(pid) {
            HeaderPage::body_capacity(len)
        } else {
            ChunkPage::body_capacity(len)
        })
    }

    fn page_size(&self, pid: PageId) -> Result<usize> {
        let handle = self.buffer.fetch_page(pid)?;
        let page = handle.read();
        Ok(if self.is_head(pid) {
            HeaderPage::size(&page) as usize
        } else {
            ChunkPage::size(&page) as usize
        })
    }

    fn set_page_size(&self, pid: PageId, size: usize) -> Result<()> {
        let handle = self.buffer.fetch_page(pid)?;
        let mut page = handle.write();
        if self.is_head(pid) {
            HeaderPage::set_size(&mut page, size as u16);
        } else {
            ChunkPage::set_size(&mut page, size as u16);
        }
        Ok(())
    }

    fn page_next(&self, pid: PageId) -> Result<PageId> {
        let handle = self.buffer.fetch_page(pid)?;
        let page = handle.read();
        Ok(if self.is_head(pid) { HeaderPage::next(&page) } else { ChunkPage::next(&page) })
    }

    fn set_total_size(&self, v: usize) -> Result<()> {
        let handle = self.buffer.fetch_page(self.header)?;
        HeaderPage::set_total_size(&mut handle.write(), v as u32);
        Ok(())
    }

    fn set_last(&self, pid: PageId) -> Result<()> {
        let handle = self.buffer.fetch_page(self.header)?;
        HeaderPage::set_last(&mut handle.write(), pid);
        Ok(())
    }

    /// Allocate a new chunk, link it after `after`, and record it as the
    /// chain's tail.
    fn alloc_chunk(&mut self, after: PageId) -> Result<PageId> {
        let handle = self.buffer.new_page()?;
        let pid = handle.page_id();
        {
            let mut page = handle.write();
            ChunkPage::init(&mut page, page_kind::LONG_STORE_CHUNK, pid, after);
        }
        {
            let after_handle = self.buffer.fetch_page(after)?;
            let mut after_page = after_handle.write();
            if self.is_head(after) {
                HeaderPage::set_next(&mut after_page, pid);
            } else {
                ChunkPage::set_next(&mut after_page, pid);
            }
        }
        self.set_last(pid)?;
        debug!(chunk = pid.value(), after = after.value(), "allocated long-store chunk");
        Ok(pid)
    }

    fn writable_capacity(&self, cursor: Cursor) -> Result<usize> {
        Ok(self.page_capacity(cursor.pid)? - cursor.offset)
    }

    fn readable_bytes(&self, cursor: Cursor) -> Result<usize> {
        Ok(self.page_size(cursor.pid)?.saturating_sub(cursor.offset))
    }

    fn body_offset(&self, pid: PageId) -> usize {
        if self.is_head(pid) { HEAD_BODY_OFFSET } else { CHUNK_BODY_OFFSET }
    }

    /// Step past the end of `cursor`'s page: onto the next chunk if one
    /// exists, allocating a fresh one when `grow` allows it.
    fn advance_to_next(&mut self, cursor: Cursor, grow: bool) -> Result<Option<Cursor>> {
        let next = self.page_next(cursor.pid)?;
        if next.is_valid() {
            return Ok(Some(Cursor { pid: next, offset: 0, logical: cursor.logical }));
        }
        if !grow {
            return Ok(None);
        }
        let pid = self.alloc_chunk(cursor.pid)?;
        Ok(Some(Cursor { pid, offset: 0, logical: cursor.logical }))
    }

    /// Shared traversal used by both `write` and `append`: walk forward from
    /// `cursor`, filling pages and allocating new chunks as needed.
    fn write_from(&mut self, mut cursor: Cursor, buf: &[u8]) -> Result<Cursor> {
        let mut written = 0;
        while written < buf.len() {
            if self.writable_capacity(cursor)? == 0 {
                cursor = self
                    .advance_to_next(cursor, true)?
                    .expect("growth always yields a next page or errors");
                continue;
            }
            let take = self.writable_capacity(cursor)?.min(buf.len() - written);
            let base = self.body_offset(cursor.pid);
            let cur_size = self.page_size(cursor.pid)?;
            {
                let handle = self.buffer.fetch_page(cursor.pid)?;
                let mut page = handle.write();
                page[base + cursor.offset..base + cursor.offset + take]
                    .copy_from_slice(&buf[written..written + take]);
            }
            let new_size = (cursor.offset + take).max(cur_size);
            self.set_page_size(cursor.pid, new_size)?;
            cursor.offset += take;
            cursor.logical += take;
            written += take;
        }
        Ok(cursor)
    }

    /// Shared traversal used by `read`: walk forward copying out live bytes,
    /// stopping at the end of the chain without growing it.
    fn read_into(&mut self, mut cursor: Cursor, buf: &mut [u8]) -> Result<(usize, Cursor)> {
        let mut read = 0;
        while read < buf.len() {
            let avail = self.readable_bytes(cursor)?;
            if avail == 0 {
                match self.advance_to_next(cursor, false)? {
                    Some(next) => {
                        cursor = next;
                        continue;
                    }
                    None => break,
                }
            }
            let take = avail.min(buf.len() - read);
            let base = self.body_offset(cursor.pid);
            {
                let handle = self.buffer.fetch_page(cursor.pid)?;
                let page = handle.read();
                buf[read..read + take]
                    .copy_from_slice(&page[base + cursor.offset..base + cursor.offset + take]);
            }
            cursor.offset += take;
            cursor.logical += take;
            read += take;
        }
        Ok((read, cursor))
    }

    /// Locate the `(pid, offset)` cursor for logical offset `at`, walking
    /// the chain from the head. Bounded by the number of chunks.
    fn locate(&self, at: usize) -> Result<Cursor> {
        let mut pid = self.header;
        let mut remaining = at;
        let mut logical_base = 0usize;
        loop {
            let size = self.page_size(pid)?;
            if remaining <= size {
                return Ok(Cursor { pid, offset: remaining, logical: logical_base + remaining });
            }
            remaining -= size;
            logical_base += size;
            let next = self.page_next(pid)?;
            if !next.is_valid() {
                return Ok(Cursor { pid, offset: size, logical: logical_base });
            }
            pid = next;
        }
    }

    /// Extend the chain from its current end by `buf`, growing as needed.
    /// The write cursor becomes the new end of the chain.
    pub fn append(&mut self, buf: &[u8]) -> Result<usize> {
        let total = self.total_size()?;
        let start = self.locate(total)?;
        let end = self.write_from(start, buf)?;
        self.set_total_size(total.max(end.logical))?;
        self.spos = end;
        Ok(buf.len())
    }

    /// Overwrite from the write cursor, growing the chain if the write runs
    /// past the current logical size.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let start = self.spos;
        let total = self.total_size()?;
        let end = self.write_from(start, buf)?;
        self.set_total_size(total.max(end.logical))?;
        self.spos = end;
        Ok(buf.len())
    }

    /// Read up to `buf.len()` bytes from the read cursor, stopping at the
    /// end of the chain.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (n, end) = self.read_into(self.gpos, buf)?;
        self.gpos = end;
        Ok(n)
    }

    /// Reposition the read cursor to a logical offset.
    pub fn seekg(&mut self, offset: usize) -> Result<()> {
        self.gpos = self.locate(offset)?;
        Ok(())
    }

    /// Reposition the write cursor to a logical offset.
    pub fn seekp(&mut self, offset: usize) -> Result<()> {
        self.spos = self.locate(offset)?;
        Ok(())
    }

    /// Grow the chain with zero bytes until `offset` is addressable.
    pub fn expand_to(&mut self, offset: usize) -> Result<()> {
        let total = self.total_size()?;
        if offset <= total {
            return Ok(());
        }
        let zeros = vec![0u8; offset - total];
        self.append(&zeros)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use crate::types::PAGE_SIZE;

    fn store() -> LongStoreHandle<MemoryBlockDevice> {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 4).unwrap();
        LongStoreHandle::create(bm).unwrap()
    }

    #[test]
    fn append_then_read_roundtrips() {
        let mut s = store();
        let data = vec![7u8; 12_000];
        s.append(&data).unwrap();
        assert_eq!(s.total_size().unwrap(), 12_000);

        s.seekg(0).unwrap();
        let mut back = vec![0u8; 12_000];
        let n = s.read(&mut back).unwrap();
        assert_eq!(n, 12_000);
        assert_eq!(back, data);
    }

    #[test]
    fn write_overwrites_without_growing_total_size() {
        let mut s = store();
        s.append(&[1u8; 1000]).unwrap();
        s.seekp(100).unwrap();
        s.write(&[2u8; 50]).unwrap();
        assert_eq!(s.total_size().unwrap(), 1000);

        s.seekg(90).unwrap();
        let mut buf = vec![0u8; 70];
        s.read(&mut buf).unwrap();
        assert_eq!(&buf[..10], &[1u8; 10]);
        assert_eq!(&buf[10..60], &[2u8; 50]);
        assert_eq!(&buf[60..], &[1u8; 10]);
    }

    #[test]
    fn write_past_end_grows_chain() {
        let mut s = store();
        s.append(&[1u8; 10]).unwrap();
        s.seekp(5).unwrap();
        s.write(&[9u8; 9_000]).unwrap();
        assert_eq!(s.total_size().unwrap(), 9_005);
    }

    #[test]
    fn expand_to_pads_with_zeros() {
        let mut s = store();
        s.append(&[3u8; 5]).unwrap();
        s.expand_to(20).unwrap();
        assert_eq!(s.total_size().unwrap(), 20);

        s.seekg(5).unwrap();
        let mut buf = vec![0u8; 15];
        s.read(&mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 15]);
    }

    #[test]
    fn read_and_write_cursors_are_independent() {
        let mut s = store();
        s.append(&[1u8; 100]).unwrap();
        s.seekg(10).unwrap();
        s.seekp(50).unwrap();
        s.write(&[2u8; 5]).unwrap();

        let mut buf = vec![0u8; 5];
        s.read(&mut buf).unwrap();
        assert_eq!(buf, vec![1u8; 5]);
    }

    #[test]
    fn two_chains_do_not_interfere() {
        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 4).unwrap();
        let mut a = LongStoreHandle::create(bm.clone()).unwrap();
        let mut b = LongStoreHandle::create(bm).unwrap();

        let a_data = vec![0xAAu8; 15_000];
        let b_data = vec![0xBBu8; 5_500];
        a.append(&a_data).unwrap();
        b.append(&b_data).unwrap();

        a.seekg(0).unwrap();
        b.seekg(0).unwrap();
        let mut a_back = vec![0u8; 15_000];
        let mut b_back = vec![0u8; 5_500];
        a.read(&mut a_back).unwrap();
        b.read(&mut b_back).unwrap();
        assert_eq!(a_back, a_data);
        assert_eq!(b_back, b_data);
    }

    /// Scenario: two chains over independent 4-frame pools, written with
    /// random-length seeded data, flushed, then read back byte-for-byte.
    #[test]
    fn two_chains_over_separate_small_pools_survive_flush_and_reopen() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);

        let bm_a = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 4).unwrap();
        let bm_b = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 4).unwrap();
        let mut a = LongStoreHandle::create(bm_a.clone()).unwrap();
        let mut b = LongStoreHandle::create(bm_b.clone()).unwrap();

        let len_a = rng.gen_range(10_000..=20_000);
        let len_b = rng.gen_range(5_000..=6_000);
        let data_a: Vec<u8> = (0..len_a).map(|_| rng.gen()).collect();
        let data_b: Vec<u8> = (0..len_b).map(|_| rng.gen()).collect();

        a.append(&data_a).unwrap();
        b.append(&data_b).unwrap();
        bm_a.flush_all().unwrap();
        bm_b.flush_all().unwrap();

        a.seekg(0).unwrap();
        let mut back_a = vec![0u8; len_a];
        assert_eq!(a.read(&mut back_a).unwrap(), len_a);
        assert_eq!(back_a, data_a);

        b.seekg(0).unwrap();
        let mut back_b = vec![0u8; len_b];
        assert_eq!(b.read(&mut back_b).unwrap(), len_b);
        assert_eq!(back_b, data_b);
    }
}
