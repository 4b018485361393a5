//! Stable (bitmap-indexed) slot directory: fixed-size records at fixed, durable
//! indices. Unlike [`super::fixed::FixedDirectory`], a slot's index never moves
//! once assigned — callers hand out `(page_id, slot_index)` pairs as durable
//! object ids, so erasing slot 3 must not renumber slot 4 into its place.
//! Occupancy is tracked with a bitmap instead of a linked free list so the
//! first-free-slot scan (used by the slab allocator to pick where a new
//! object lands) is a simple bit scan.

const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy)]
struct Header {
    slot_size: u16,
    capacity: u16,
    occupied: u16,
}

impl Header {
    fn read(body: &[u8]) -> Self {
        Self {
            slot_size: u16::from_le_bytes([body[0], body[1]]),
            capacity: u16::from_le_bytes([body[2], body[3]]),
            occupied: u16::from_le_bytes([body[4], body[5]]),
        }
    }

    fn write(&self, body: &mut [u8]) {
        body[0..2].copy_from_slice(&self.slot_size.to_le_bytes());
        body[2..4].copy_from_slice(&self.capacity.to_le_bytes());
        body[4..6].copy_from_slice(&self.occupied.to_le_bytes());
    }
}

fn bitmap_bytes(capacity: usize) -> usize {
    (capacity + 7) / 8
}

pub struct StableDirectory<'a> {
    body: &'a mut [u8],
}

impl<'a> StableDirectory<'a> {
    pub fn init(body: &'a mut [u8], slot_size: u16) -> Self {
        // Solve capacity so header + bitmap + slots fit: capacity*slot_size + ceil(capacity/8) <= remaining.
        let remaining = body.len() - HEADER_SIZE;
        let mut capacity = (remaining * 8 / (slot_size as usize * 8 + 1)) as u16;
        while HEADER_SIZE + bitmap_bytes(capacity as usize) + capacity as usize * slot_size as usize
            > body.len()
        {
            capacity -= 1;
        }

        let header = Header {
            slot_size,
            capacity,
            occupied: 0,
        };
        header.write(body);
        let bm_start = HEADER_SIZE;
        let bm_end = bm_start + bitmap_bytes(capacity as usize);
        for b in &mut body[bm_start..bm_end] {
            *b = 0;
        }
        Self { body }
    }

    pub fn attach(body: &'a mut [u8]) -> Self {
        Self { body }
    }

    fn header(&self) -> Header {
        Header::read(self.body)
    }

    fn set_header(&mut self, header: Header) {
        header.write(self.body);
    }

    fn bitmap_range(&self) -> std::ops::Range<usize> {
        let cap = self.header().capacity as usize;
        HEADER_SIZE..HEADER_SIZE + bitmap_bytes(cap)
    }

    fn slots_start(&self) -> usize {
        self.bitmap_range().end
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn occupied(&self) -> usize {
        self.header().occupied as usize
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        let bm = self.bitmap_range().start + idx / 8;
        (self.body[bm] >> (idx % 8)) & 1 == 1
    }

    fn set_bit(&mut self, idx: usize, value: bool) {
        let bm = self.bitmap_range().start + idx / 8;
        if value {
            self.body[bm] |= 1 << (idx % 8);
        } else {
            self.body[bm] &= !(1 << (idx % 8));
        }
    }

    /// First unoccupied index, if any.
    pub fn first_free(&self) -> Option<usize> {
        let cap = self.capacity();
        (0..cap).find(|&i| !self.is_occupied(i))
    }

    fn slot_offset(&self, idx: usize) -> usize {
        self.slots_start() + idx * self.header().slot_size as usize
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        debug_assert!(self.is_occupied(idx));
        let off = self.slot_offset(idx);
        let size = self.header().slot_size as usize;
        &self.body[off..off + size]
    }

    /// Place `bytes` at `idx`, marking it occupied. `idx` must currently be free.
    pub fn put(&mut self, idx: usize, bytes: &[u8]) {
        debug_assert!(!self.is_occupied(idx));
        let off = self.slot_offset(idx);
        let size = self.header().slot_size as usize;
        debug_assert!(bytes.len() <= size);
        self.body[off..off + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.body[off + bytes.len()..off + size] {
            *b = 0;
        }
        self.set_bit(idx, true);
        let mut h = self.header();
        h.occupied += 1;
        self.set_header(h);
    }

    /// Overwrite an already-occupied slot.
    pub fn update(&mut self, idx: usize, bytes: &[u8]) {
        debug_assert!(self.is_occupied(idx));
        let off = self.slot_offset(idx);
        let size = self.header().slot_size as usize;
        debug_assert!(bytes.len() <= size);
        self.body[off..off + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.body[off + bytes.len()..off + size] {
            *b = 0;
        }
    }

    /// Clear `idx`. Its index remains reserved (stable) until reused by `put`.
    pub fn remove(&mut self, idx: usize) {
        debug_assert!(self.is_occupied(idx));
        self.set_bit(idx, false);
        let mut h = self.header();
        h.occupied -= 1;
        self.set_header(h);
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity()).filter(move |&i| self.is_occupied(i))
    }
}

/// Read-only view of a stable directory, for callers holding only a shared
/// borrow of the page (e.g. a slab lookup that must not mark the page dirty).
pub struct StableDirectoryView<'a> {
    body: &'a [u8],
}

impl<'a> StableDirectoryView<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    fn header(&self) -> Header {
        Header::read(self.body)
    }

    fn bitmap_range(&self) -> std::ops::Range<usize> {
        let cap = self.header().capacity as usize;
        HEADER_SIZE..HEADER_SIZE + bitmap_bytes(cap)
    }

    fn slots_start(&self) -> usize {
        self.bitmap_range().end
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn occupied(&self) -> usize {
        self.header().occupied as usize
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        let bm = self.bitmap_range().start + idx / 8;
        (self.body[bm] >> (idx % 8)) & 1 == 1
    }

    fn slot_offset(&self, idx: usize) -> usize {
        self.slots_start() + idx * self.header().slot_size as usize
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        debug_assert!(self.is_occupied(idx));
        let off = self.slot_offset(idx);
        let size = self.header().slot_size as usize;
        &self.body[off..off + size]
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity()).filter(move |&i| self.is_occupied(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_keeps_index_stable() {
        let mut buf = vec![0u8; 128];
        let mut dir = StableDirectory::init(&mut buf, 16);
        let a = dir.first_free().unwrap();
        dir.put(a, b"first");
        let b = dir.first_free().unwrap();
        dir.put(b, b"second");
        assert_ne!(a, b);
        dir.remove(a);
        assert!(!dir.is_occupied(a));
        assert!(dir.is_occupied(b));
        assert_eq!(&dir.get(b)[..6], b"second");
        // a's slot is free again but b keeps its own stable index.
        assert_eq!(dir.first_free(), Some(a));
    }

    #[test]
    fn iter_occupied_reports_only_live_slots() {
        let mut buf = vec![0u8; 128];
        let mut dir = StableDirectory::init(&mut buf, 16);
        let i0 = dir.first_free().unwrap();
        dir.put(i0, b"x");
        let i1 = dir.first_free().unwrap();
        dir.put(i1, b"y");
        dir.remove(i0);
        let occupied: Vec<usize> = dir.iter_occupied().collect();
        assert_eq!(occupied, vec![i1]);
    }
}
