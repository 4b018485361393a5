//! On-disk layout of one radix-trie level page.
//!
//! ```text
//! [ PageHeader (16) ][ parent:u32 level:u16 factor:u16 ][ factor * record(12) ]
//! ```
//!
//! Each record is a packed `(value: u32, gen: u32, kind: u8, reserved: [u8; 3])`.
//! `kind` is 0 for an empty slot, 1 for a pointer to the child level (`value`
//! holds that child's page id), 2 for a stored value (`value` holds it
//! directly). `gen` is carried in the layout but unused by this engine; it
//! exists so an external generation-counted GC could reuse the slot format.

use crate::page::{PageHeader, HEADER_SIZE};
use crate::types::PageId;

pub const SUBHEADER_SIZE: usize = 8;
const RECORD_SIZE: usize = 12;

const KIND_EMPTY: u8 = 0;
const KIND_LEVEL: u8 = 1;
const KIND_VALUE: u8 = 2;

/// One slot in a radix level: either empty, a pointer to the next level down,
/// or a stored value at the bottom of the trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadixSlot<N> {
    Empty,
    Level(N),
    Value(u32),
}

fn record_offset(idx: usize) -> usize {
    HEADER_SIZE + SUBHEADER_SIZE + idx * RECORD_SIZE
}

fn decode(raw: (u32, u8)) -> RadixSlot<PageId> {
    match raw.1 {
        KIND_LEVEL => RadixSlot::Level(PageId::new(raw.0)),
        KIND_VALUE => RadixSlot::Value(raw.0),
        _ => RadixSlot::Empty,
    }
}

fn encode(slot: RadixSlot<PageId>) -> (u32, u8) {
    match slot {
        RadixSlot::Empty => (0, KIND_EMPTY),
        RadixSlot::Level(pid) => (pid.value(), KIND_LEVEL),
        RadixSlot::Value(v) => (v, KIND_VALUE),
    }
}

/// Read-only view over a radix level page.
pub struct RadixLevelView<'a> {
    page: &'a [u8],
}

impl<'a> RadixLevelView<'a> {
    pub fn new(page: &'a [u8]) -> Self {
        Self { page }
    }

    pub fn parent(&self) -> PageId {
        PageId::new(u32::from_le_bytes(self.page[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap()))
    }

    pub fn level(&self) -> u16 {
        u16::from_le_bytes(self.page[HEADER_SIZE + 4..HEADER_SIZE + 6].try_into().unwrap())
    }

    pub fn factor(&self) -> u16 {
        u16::from_le_bytes(self.page[HEADER_SIZE + 6..HEADER_SIZE + 8].try_into().unwrap())
    }

    pub fn slot(&self, idx: usize) -> RadixSlot<PageId> {
        let off = record_offset(idx);
        let value = u32::from_le_bytes(self.page[off..off + 4].try_into().unwrap());
        let kind = self.page[off + 8];
        decode((value, kind))
    }

    pub fn populated_count(&self) -> usize {
        (0..self.factor() as usize)
            .filter(|&i| !matches!(self.slot(i), RadixSlot::Empty))
            .count()
    }
}

/// Mutable view for building and updating a radix level page.
pub struct RadixLevel<'a> {
    page: &'a mut [u8],
}

impl<'a> RadixLevel<'a> {
    /// Format a freshly allocated page as an empty level.
    pub fn init(page: &'a mut [u8], page_kind: u16, self_pid: PageId, parent: PageId, level: u16, factor: u16) -> Self {
        let header = PageHeader::init(page_kind, page.len(), self_pid, SUBHEADER_SIZE);
        header.write(page);
        page[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&parent.value().to_le_bytes());
        page[HEADER_SIZE + 4..HEADER_SIZE + 6].copy_from_slice(&level.to_le_bytes());
        page[HEADER_SIZE + 6..HEADER_SIZE + 8].copy_from_slice(&factor.to_le_bytes());
        for i in 0..factor as usize {
            let off = record_offset(i);
            page[off..off + RECORD_SIZE].fill(0);
        }
        Self { page }
    }

    /// Attach to an already-formatted level page.
    pub fn attach(page: &'a mut [u8]) -> Self {
        Self { page }
    }

    pub fn set_parent(&mut self, parent: PageId) {
        self.page[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&parent.value().to_le_bytes());
    }

    pub fn view(&self) -> RadixLevelView<'_> {
        RadixLevelView::new(self.page)
    }

    pub fn set_slot(&mut self, idx: usize, slot: RadixSlot<PageId>) {
        let (value, kind) = encode(slot);
        let off = record_offset(idx);
        self.page[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.page[off + 4..off + 8].fill(0);
        self.page[off + 8] = kind;
        self.page[off + 9..off + 12].fill(0);
    }
}

/// Bytes needed for a level page body holding `factor` records.
pub fn body_size(factor: u16) -> usize {
    SUBHEADER_SIZE + factor as usize * RECORD_SIZE
}
