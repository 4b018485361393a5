//! On-disk layout of one slab page: a doubly-linked free-list node wrapping
//! a [`StableDirectory`] of fixed-size slots.
//!
//! ```text
//! [ PageHeader (16) ][ prev:u32 next:u32 ][ StableDirectory body ]
//! ```

use crate::page::{PageHeader, StableDirectory, HEADER_SIZE};
use crate::types::PageId;

pub const SUBHEADER_SIZE: usize = 8;
pub const BODY_OFFSET: usize = HEADER_SIZE + SUBHEADER_SIZE;

pub fn init(page: &mut [u8], page_kind: u16, self_pid: PageId, slot_size: u16) {
    let header = PageHeader::init(page_kind, page.len(), self_pid, SUBHEADER_SIZE);
    header.write(page);
    set_prev(page, PageId::INVALID);
    set_next(page, PageId::INVALID);
    StableDirectory::init(&mut page[BODY_OFFSET..], slot_size);
}

pub fn prev(page: &[u8]) -> PageId {
    PageId::new(u32::from_le_bytes(page[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap()))
}

pub fn set_prev(page: &mut [u8], pid: PageId) {
    page[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&pid.value().to_le_bytes());
}

pub fn next(page: &[u8]) -> PageId {
    PageId::new(u32::from_le_bytes(page[HEADER_SIZE + 4..HEADER_SIZE + 8].try_into().unwrap()))
}

pub fn set_next(page: &mut [u8], pid: PageId) {
    page[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&pid.value().to_le_bytes());
}

pub fn directory(page: &[u8]) -> &[u8] {
    &page[BODY_OFFSET..]
}

pub fn directory_mut(page: &mut [u8]) -> &mut [u8] {
    &mut page[BODY_OFFSET..]
}
