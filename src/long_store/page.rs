//! Typed views over long-store head and chunk pages.
//!
//! ```text
//! head:  [ PageHeader (16) ][ total_size:u32 last:u32 next:u32 size:u16 reserved:u16 ][ body ]
//! chunk: [ PageHeader (16) ][ prev:u32 next:u32 size:u16 reserved:u16                ][ body ]
//! ```
//!
//! Both subheaders carry a `size`: the number of live bytes in *this page's*
//! body, distinct from the head's `total_size`, which is the sum across the
//! whole chain.

use crate::page::{PageHeader, HEADER_SIZE};
use crate::types::PageId;

pub const HEAD_SUBHEADER_SIZE: usize = 16;
pub const CHUNK_SUBHEADER_SIZE: usize = 12;

pub const HEAD_BODY_OFFSET: usize = HEADER_SIZE + HEAD_SUBHEADER_SIZE;
pub const CHUNK_BODY_OFFSET: usize = HEADER_SIZE + CHUNK_SUBHEADER_SIZE;

pub struct HeaderPage;

impl HeaderPage {
    pub fn init(page: &mut [u8], page_kind: u16, self_pid: PageId) {
        let header = PageHeader::init(page_kind, page.len(), self_pid, HEAD_SUBHEADER_SIZE);
        header.write(page);
        page[HEADER_SIZE..HEADER_SIZE + 16].fill(0);
        Self::set_next(page, PageId::INVALID);
        Self::set_last(page, self_pid);
    }

    pub fn body_capacity(page_len: usize) -> usize {
        page_len - HEAD_BODY_OFFSET
    }

    pub fn total_size(page: &[u8]) -> u32 {
        u32::from_le_bytes(page[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap())
    }

    pub fn set_total_size(page: &mut [u8], v: u32) {
        page[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn last(page: &[u8]) -> PageId {
        PageId::new(u32::from_le_bytes(page[HEADER_SIZE + 4..HEADER_SIZE + 8].try_into().unwrap()))
    }

    pub fn set_last(page: &mut [u8], pid: PageId) {
        page[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&pid.value().to_le_bytes());
    }

    pub fn next(page: &[u8]) -> PageId {
        PageId::new(u32::from_le_bytes(page[HEADER_SIZE + 8..HEADER_SIZE + 12].try_into().unwrap()))
    }

    pub fn set_next(page: &mut [u8], pid: PageId) {
        page[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&pid.value().to_le_bytes());
    }

    pub fn size(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[HEADER_SIZE + 12..HEADER_SIZE + 14].try_into().unwrap())
    }

    pub fn set_size(page: &mut [u8], v: u16) {
        page[HEADER_SIZE + 12..HEADER_SIZE + 14].copy_from_slice(&v.to_le_bytes());
    }
}

pub struct ChunkPage;

impl ChunkPage {
    pub fn init(page: &mut [u8], page_kind: u16, self_pid: PageId, prev: PageId) {
        let header = PageHeader::init(page_kind, page.len(), self_pid, CHUNK_SUBHEADER_SIZE);
        header.write(page);
        page[HEADER_SIZE..HEADER_SIZE + 12].fill(0);
        Self::set_prev(page, prev);
        Self::set_next(page, PageId::INVALID);
    }

    pub fn body_capacity(page_len: usize) -> usize {
        page_len - CHUNK_BODY_OFFSET
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

    pub fn size(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[HEADER_SIZE + 8..HEADER_SIZE + 10].try_into().unwrap())
    }

    pub fn set_size(page: &mut [u8], v: u16) {
        page[HEADER_SIZE + 8..HEADER_SIZE + 10].copy_from_slice(&v.to_le_bytes());
    }
}
