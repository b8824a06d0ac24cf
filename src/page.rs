//! In-memory page representation: 32-byte header + payload buffer.
//!
//! Layout follows spec.md §3 exactly. The accessor style (fixed byte
//! offsets, big-endian get/put helpers) is grounded on the teacher's
//! `page/page.rs::RawPage` and `page/header_page_wrapper.rs`, generalized
//! to a typed header instead of raw offset pokes scattered across callers.

use byteorder::{BigEndian, ByteOrder};
use num_enum_like::page_type_from_u8;

use crate::error::{Error, Result};

pub const HEADER_SIZE: u32 = 32;

const OFF_PAGE_TYPE: usize = 0;
const OFF_FREE_BYTES: usize = 2;
const OFF_ITEM_COUNT: usize = 4;
const OFF_PAGE_ID: usize = 8;
const OFF_PREV_PAGE_ID: usize = 12;
const OFF_NEXT_PAGE_ID: usize = 16;
const OFF_CHECKSUM: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Header = 0,
    Data = 1,
    Index = 2,
    Collection = 3,
    LargeDocument = 4,
    LargeDocumentIndex = 5,
    Free = 6,
}

mod num_enum_like {
    use super::PageType;
    pub fn page_type_from_u8(v: u8) -> Option<PageType> {
        Some(match v {
            0 => PageType::Header,
            1 => PageType::Data,
            2 => PageType::Index,
            3 => PageType::Collection,
            4 => PageType::LargeDocument,
            5 => PageType::LargeDocumentIndex,
            6 => PageType::Free,
            _ => return None,
        })
    }
}

/// A fixed-size page: 32-byte header plus `page_size - HEADER_SIZE` bytes
/// of payload. `page_id == 0` is reserved for "no page"; `page_id == 1` is
/// always the database header page.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: u32,
    pub page_type: PageType,
    pub prev_page_id: u32,
    pub next_page_id: u32,
    pub free_bytes: u16,
    pub item_count: u16,
    pub payload: Vec<u8>,
}

impl Page {
    /// A freshly-zeroed page of the given type, with `free_bytes` set to
    /// the full payload capacity.
    pub fn new(page_id: u32, page_size: u32, page_type: PageType) -> Page {
        let payload_len = (page_size - HEADER_SIZE) as usize;
        Page {
            page_id,
            page_type,
            prev_page_id: 0,
            next_page_id: 0,
            free_bytes: payload_len as u16,
            item_count: 0,
            payload: vec![0u8; payload_len],
        }
    }

    pub fn payload_capacity(page_size: u32) -> u32 {
        page_size - HEADER_SIZE
    }

    /// Serializes header + payload into a page-sized buffer, computing and
    /// embedding the CRC32 checksum in the header's reserved checksum field.
    /// The checksum lives inside the 32-byte header, never carved out of
    /// the payload, so `free_bytes + used_bytes == page_size - HEADER_SIZE`
    /// holds exactly as spec.md §3 requires.
    pub fn to_bytes(&self, page_size: u32) -> Vec<u8> {
        let mut buf = vec![0u8; page_size as usize];
        buf[OFF_PAGE_TYPE] = self.page_type as u8;
        BigEndian::write_u16(&mut buf[OFF_FREE_BYTES..], self.free_bytes);
        BigEndian::write_u16(&mut buf[OFF_ITEM_COUNT..], self.item_count);
        BigEndian::write_u32(&mut buf[OFF_PAGE_ID..], self.page_id);
        BigEndian::write_u32(&mut buf[OFF_PREV_PAGE_ID..], self.prev_page_id);
        BigEndian::write_u32(&mut buf[OFF_NEXT_PAGE_ID..], self.next_page_id);
        buf[HEADER_SIZE as usize..].copy_from_slice(&self.payload);

        let checksum = checksum_excluding_field(&buf, OFF_CHECKSUM);
        BigEndian::write_u32(&mut buf[OFF_CHECKSUM..], checksum);
        buf
    }

    /// Parses a page-sized buffer, validating its checksum.
    pub fn from_bytes(buf: &[u8]) -> Result<Page> {
        let page_size = buf.len() as u32;
        let page_id = BigEndian::read_u32(&buf[OFF_PAGE_ID..]);

        let stored_checksum = BigEndian::read_u32(&buf[OFF_CHECKSUM..]);
        let actual_checksum = checksum_excluding_field(buf, OFF_CHECKSUM);
        if stored_checksum != actual_checksum {
            return Err(Error::PageChecksumMismatch(page_id));
        }

        let page_type = page_type_from_u8(buf[OFF_PAGE_TYPE]).ok_or(Error::PageChecksumMismatch(page_id))?;
        let free_bytes = BigEndian::read_u16(&buf[OFF_FREE_BYTES..]);
        let item_count = BigEndian::read_u16(&buf[OFF_ITEM_COUNT..]);
        let prev_page_id = BigEndian::read_u32(&buf[OFF_PREV_PAGE_ID..]);
        let next_page_id = BigEndian::read_u32(&buf[OFF_NEXT_PAGE_ID..]);
        let payload = buf[HEADER_SIZE as usize..].to_vec();

        debug_assert_eq!(payload.len() as u32, page_size - HEADER_SIZE);

        Ok(Page {
            page_id,
            page_type,
            prev_page_id,
            next_page_id,
            free_bytes,
            item_count,
            payload,
        })
    }

    pub fn used_bytes(&self) -> u32 {
        self.payload.len() as u32 - self.free_bytes as u32
    }

    /// Invariant check used by tests and by `PageManager` after any mutation:
    /// `free_bytes + used_bytes == payload.len()`.
    pub fn check_byte_conservation(&self) -> bool {
        self.free_bytes as u32 + self.used_bytes() == self.payload.len() as u32
    }
}

fn checksum_excluding_field(buf: &[u8], field_offset: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..field_offset]);
    hasher.update(&buf[field_offset + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_fields() {
        let mut page = Page::new(7, 4096, PageType::Data);
        page.prev_page_id = 3;
        page.next_page_id = 9;
        page.free_bytes = 100;
        page.item_count = 2;
        page.payload[0] = 0xFE;

        let bytes = page.to_bytes(4096);
        let parsed = Page::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.page_id, 7);
        assert_eq!(parsed.page_type, PageType::Data);
        assert_eq!(parsed.prev_page_id, 3);
        assert_eq!(parsed.next_page_id, 9);
        assert_eq!(parsed.free_bytes, 100);
        assert_eq!(parsed.item_count, 2);
        assert_eq!(parsed.payload[0], 0xFE);
    }

    #[test]
    fn detects_corruption() {
        let page = Page::new(1, 4096, PageType::Data);
        let mut bytes = page.to_bytes(4096);
        bytes[HEADER_SIZE as usize] ^= 0xFF;

        let err = Page::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::PageChecksumMismatch(1)));
    }

    #[test]
    fn payload_capacity_excludes_header_only() {
        let page = Page::new(1, 8192, PageType::Data);
        assert_eq!(page.payload.len() as u32, 8192 - HEADER_SIZE);
        assert!(page.check_byte_conservation());
    }
}
