//! Large-document overflow storage: a document too big for a single data
//! page's `max_doc_size` is split across a chain of `LargeDocument` pages,
//! enumerated by a single `LargeDocumentIndex` page holding the ordered
//! list of chunk page ids. Grounded on the teacher's `overflow_data.rs`
//! (`OverflowDataWrapper`), which allocates and links pages the same way
//! for values too large to fit inline; the dedicated index page (rather
//! than relying solely on `next_page_id` chaining) follows this crate's
//! data model where the in-page stub carries `_largeDocumentIndex`
//! pointing at exactly one page.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::page::{Page, PageType, HEADER_SIZE};
use crate::page_manager::PageManager;

const IDX_TOTAL_LEN_OFFSET: usize = 0;
const IDX_COUNT_OFFSET: usize = 4;
const IDX_PAGE_IDS_OFFSET: usize = 8;

pub struct LargeDocumentStorage;

impl LargeDocumentStorage {
    /// Splits `bytes` across a freshly allocated chain of `LargeDocument`
    /// pages (also linked via `prev/next_page_id` for sequential-scan
    /// friendliness) and records the chain in a new `LargeDocumentIndex`
    /// page, returning that index page's id -- the value stored in the
    /// owning data page's stub as `_largeDocumentIndex`.
    pub fn store(pm: &mut PageManager, bytes: &[u8]) -> Result<u32> {
        let page_size = pm.page_size();
        let chunk_cap = (page_size - HEADER_SIZE) as usize;

        let mut chunk_page_ids = Vec::new();
        let mut prev_page_id = 0u32;
        let mut offset = 0usize;

        while offset < bytes.len() || chunk_page_ids.is_empty() {
            let mut page = pm.new_page(PageType::LargeDocument)?;
            let page_id = page.page_id;
            let take = chunk_cap.min(bytes.len() - offset);
            page.payload[..take].copy_from_slice(&bytes[offset..offset + take]);
            page.free_bytes = (chunk_cap - take) as u16;
            page.item_count = take as u16;
            offset += take;

            if prev_page_id != 0 {
                let mut prev = pm.get_page(prev_page_id)?;
                prev.next_page_id = page_id;
                pm.save_page(prev, false)?;
            }
            page.prev_page_id = prev_page_id;
            pm.save_page(page, false)?;

            chunk_page_ids.push(page_id);
            prev_page_id = page_id;
        }

        let mut index_page = pm.new_page(PageType::LargeDocumentIndex)?;
        let index_page_id = index_page.page_id;
        Self::encode_index(&mut index_page.payload, bytes.len(), &chunk_page_ids)?;
        index_page.item_count = chunk_page_ids.len() as u16;
        pm.save_page(index_page, false)?;

        Ok(index_page_id)
    }

    fn encode_index(payload: &mut [u8], total_len: usize, page_ids: &[u32]) -> Result<()> {
        let capacity = (payload.len() - IDX_PAGE_IDS_OFFSET) / 4;
        if page_ids.len() > capacity {
            return Err(Error::Other("large-document index page overflow".into()));
        }
        BigEndian::write_u32(&mut payload[IDX_TOTAL_LEN_OFFSET..], total_len as u32);
        BigEndian::write_u32(&mut payload[IDX_COUNT_OFFSET..], page_ids.len() as u32);
        for (i, pid) in page_ids.iter().enumerate() {
            let off = IDX_PAGE_IDS_OFFSET + i * 4;
            BigEndian::write_u32(&mut payload[off..], *pid);
        }
        Ok(())
    }

    fn decode_index(payload: &[u8]) -> (usize, Vec<u32>) {
        let total_len = BigEndian::read_u32(&payload[IDX_TOTAL_LEN_OFFSET..]) as usize;
        let count = BigEndian::read_u32(&payload[IDX_COUNT_OFFSET..]) as usize;
        let mut page_ids = Vec::with_capacity(count);
        for i in 0..count {
            let off = IDX_PAGE_IDS_OFFSET + i * 4;
            page_ids.push(BigEndian::read_u32(&payload[off..]));
        }
        (total_len, page_ids)
    }

    /// Reassembles the full document byte sequence from its index page.
    pub fn load(pm: &mut PageManager, index_page_id: u32) -> Result<Vec<u8>> {
        let index_page = pm.get_page(index_page_id)?;
        let (total_len, page_ids) = Self::decode_index(&index_page.payload);

        let mut out = Vec::with_capacity(total_len);
        for page_id in page_ids {
            let page = pm.get_page(page_id)?;
            out.extend_from_slice(&page.payload[..page.item_count as usize]);
        }

        debug_assert_eq!(out.len(), total_len);
        Ok(out)
    }

    /// Rewrites an already-loaded index page's chunk-id list through
    /// `id_map`, used by `compact_database` once chunk pages have been
    /// renumbered. `total_len` and ordering are unaffected.
    pub(crate) fn remap_index_page(page: &mut Page, id_map: &HashMap<u32, u32>) -> Result<()> {
        let (total_len, page_ids) = Self::decode_index(&page.payload);
        let remapped: Vec<u32> = page_ids.iter().map(|id| id_map.get(id).copied().unwrap_or(*id)).collect();
        let mut payload = vec![0u8; page.payload.len()];
        Self::encode_index(&mut payload, total_len, &remapped)?;
        page.payload = payload;
        Ok(())
    }

    /// Frees the index page and every chunk page it lists.
    pub fn free_chain(pm: &mut PageManager, index_page_id: u32) -> Result<()> {
        let index_page = pm.get_page(index_page_id)?;
        let (_, page_ids) = Self::decode_index(&index_page.payload);
        for page_id in page_ids {
            pm.free_page(page_id)?;
        }
        pm.free_page(index_page_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pm() -> PageManager {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        PageManager::open(&path, 4096, 50, false).unwrap()
    }

    #[test]
    fn small_document_round_trips_single_page() {
        let mut pm = test_pm();
        let payload = vec![7u8; 200];
        let idx = LargeDocumentStorage::store(&mut pm, &payload).unwrap();
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }

        let loaded = LargeDocumentStorage::load(&mut pm, idx).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn document_spanning_multiple_pages_round_trips() {
        let mut pm = test_pm();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let idx = LargeDocumentStorage::store(&mut pm, &payload).unwrap();
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }

        let loaded = LargeDocumentStorage::load(&mut pm, idx).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn free_chain_returns_every_page_to_freelist() {
        let mut pm = test_pm();
        let payload: Vec<u8> = vec![1u8; 20_000];
        let idx = LargeDocumentStorage::store(&mut pm, &payload).unwrap();
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }
        let used_before = pm.used_pages();

        LargeDocumentStorage::free_chain(&mut pm, idx).unwrap();
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }

        assert!(pm.used_pages() < used_before);
        assert!(!pm.free_list_snapshot().is_empty());
    }

    #[test]
    fn remap_index_page_rewrites_chunk_ids() {
        let mut pm = test_pm();
        let payload: Vec<u8> = vec![9u8; 20_000];
        let idx = LargeDocumentStorage::store(&mut pm, &payload).unwrap();
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }

        let mut index_page = pm.get_page(idx).unwrap();
        let (_, original_ids) = LargeDocumentStorage::decode_index(&index_page.payload);
        let id_map: HashMap<u32, u32> = original_ids.iter().map(|id| (*id, id + 100)).collect();

        LargeDocumentStorage::remap_index_page(&mut index_page, &id_map).unwrap();
        let (total_len, remapped_ids) = LargeDocumentStorage::decode_index(&index_page.payload);

        assert_eq!(total_len, payload.len());
        assert_eq!(remapped_ids, original_ids.iter().map(|id| id + 100).collect::<Vec<_>>());
    }
}
