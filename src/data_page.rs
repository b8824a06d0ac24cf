//! Regular (non-overflow) document storage on `Data` pages: a dense,
//! length-prefixed slot layout (`u32 len || bson bytes`, repeated,
//! back-to-back from the front of the payload) exactly as spec.md §3
//! describes. This replaces the teacher's reverse-bar slotted layout in
//! `page/data_page_wrapper.rs` (bars growing from the back, a free gap in
//! the middle) -- the API shape (`init`/`put`/`get`/`remove`/`len`/
//! `remain_size`) is kept, but the on-disk layout is simplified since a
//! middle free-gap has no room in a dense format whose `free_bytes` must
//! track exactly the unused tail.
//!
//! A document too large for `max_doc_size` is written as an overflow chain
//! via `large_doc` and the in-page slot instead holds a small stub BSON
//! document `{ _isLargeDocument: true, _largeDocumentIndex, _largeDocumentSize }`.
//! A slot whose length prefix is `TOMBSTONE` marks a deleted document:
//! callers skip it on scan but the space is only reclaimed by
//! `rewrite_page`.

use bson::{doc, Bson, Document};
use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::large_doc::LargeDocumentStorage;
use crate::page::{Page, PageType};
use crate::page_manager::PageManager;

pub const SLOT_LEN_PREFIX: usize = 4;
pub const TOMBSTONE: u32 = u32::MAX;

pub const STUB_IS_LARGE: &str = "_isLargeDocument";
pub const STUB_INDEX: &str = "_largeDocumentIndex";
pub const STUB_SIZE: &str = "_largeDocumentSize";

pub fn max_doc_size(page_size: u32) -> usize {
    page_size as usize - 300
}

pub struct DataPageAccess;

impl DataPageAccess {
    pub fn can_fit(page: &Page, entry_len: usize) -> bool {
        page.free_bytes as usize >= SLOT_LEN_PREFIX + entry_len
    }

    fn used_region_len(page: &Page) -> usize {
        page.payload.len() - page.free_bytes as usize
    }

    /// Appends one slot holding `entry_bytes` (already-serialized BSON, a
    /// real document or a large-doc stub).
    pub fn put(page: &mut Page, entry_bytes: &[u8]) {
        let offset = Self::used_region_len(page);
        BigEndian::write_u32(&mut page.payload[offset..offset + SLOT_LEN_PREFIX], entry_bytes.len() as u32);
        page.payload[offset + SLOT_LEN_PREFIX..offset + SLOT_LEN_PREFIX + entry_bytes.len()]
            .copy_from_slice(entry_bytes);
        page.item_count += 1;
        page.free_bytes -= (SLOT_LEN_PREFIX + entry_bytes.len()) as u16;
    }

    /// Builds the on-disk entry bytes for `doc`, routing through
    /// `large_doc` when `doc`'s serialized size exceeds `max_doc_size`.
    pub fn encode_entry(pm: &mut PageManager, doc: &Document) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes)?;

        if bytes.len() <= max_doc_size(pm.page_size()) {
            return Ok(bytes);
        }

        let index_page_id = LargeDocumentStorage::store(pm, &bytes)?;
        let stub = doc! {
            STUB_IS_LARGE: true,
            STUB_INDEX: index_page_id as i64,
            STUB_SIZE: bytes.len() as i64,
        };
        let mut stub_bytes = Vec::new();
        stub.to_writer(&mut stub_bytes)?;
        Ok(stub_bytes)
    }

    /// Marks the slot at `slot_index` (0-based encounter order, tombstones
    /// included) as deleted without reclaiming its space.
    pub fn tombstone_slot(page: &mut Page, slot_index: usize) {
        let mut offset = 0usize;
        let limit = Self::used_region_len(page);
        let mut idx = 0usize;
        while offset < limit {
            let len = BigEndian::read_u32(&page.payload[offset..offset + SLOT_LEN_PREFIX]);
            let body_len = if len == TOMBSTONE { 0 } else { len as usize };
            if idx == slot_index {
                BigEndian::write_u32(&mut page.payload[offset..offset + SLOT_LEN_PREFIX], TOMBSTONE);
                return;
            }
            offset += SLOT_LEN_PREFIX + body_len;
            idx += 1;
        }
    }

    /// Raw (unresolved) slot bytes in encounter order; `None` for a
    /// tombstone. Corrupt length prefixes that would run past the used
    /// region stop the scan rather than panicking.
    pub fn scan_raw(page: &Page) -> Vec<(usize, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        let limit = Self::used_region_len(page);
        let mut idx = 0usize;

        while offset + SLOT_LEN_PREFIX <= limit {
            let len = BigEndian::read_u32(&page.payload[offset..offset + SLOT_LEN_PREFIX]);
            if len == TOMBSTONE {
                out.push((idx, None));
                offset += SLOT_LEN_PREFIX;
            } else {
                let body_len = len as usize;
                if offset + SLOT_LEN_PREFIX + body_len > limit {
                    break; // corrupt length prefix: stop rather than read garbage
                }
                let body = page.payload[offset + SLOT_LEN_PREFIX..offset + SLOT_LEN_PREFIX + body_len].to_vec();
                out.push((idx, Some(body)));
                offset += SLOT_LEN_PREFIX + body_len;
            }
            idx += 1;
        }
        out
    }

    /// Decodes every live slot to a document, resolving large-document
    /// stubs through `large_doc`. Entries with corrupt BSON are skipped.
    pub fn scan_documents(pm: &mut PageManager, page: &Page) -> Vec<(usize, Document)> {
        let mut out = Vec::new();
        for (idx, raw) in Self::scan_raw(page) {
            let Some(bytes) = raw else { continue };
            let Ok(doc) = Self::decode_and_resolve(pm, &bytes) else { continue };
            out.push((idx, doc));
        }
        out
    }

    /// Public wrapper over `decode_and_resolve` for callers (e.g. the
    /// engine's delete path) that need to re-derive a raw entry's `_id`
    /// after a page rewrite shifts slot positions.
    pub fn decode_entry(pm: &mut PageManager, bytes: &[u8]) -> Result<Document> {
        Self::decode_and_resolve(pm, bytes)
    }

    fn decode_and_resolve(pm: &mut PageManager, bytes: &[u8]) -> Result<Document> {
        let mut cursor = std::io::Cursor::new(bytes);
        let doc = Document::from_reader(&mut cursor)?;
        if doc.get_bool(STUB_IS_LARGE).unwrap_or(false) {
            let index_page_id = doc.get_i64(STUB_INDEX).unwrap_or(0) as u32;
            let full_bytes = LargeDocumentStorage::load(pm, index_page_id)?;
            let mut full_cursor = std::io::Cursor::new(full_bytes);
            return Ok(Document::from_reader(&mut full_cursor)?);
        }
        Ok(doc)
    }

    /// O(slot) skip over preceding entries; resolves overflow stubs.
    /// `fields`, if given, limits the returned document to those keys
    /// (`_id` is always included).
    pub fn read_document_at(
        pm: &mut PageManager,
        page: &Page,
        slot: usize,
        fields: Option<&[String]>,
    ) -> Option<Document> {
        let entries = Self::scan_raw(page);
        let (_, raw) = entries.into_iter().find(|(idx, _)| *idx == slot)?;
        let bytes = raw?;
        let doc = Self::decode_and_resolve(pm, &bytes).ok()?;

        match fields {
            None => Some(doc),
            Some(wanted) => {
                let mut projected = Document::new();
                if let Some(id) = doc.get("_id") {
                    projected.insert("_id", id.clone());
                }
                for f in wanted {
                    if f == "_id" {
                        continue;
                    }
                    if let Some(v) = doc.get(f) {
                        projected.insert(f.clone(), v.clone());
                    }
                }
                Some(projected)
            }
        }
    }

    /// Rewrites the page keeping only the given live entries (already
    /// encoded, in the order they should appear), compacting the used
    /// region and restoring `free_bytes`/`item_count`. Entries belonging to
    /// tombstoned overflow stubs must already have been freed by the
    /// caller (via `large_doc::free_chain`) before calling this.
    pub fn rewrite_page(page: &mut Page, entries: &[Vec<u8>]) {
        let capacity = page.payload.len();
        let mut new_payload = vec![0u8; capacity];
        let mut offset = 0usize;

        for entry in entries {
            BigEndian::write_u32(&mut new_payload[offset..offset + SLOT_LEN_PREFIX], entry.len() as u32);
            new_payload[offset + SLOT_LEN_PREFIX..offset + SLOT_LEN_PREFIX + entry.len()].copy_from_slice(entry);
            offset += SLOT_LEN_PREFIX + entry.len();
        }

        page.payload = new_payload;
        page.item_count = entries.len() as u16;
        page.free_bytes = (capacity - offset) as u16;
    }

    pub fn persist_page(pm: &mut PageManager, page: Page, force_flush: bool) -> Result<()> {
        pm.save_page(page, force_flush)
    }

    /// Rewrites every live entry's large-document stub pointer through
    /// `id_map` and drops tombstones, used by `compact_database` once
    /// overflow-chain index pages have been renumbered. Plain (non-stub)
    /// entries pass through unchanged.
    pub fn remap_large_doc_refs(page: &mut Page, id_map: &std::collections::HashMap<u32, u32>) -> Result<()> {
        let mut rebuilt = Vec::new();
        for (_, raw) in Self::scan_raw(page) {
            let Some(bytes) = raw else { continue };
            let mut cursor = std::io::Cursor::new(&bytes);
            let mut doc = Document::from_reader(&mut cursor)?;
            if doc.get_bool(STUB_IS_LARGE).unwrap_or(false) {
                if let Ok(old_index) = doc.get_i64(STUB_INDEX) {
                    let new_index = id_map.get(&(old_index as u32)).copied().unwrap_or(old_index as u32);
                    doc.insert(STUB_INDEX, new_index as i64);
                }
                let mut out = Vec::new();
                doc.to_writer(&mut out)?;
                rebuilt.push(out);
            } else {
                rebuilt.push(bytes);
            }
        }
        Self::rewrite_page(page, &rebuilt);
        Ok(())
    }
}

/// Returns `(page, is_new)`. If `current_insert_page_id` names a page with
/// enough room, reuses it; otherwise allocates a fresh `Data` page.
/// Caller is responsible for linking the new page into the collection's
/// chain and updating `OwnedPages`/`CurrentInsertPage`.
pub fn get_writable_data_page(
    pm: &mut PageManager,
    current_insert_page_id: u32,
    required_bytes: usize,
) -> Result<(Page, bool)> {
    if current_insert_page_id != 0 {
        let page = pm.get_page(current_insert_page_id)?;
        if DataPageAccess::can_fit(&page, required_bytes) {
            return Ok((page, false));
        }
    }
    let page = pm.new_page(PageType::Data)?;
    Ok((page, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::tempdir;

    fn test_pm() -> PageManager {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        PageManager::open(&path, 4096, 10, false).unwrap()
    }

    fn entry_bytes(d: &Document) -> Vec<u8> {
        let mut b = Vec::new();
        d.to_writer(&mut b).unwrap();
        b
    }

    #[test]
    fn put_and_scan_documents_round_trips() {
        let mut pm = test_pm();
        let mut page = Page::new(2, 4096, PageType::Data);
        DataPageAccess::put(&mut page, &entry_bytes(&doc! { "_id": 1, "name": "a" }));
        DataPageAccess::put(&mut page, &entry_bytes(&doc! { "_id": 2, "name": "b" }));

        let docs = DataPageAccess::scan_documents(&mut pm, &page);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].1.get_i32("_id").unwrap(), 1);
        assert!(page.check_byte_conservation());
    }

    #[test]
    fn tombstone_then_rewrite_reclaims_space() {
        let mut page = Page::new(2, 4096, PageType::Data);
        let e0 = entry_bytes(&doc! { "_id": 1 });
        let e1 = entry_bytes(&doc! { "_id": 2 });
        DataPageAccess::put(&mut page, &e0);
        DataPageAccess::put(&mut page, &e1);

        DataPageAccess::tombstone_slot(&mut page, 0);
        DataPageAccess::rewrite_page(&mut page, &[e1.clone()]);

        let raw = DataPageAccess::scan_raw(&page);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].1.as_ref().unwrap(), &e1);
        assert!(page.check_byte_conservation());
    }

    #[test]
    fn large_document_round_trips_through_overflow_stub() {
        let mut pm = test_pm();
        let mut big_doc = doc! { "_id": 1 };
        big_doc.insert("blob", Bson::String("x".repeat(5000)));

        let entry = DataPageAccess::encode_entry(&mut pm, &big_doc).unwrap();
        assert!(entry.len() < 300, "entry should be a small stub, not the full document");

        let mut page = Page::new(2, 4096, PageType::Data);
        DataPageAccess::put(&mut page, &entry);
        for p in pm.take_dirty_pages() {
            pm.save_page(p, true).unwrap();
        }

        let docs = DataPageAccess::scan_documents(&mut pm, &page);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1.get_str("blob").unwrap().len(), 5000);
    }

    #[test]
    fn read_document_at_projects_requested_fields() {
        let mut pm = test_pm();
        let mut page = Page::new(2, 4096, PageType::Data);
        DataPageAccess::put(&mut page, &entry_bytes(&doc! { "_id": 1, "name": "a", "age": 30 }));

        let projected =
            DataPageAccess::read_document_at(&mut pm, &page, 0, Some(&["name".to_string()])).unwrap();
        assert!(projected.contains_key("_id"));
        assert!(projected.contains_key("name"));
        assert!(!projected.contains_key("age"));
    }

    #[test]
    fn remap_large_doc_refs_rewrites_stub_pointer_and_drops_tombstones() {
        let mut pm = test_pm();
        let mut big_doc = doc! { "_id": 1 };
        big_doc.insert("blob", Bson::String("x".repeat(5000)));
        let stub_entry = DataPageAccess::encode_entry(&mut pm, &big_doc).unwrap();

        let mut page = Page::new(2, 4096, PageType::Data);
        DataPageAccess::put(&mut page, &entry_bytes(&doc! { "_id": 2 }));
        DataPageAccess::put(&mut page, &stub_entry);
        DataPageAccess::tombstone_slot(&mut page, 0);

        let mut cursor = std::io::Cursor::new(&stub_entry);
        let stub_doc = Document::from_reader(&mut cursor).unwrap();
        let old_index = stub_doc.get_i64(STUB_INDEX).unwrap() as u32;

        let mut id_map = std::collections::HashMap::new();
        id_map.insert(old_index, old_index + 50);
        DataPageAccess::remap_large_doc_refs(&mut page, &id_map).unwrap();

        let raw = DataPageAccess::scan_raw(&page);
        assert_eq!(raw.len(), 1, "tombstoned slot should have been dropped");
        let mut cursor = std::io::Cursor::new(raw[0].1.as_ref().unwrap());
        let remapped_doc = Document::from_reader(&mut cursor).unwrap();
        assert_eq!(remapped_doc.get_i64(STUB_INDEX).unwrap() as u32, old_index + 50);
        assert!(page.check_byte_conservation());
    }
}
