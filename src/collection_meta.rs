//! Collection registry: name -> metadata BSON document, backed by a single
//! dedicated page. Key-name constants and the flat document-of-documents
//! shape are grounded on the teacher's `meta_doc_helper.rs`; the fixed
//! metadata-entry offset (247 bytes into the page payload) is this crate's
//! own choice, recorded as an Open Question decision rather than inherited,
//! since spec.md's `DatabaseHeader` layout has no dedicated metadata-root
//! field to anchor it to.

use bson::{Bson, Document};

use crate::error::{Error, Result};
use crate::page::{Page, PageType};
use crate::page_manager::PageManager;

/// Offset inside the metadata page's payload at which the registry document
/// begins. Left as headroom for a future fixed-size prologue (mirrors the
/// teacher's habit of reserving header space even where the next grown
/// field isn't defined yet).
const METADATA_DOC_OFFSET: usize = 247;

/// Mirrors `engine::META_ROOT_PAGE`; duplicated here because the registry's
/// per-collection document shape is this module's format concern, while the
/// field's semantic owner (what a "root page" means) lives in `engine.rs`.
const ROOT_PAGE_FIELD: &str = "root_page_id";

pub struct CollectionMetaStore {
    page_id: u32,
    registry: Document,
}

impl CollectionMetaStore {
    /// Loads the registry from `page_id`, or initializes an empty one if
    /// the page has never held metadata (freshly allocated, all zero).
    pub fn load(pm: &mut PageManager, page_id: u32) -> Result<CollectionMetaStore> {
        let page = pm.get_page(page_id)?;
        let registry = Self::decode(&page.payload)?;
        Ok(CollectionMetaStore { page_id, registry })
    }

    /// Allocates a fresh metadata page and registers it as the collection
    /// root in the database header.
    pub fn create(pm: &mut PageManager) -> Result<CollectionMetaStore> {
        let page = pm.new_page(PageType::Collection)?;
        let page_id = page.page_id;
        pm.save_page(page, false)?;
        pm.header_mut().collection_root_page_id = page_id;
        Ok(CollectionMetaStore {
            page_id,
            registry: Document::new(),
        })
    }

    fn decode(payload: &[u8]) -> Result<Document> {
        if payload.len() <= METADATA_DOC_OFFSET || payload[METADATA_DOC_OFFSET..].iter().all(|&b| b == 0) {
            return Ok(Document::new());
        }
        let mut cursor = std::io::Cursor::new(&payload[METADATA_DOC_OFFSET..]);
        match Document::from_reader(&mut cursor) {
            Ok(doc) => Ok(doc),
            // tolerate pages written before metadata existed, or any stray
            // non-BSON content rather than refusing to open the database
            Err(_) => Ok(Document::new()),
        }
    }

    fn persist(&self, pm: &mut PageManager, force_flush: bool) -> Result<()> {
        let page_size = pm.page_size();
        let mut page = Page::new(self.page_id, page_size, PageType::Collection);

        let mut encoded = Vec::new();
        self.registry.to_writer(&mut encoded)?;

        let capacity = page.payload.len() - METADATA_DOC_OFFSET;
        if encoded.len() > capacity {
            return Err(Error::MetadataTooLarge);
        }

        page.payload[METADATA_DOC_OFFSET..METADATA_DOC_OFFSET + encoded.len()].copy_from_slice(&encoded);
        page.item_count = self.registry.len() as u16;
        page.free_bytes = (page.payload.len() - METADATA_DOC_OFFSET - encoded.len()) as u16;

        pm.save_page(page, force_flush)
    }

    /// Rewrites every collection's `root_page_id` through `id_map` directly
    /// on a raw metadata page, without needing a `PageManager`. Used by
    /// `compact_database` once page ids have been renumbered, since the data
    /// pages a collection's root points at move along with everything else.
    pub(crate) fn remap_page(page: &mut Page, id_map: &std::collections::HashMap<u32, u32>) -> Result<()> {
        let mut registry = Self::decode(&page.payload)?;
        let names: Vec<String> = registry.keys().cloned().collect();
        for name in names {
            let Some(doc) = registry.get_document(&name).ok().cloned() else { continue };
            let Ok(old_root) = doc.get_i64(ROOT_PAGE_FIELD) else { continue };
            let mut updated = doc;
            let new_root = id_map.get(&(old_root as u32)).copied().unwrap_or(old_root as u32);
            updated.insert(ROOT_PAGE_FIELD, new_root as i64);
            registry.insert(name, Bson::Document(updated));
        }

        let mut encoded = Vec::new();
        registry.to_writer(&mut encoded)?;
        let capacity = page.payload.len() - METADATA_DOC_OFFSET;
        if encoded.len() > capacity {
            return Err(Error::MetadataTooLarge);
        }
        for b in page.payload[METADATA_DOC_OFFSET..].iter_mut() {
            *b = 0;
        }
        page.payload[METADATA_DOC_OFFSET..METADATA_DOC_OFFSET + encoded.len()].copy_from_slice(&encoded);
        page.item_count = registry.len() as u16;
        page.free_bytes = (capacity - encoded.len()) as u16;
        Ok(())
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn get_collection_names(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    pub fn get_metadata(&self, name: &str) -> Option<&Document> {
        self.registry.get_document(name).ok()
    }

    pub fn register_collection(
        &mut self,
        pm: &mut PageManager,
        name: &str,
        metadata: Document,
        force_flush: bool,
    ) -> Result<()> {
        if self.is_known(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        self.registry.insert(name.to_string(), Bson::Document(metadata));
        self.persist(pm, force_flush)
    }

    pub fn update_metadata(
        &mut self,
        pm: &mut PageManager,
        name: &str,
        metadata: Document,
        force_flush: bool,
    ) -> Result<()> {
        if !self.is_known(name) {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        self.registry.insert(name.to_string(), Bson::Document(metadata));
        self.persist(pm, force_flush)
    }

    pub fn remove_collection(&mut self, pm: &mut PageManager, name: &str, force_flush: bool) -> Result<()> {
        if self.registry.remove(name).is_none() {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        self.persist(pm, force_flush)
    }
}
