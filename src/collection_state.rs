//! Per-collection runtime state: owned data pages, the current insert
//! page, and the primary-key index (`_id -> (page_id, slot_index)`).
//! Guarded by a single reader-writer lock per spec.md §5 ("readers run
//! concurrently, a writer blocks readers"), mirroring the teacher's
//! `db/db_handle.rs`/`Arc<RwLock<..>>` idiom for per-collection state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use bson::Bson;

use crate::error::Result;
use crate::index_manager::{bson_sort_key, BsonKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocLocation {
    pub page_id: u32,
    pub slot_index: usize,
}

#[derive(Default)]
struct Inner {
    owned_pages: BTreeSet<u32>,
    current_insert_page: u32,
    index: BTreeMap<BsonKey, (Bson, DocLocation)>,
    is_cache_initialized: bool,
}

pub struct CollectionState {
    inner: RwLock<Inner>,
}

impl Default for CollectionState {
    fn default() -> CollectionState {
        CollectionState {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl CollectionState {
    pub fn new() -> CollectionState {
        CollectionState::default()
    }

    pub fn is_cache_initialized(&self) -> Result<bool> {
        Ok(self.inner.read()?.is_cache_initialized)
    }

    pub fn mark_cache_initialized(&self) -> Result<()> {
        self.inner.write()?.is_cache_initialized = true;
        Ok(())
    }

    pub fn owned_pages(&self) -> Result<Vec<u32>> {
        Ok(self.inner.read()?.owned_pages.iter().copied().collect())
    }

    pub fn add_owned_page(&self, page_id: u32) -> Result<()> {
        self.inner.write()?.owned_pages.insert(page_id);
        Ok(())
    }

    pub fn remove_owned_page(&self, page_id: u32) -> Result<()> {
        self.inner.write()?.owned_pages.remove(&page_id);
        Ok(())
    }

    pub fn current_insert_page(&self) -> Result<u32> {
        Ok(self.inner.read()?.current_insert_page)
    }

    pub fn set_current_insert_page(&self, page_id: u32) -> Result<()> {
        self.inner.write()?.current_insert_page = page_id;
        Ok(())
    }

    pub fn lookup(&self, id: &Bson) -> Result<Option<DocLocation>> {
        Ok(self.inner.read()?.index.get(&bson_sort_key(id)).map(|(_, loc)| *loc))
    }

    pub fn contains_id(&self, id: &Bson) -> Result<bool> {
        Ok(self.inner.read()?.index.contains_key(&bson_sort_key(id)))
    }

    pub fn set_location(&self, id: Bson, loc: DocLocation) -> Result<()> {
        let key = bson_sort_key(&id);
        self.inner.write()?.index.insert(key, (id, loc));
        Ok(())
    }

    pub fn remove_id(&self, id: &Bson) -> Result<()> {
        self.inner.write()?.index.remove(&bson_sort_key(id));
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.read()?.index.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn all_ids(&self) -> Result<Vec<Bson>> {
        Ok(self.inner.read()?.index.values().map(|(id, _)| id.clone()).collect())
    }

    /// Clears all runtime state, used by `drop_collection`.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.owned_pages.clear();
        inner.current_insert_page = 0;
        inner.index.clear();
        inner.is_cache_initialized = false;
        Ok(())
    }
}
