//! Top-level orchestrator: collection lifecycle, CRUD, flush/checkpoint,
//! compaction, and the startup/shutdown sequence. Grounded on the shape of
//! the teacher's `db/db.rs::Database` (owns page handler, metadata, and a
//! per-collection map behind a single entry point), generalized with the
//! explicit `tx: Option<TransactionIdKind>` parameter spec.md §9 calls for
//! in place of a thread-local "current transaction".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use hashbrown::HashMap as CollectionMap;
use log::{debug, trace, warn};

use crate::collection_meta::CollectionMetaStore;
use crate::collection_state::{CollectionState, DocLocation};
use crate::data_page::{get_writable_data_page, DataPageAccess, SLOT_LEN_PREFIX};
use crate::error::{AggregateError, Error, Result};
use crate::index_manager::{BTreeIndexManager, IndexManager};
use crate::large_doc::LargeDocumentStorage;
use crate::lock_manager::{LockManager, LockMode};
use crate::options::{Options, WriteConcern};
use crate::page::{Page, PageType};
use crate::page_manager::{PageManager, DB_HEADER_PAGE_ID};
use crate::stats::EngineStatistics;
use crate::transaction_manager::{CollectionSchema, ForeignKeyLink, OperationSink, TransactionManager};
use crate::transaction::TransactionIdKind;
use crate::wal::{self, WriteAheadLog};

const META_ID_FIELD: &str = "id_field";
const META_ROOT_PAGE: &str = "root_page_id";
const META_FK_LINKS: &str = "fk_links";
const FK_FIELD: &str = "field";
const FK_REFERENCED: &str = "referenced_collection";

pub struct BatchInsertOutcome {
    pub inserted: usize,
    pub errors: Option<AggregateError>,
}

/// Collection name validation per SPEC_FULL.md §3: non-empty, no NUL bytes,
/// must not start with `$`.
fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') || name.as_bytes().contains(&0) {
        return Err(Error::IllegalCollectionName(name.to_string()));
    }
    Ok(())
}

pub struct Engine {
    path: PathBuf,
    options: Options,
    page_manager: Mutex<PageManager>,
    wal: Mutex<Option<WriteAheadLog>>,
    meta: Mutex<CollectionMetaStore>,
    collections: RwLock<CollectionMap<String, Arc<CollectionState>>>,
    index_manager: Mutex<Box<dyn IndexManager>>,
    lock_manager: Arc<LockManager>,
    transaction_manager: Arc<TransactionManager>,
    disposed: AtomicBool,
    background_signal: Arc<(Mutex<bool>, Condvar)>,
    background_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    deadlock_signal: Arc<(Mutex<bool>, Condvar)>,
    deadlock_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Opens (creating if absent) the database at `path`: replays the WAL if
    /// journaling is on and frames are pending, loads collection metadata,
    /// and — unless `background_flush_interval` is infinite — spawns the
    /// background flush worker.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Arc<Engine>> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut pm = PageManager::open(&path, options.page_size, options.cache_size, options.read_only)?;
        if !options.database_name.is_empty() {
            pm.header_mut().database_name = options.database_name.clone();
        }

        let wal_path = options.wal_path(&path);
        let mut wal = if options.enable_journaling {
            let mut w = WriteAheadLog::open(&wal_path, options.page_size)?;
            if w.has_frames()? {
                let applied = w.replay(pm.disk_mut())?;
                debug!("wal replay applied {} frames from {:?}", applied, wal_path);
                // replay writes straight to disk via `disk_mut`, bypassing the
                // header/freelist this `pm` already loaded from page 1 at open
                // time -- reload so a replayed header update is visible below.
                pm.reload_header()?;
            }
            Some(w)
        } else {
            wal::remove_stale_wal(&wal_path);
            None
        };
        let _ = &mut wal;

        let root = pm.header().collection_root_page_id;
        let meta = if root == 0 {
            CollectionMetaStore::create(&mut pm)?
        } else {
            CollectionMetaStore::load(&mut pm, root)?
        };

        let lock_manager = Arc::new(LockManager::new());
        let engine = Arc::new(Engine {
            path,
            options: options.clone(),
            page_manager: Mutex::new(pm),
            wal: Mutex::new(wal),
            meta: Mutex::new(meta),
            collections: RwLock::new(CollectionMap::new()),
            index_manager: Mutex::new(Box::new(BTreeIndexManager::new())),
            lock_manager: Arc::clone(&lock_manager),
            transaction_manager: Arc::new(TransactionManager::new(
                lock_manager,
                options.max_transactions,
                Duration::from_millis(options.transaction_timeout_ms),
            )),
            disposed: AtomicBool::new(false),
            background_signal: Arc::new((Mutex::new(false), Condvar::new())),
            background_handle: Mutex::new(None),
            cleanup_handle: Mutex::new(None),
            deadlock_signal: Arc::new((Mutex::new(false), Condvar::new())),
            deadlock_handle: Mutex::new(None),
        });

        if let FlushIntervalMillis::Some(ms) = flush_interval_millis(&options) {
            engine.spawn_background_flush(ms);
        }
        let cleanup = Arc::clone(&engine.transaction_manager);
        *engine.cleanup_handle.lock()? = Some(cleanup.spawn_cleanup_thread(Duration::from_millis(
            options.transaction_timeout_ms.max(1000),
        )));
        engine.spawn_deadlock_detector();

        Ok(engine)
    }

    /// Periodic background deadlock detection, per spec.md §4.6 ("a
    /// background task ... runs DFS over the wait-for graph"), complementing
    /// the DFS every `request_lock` already runs on conflict. Catches cycles
    /// that form without a new lock request arriving to trigger detection,
    /// and wakes any thread blocked in `wait_for_grant` via the lock
    /// manager's own condvar.
    fn spawn_deadlock_detector(self: &Arc<Self>) {
        let lock_manager = Arc::clone(&self.lock_manager);
        let signal = Arc::clone(&self.deadlock_signal);
        let interval = Duration::from_millis(self.options.timeout_ms.max(50).min(1000));
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*signal;
            loop {
                let guard = lock.lock().unwrap();
                let (guard, _) = cvar.wait_timeout(guard, interval).unwrap();
                if *guard {
                    break;
                }
                drop(guard);
                let _ = lock_manager.detect_deadlocks();
            }
        });
        *self.deadlock_handle.lock().unwrap() = Some(handle);
    }

    fn spawn_background_flush(self: &Arc<Self>, interval_ms: u64) {
        let weak: Weak<Engine> = Arc::downgrade(self);
        let signal = Arc::clone(&self.background_signal);
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*signal;
            loop {
                let guard = lock.lock().unwrap();
                let (guard, _) = cvar.wait_timeout(guard, Duration::from_millis(interval_ms)).unwrap();
                if *guard {
                    break;
                }
                drop(guard);
                match weak.upgrade() {
                    Some(engine) => {
                        if let Err(e) = engine.flush() {
                            warn!("background flush failed: {}", e);
                        }
                    }
                    None => break,
                }
            }
        });
        *self.background_handle.lock().unwrap() = Some(handle);
    }

    /// Flushes the engine ahead of Drop: stops background threads, flushes
    /// dirty pages, and fails any still-active transactions. Safe to call
    /// more than once.
    pub fn shutdown(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.flush();
        self.transaction_manager.dispose(self);
        self.transaction_manager.stop_cleanup_thread();

        let (lock, cvar) = &*self.background_signal;
        *lock.lock()? = true;
        cvar.notify_all();
        if let Some(h) = self.background_handle.lock()?.take() {
            let _ = h.join();
        }
        if let Some(h) = self.cleanup_handle.lock()?.take() {
            let _ = h.join();
        }

        let (dl_lock, dl_cvar) = &*self.deadlock_signal;
        *dl_lock.lock()? = true;
        dl_cvar.notify_all();
        if let Some(h) = self.deadlock_handle.lock()?.take() {
            let _ = h.join();
        }
        Ok(())
    }

    fn require_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    // ---- collection lifecycle -------------------------------------------------

    fn metadata_doc_for_new_collection() -> Document {
        bson::doc! {
            META_ID_FIELD: "_id",
            META_ROOT_PAGE: 0i64,
            META_FK_LINKS: [],
        }
    }

    /// Returns the runtime state for `collection`, registering it in the
    /// metadata store and lazily scanning its data-page chain on first
    /// access, per spec.md §3's `IsCacheInitialized` rule.
    fn ensure_collection(&self, collection: &str) -> Result<Arc<CollectionState>> {
        validate_collection_name(collection)?;

        if let Some(state) = self.collections.read()?.get(collection).cloned() {
            if state.is_cache_initialized()? {
                return Ok(state);
            }
        }

        let mut pm = self.page_manager.lock()?;
        let mut meta = self.meta.lock()?;
        if !meta.is_known(collection) {
            meta.register_collection(&mut pm, collection, Self::metadata_doc_for_new_collection(), false)?;
        }
        let root_page_id = meta
            .get_metadata(collection)
            .and_then(|d| d.get_i64(META_ROOT_PAGE).ok())
            .unwrap_or(0) as u32;
        drop(meta);

        let state = {
            let mut map = self.collections.write()?;
            map.entry(collection.to_string()).or_insert_with(|| Arc::new(CollectionState::new())).clone()
        };
        if state.is_cache_initialized()? {
            return Ok(state);
        }

        self.scan_collection_into_state(&mut pm, &state, root_page_id)?;
        state.mark_cache_initialized()?;
        Ok(state)
    }

    fn scan_collection_into_state(&self, pm: &mut PageManager, state: &CollectionState, root_page_id: u32) -> Result<()> {
        let mut page_id = root_page_id;
        let mut last_page_id = 0u32;
        while page_id != 0 {
            let page = pm.get_page(page_id)?;
            state.add_owned_page(page_id)?;
            for (slot, doc) in DataPageAccess::scan_documents(pm, &page) {
                if let Some(id) = doc.get("_id") {
                    state.set_location(id.clone(), DocLocation { page_id, slot_index: slot })?;
                }
            }
            last_page_id = page_id;
            page_id = pm.get_page(page_id)?.next_page_id;
        }
        state.set_current_insert_page(last_page_id)?;
        Ok(())
    }

    fn persist_root_page_id(&self, collection: &str, root_page_id: u32) -> Result<()> {
        let mut pm = self.page_manager.lock()?;
        let mut meta = self.meta.lock()?;
        let mut doc = meta.get_metadata(collection).cloned().unwrap_or_else(Self::metadata_doc_for_new_collection);
        doc.insert(META_ROOT_PAGE, root_page_id as i64);
        meta.update_metadata(&mut pm, collection, doc, false)
    }

    // ---- locking helper for the transactional path -----------------------

    fn acquire_for_tx(&self, tx: TransactionIdKind, collection: &str, mode: LockMode) -> Result<()> {
        let timeout = Duration::from_millis(self.options.timeout_ms);
        let req = self.lock_manager.request_lock(tx, collection, mode, timeout)?;
        if req.is_granted {
            return Ok(());
        }
        if req.is_deadlock_victim {
            return Err(Error::DeadlockVictim);
        }
        match self.lock_manager.wait_for_grant(tx, collection, mode, timeout)? {
            crate::lock_manager::WaitOutcome::Granted => Ok(()),
            crate::lock_manager::WaitOutcome::Victim => Err(Error::DeadlockVictim),
            crate::lock_manager::WaitOutcome::TimedOut => Err(Error::LockTimeout),
        }
    }

    // ---- CRUD ---------------------------------------------------------------

    pub fn insert_document(&self, collection: &str, mut doc: Document, tx: Option<TransactionIdKind>) -> Result<Bson> {
        self.require_not_disposed()?;
        if !doc.contains_key("_id") {
            doc.insert("_id", Bson::ObjectId(ObjectId::new()));
        }
        let id = doc.get("_id").cloned().ok_or(Error::MissingId)?;

        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::IntentWrite)?;
            self.transaction_manager.record_insert(tx, collection, doc)?;
            return Ok(id);
        }

        self.apply_insert(collection, doc)
    }

    fn apply_insert(&self, collection: &str, doc: Document) -> Result<Bson> {
        let id = doc.get("_id").cloned().ok_or(Error::MissingId)?;
        let state = self.ensure_collection(collection)?;
        if state.contains_id(&id)? {
            return Err(Error::DuplicateKey(id));
        }

        let mut pm = self.page_manager.lock()?;
        let entry = DataPageAccess::encode_entry(&mut pm, &doc)?;
        let current = state.current_insert_page()?;
        let (mut page, is_new) = get_writable_data_page(&mut pm, current, entry.len())?;
        let page_id = page.page_id;

        if is_new && current != 0 {
            let mut prev = pm.get_page(current)?;
            prev.next_page_id = page_id;
            page.prev_page_id = current;
            pm.save_page(prev, false)?;
        }

        let slot = page.item_count as usize;
        DataPageAccess::put(&mut page, &entry);
        DataPageAccess::persist_page(&mut pm, page, matches!(self.options.write_concern, WriteConcern::None))?;
        drop(pm);

        if is_new {
            state.add_owned_page(page_id)?;
            state.set_current_insert_page(page_id)?;
            if current == 0 {
                self.persist_root_page_id(collection, page_id)?;
            }
        }
        state.set_location(id.clone(), DocLocation { page_id, slot_index: slot })?;

        self.note_secondary_indexes_insert(collection, &doc, &id)?;
        self.flush_if_synced()?;
        trace!("inserted document into {} at page {} slot {}", collection, page_id, slot);
        Ok(id)
    }

    fn note_secondary_indexes_insert(&self, collection: &str, doc: &Document, id: &Bson) -> Result<()> {
        let mut idx = self.index_manager.lock()?;
        let descriptors: Vec<_> = idx.get_indexes(collection).into_iter().map(|d| d.field.clone()).collect();
        for field in descriptors {
            if let Some(key) = doc.get(&field) {
                idx.note_insert(collection, &field, key, id)?;
            }
        }
        Ok(())
    }

    fn note_secondary_indexes_remove(&self, collection: &str, doc: &Document, id: &Bson) -> Result<()> {
        let mut idx = self.index_manager.lock()?;
        let descriptors: Vec<_> = idx.get_indexes(collection).into_iter().map(|d| d.field.clone()).collect();
        for field in descriptors {
            if let Some(key) = doc.get(&field) {
                idx.note_remove(collection, &field, key, id)?;
            }
        }
        Ok(())
    }

    /// Batch insert: empty input yields 0; `None` elements are skipped;
    /// failures are collected rather than aborting the batch.
    pub fn insert_documents(&self, collection: &str, docs: Vec<Option<Document>>, tx: Option<TransactionIdKind>) -> Result<BatchInsertOutcome> {
        let mut inserted = 0usize;
        let mut errors = Vec::new();
        for (i, maybe_doc) in docs.into_iter().enumerate() {
            let Some(doc) = maybe_doc else { continue };
            match self.insert_document(collection, doc, tx) {
                Ok(_) => inserted += 1,
                Err(e) => errors.push((i, e)),
            }
        }
        Ok(BatchInsertOutcome {
            inserted,
            errors: if errors.is_empty() { None } else { Some(AggregateError { errors }) },
        })
    }

    pub fn update_document(&self, collection: &str, doc: Document, tx: Option<TransactionIdKind>) -> Result<usize> {
        self.require_not_disposed()?;
        let id = doc.get("_id").cloned().ok_or(Error::MissingId)?;

        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::Write)?;
            let original = self.find_by_id(collection, &id, None)?;
            let Some(original) = original else { return Ok(0) };
            self.transaction_manager.record_update(tx, collection, id, original, doc)?;
            return Ok(1);
        }

        self.apply_update(collection, doc)
    }

    fn apply_update(&self, collection: &str, doc: Document) -> Result<usize> {
        let id = doc.get("_id").cloned().ok_or(Error::MissingId)?;
        let state = self.ensure_collection(collection)?;
        let Some(loc) = state.lookup(&id)? else { return Ok(0) };

        let mut pm = self.page_manager.lock()?;
        let old_page = pm.get_page(loc.page_id)?;
        let old_doc = DataPageAccess::read_document_at(&mut pm, &old_page, loc.slot_index, None);
        let entry = DataPageAccess::encode_entry(&mut pm, &doc)?;

        // Same-page rewrite only works if the replacement still fits in the
        // page's fixed payload capacity; a document that grew past what the
        // page's remaining free space (plus the slot it's replacing) can
        // hold must instead free its old slot and be re-inserted as a fresh
        // entry, possibly landing on a different page.
        let old_entry_len = SLOT_LEN_PREFIX + DataPageAccess::scan_raw(&old_page)
            .into_iter()
            .find(|(idx, _)| *idx == loc.slot_index)
            .and_then(|(_, raw)| raw)
            .map(|b| b.len())
            .unwrap_or(0);
        let fits_in_place = (old_page.free_bytes as usize) + old_entry_len >= SLOT_LEN_PREFIX + entry.len();

        if fits_in_place {
            let mut entries = Self::live_entries(&mut pm, &old_page, Some((loc.slot_index, entry.clone())))?;
            let mut page = old_page;
            DataPageAccess::rewrite_page(&mut page, &entries);
            entries.clear();
            DataPageAccess::persist_page(&mut pm, page.clone(), matches!(self.options.write_concern, WriteConcern::None))?;
            drop(pm);

            let new_slot = Self::slot_for(&page, loc.slot_index);
            state.set_location(id.clone(), DocLocation { page_id: page.page_id, slot_index: new_slot })?;
        } else {
            self.remove_slot(&mut pm, &state, collection, old_page, loc.slot_index)?;

            let current = state.current_insert_page()?;
            let (mut page, is_new) = get_writable_data_page(&mut pm, current, entry.len())?;
            let page_id = page.page_id;
            if is_new && current != 0 {
                let mut prev = pm.get_page(current)?;
                prev.next_page_id = page_id;
                page.prev_page_id = current;
                pm.save_page(prev, false)?;
            }
            let slot = page.item_count as usize;
            DataPageAccess::put(&mut page, &entry);
            DataPageAccess::persist_page(&mut pm, page, matches!(self.options.write_concern, WriteConcern::None))?;
            drop(pm);

            if is_new {
                state.add_owned_page(page_id)?;
                state.set_current_insert_page(page_id)?;
                if current == 0 {
                    self.persist_root_page_id(collection, page_id)?;
                }
            }
            state.set_location(id.clone(), DocLocation { page_id, slot_index: slot })?;
        }

        if let Some(old) = old_doc {
            self.note_secondary_indexes_remove(collection, &old, &id)?;
        }
        self.note_secondary_indexes_insert(collection, &doc, &id)?;
        self.flush_if_synced()?;
        Ok(1)
    }

    /// Frees the entry at `slot_index` on `page`: compacts the surviving
    /// entries, re-deriving the index entry for each one whose slot shifts
    /// (same accounting as `apply_delete`), and frees the page itself if it
    /// was the last live entry and isn't the collection's only page —
    /// unlinking it from the prev/next chain and, if it was the chain head,
    /// persisting the new `root_page_id`.
    fn remove_slot(&self, pm: &mut PageManager, state: &CollectionState, collection: &str, mut page: Page, slot_index: usize) -> Result<Option<Document>> {
        let old_doc = DataPageAccess::read_document_at(pm, &page, slot_index, None);
        if let Some(doc) = &old_doc {
            if doc.get_bool(crate::data_page::STUB_IS_LARGE).unwrap_or(false) {
                if let Ok(index_page_id) = doc.get_i64(crate::data_page::STUB_INDEX) {
                    LargeDocumentStorage::free_chain(pm, index_page_id as u32)?;
                }
            }
        }

        let mut remaining = Vec::new();
        for (idx, raw) in DataPageAccess::scan_raw(&page) {
            if idx == slot_index {
                continue;
            }
            if let Some(bytes) = raw {
                remaining.push(bytes);
            }
        }

        let now_empty = remaining.is_empty();
        DataPageAccess::rewrite_page(&mut page, &remaining);

        if !now_empty {
            for (new_slot, bytes) in remaining.iter().enumerate() {
                if let Ok(doc) = DataPageAccess::decode_entry(pm, bytes) {
                    if let Some(doc_id) = doc.get("_id") {
                        state.set_location(doc_id.clone(), DocLocation { page_id: page.page_id, slot_index: new_slot })?;
                    }
                }
            }
        }

        let owned = state.owned_pages()?;
        if now_empty && owned.len() > 1 {
            let prev = page.prev_page_id;
            let next = page.next_page_id;
            if prev != 0 {
                let mut p = pm.get_page(prev)?;
                p.next_page_id = next;
                pm.save_page(p, false)?;
            }
            if next != 0 {
                let mut n = pm.get_page(next)?;
                n.prev_page_id = prev;
                pm.save_page(n, false)?;
            }
            pm.free_page(page.page_id)?;
            state.remove_owned_page(page.page_id)?;
            if state.current_insert_page()? == page.page_id {
                state.set_current_insert_page(prev)?;
            }
            if prev == 0 {
                let mut meta = self.meta.lock()?;
                let mut doc = meta.get_metadata(collection).cloned().unwrap_or_else(Self::metadata_doc_for_new_collection);
                doc.insert(META_ROOT_PAGE, next as i64);
                meta.update_metadata(pm, collection, doc, false)?;
            }
        } else {
            DataPageAccess::persist_page(pm, page, matches!(self.options.write_concern, WriteConcern::None))?;
        }

        Ok(old_doc)
    }

    /// Entries for a page after replacing (or tombstoning) one slot, in
    /// slot order — used by both update (replace) and delete (tombstone).
    fn live_entries(pm: &mut PageManager, page: &Page, replace: Option<(usize, Vec<u8>)>) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for (idx, raw) in DataPageAccess::scan_raw(page) {
            if let Some((target, new_bytes)) = &replace {
                if idx == *target {
                    out.push(new_bytes.clone());
                    continue;
                }
            }
            if let Some(bytes) = raw {
                out.push(bytes);
            }
        }
        let _ = pm;
        Ok(out)
    }

    /// After `rewrite_page`, slots compact toward the front; a replaced
    /// entry keeps the position index of every live entry before it.
    fn slot_for(page: &Page, original_slot: usize) -> usize {
        original_slot.min(page.item_count.saturating_sub(1) as usize)
    }

    pub fn delete_document(&self, collection: &str, id: &Bson, tx: Option<TransactionIdKind>) -> Result<usize> {
        self.require_not_disposed()?;

        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::Write)?;
            let Some(original) = self.find_by_id(collection, id, None)? else { return Ok(0) };
            self.transaction_manager.record_delete(tx, collection, id.clone(), original)?;
            return Ok(1);
        }

        self.apply_delete(collection, id)
    }

    fn apply_delete(&self, collection: &str, id: &Bson) -> Result<usize> {
        let state = self.ensure_collection(collection)?;
        let Some(loc) = state.lookup(id)? else { return Ok(0) };

        let mut pm = self.page_manager.lock()?;
        let page = pm.get_page(loc.page_id)?;
        let old_doc = self.remove_slot(&mut pm, &state, collection, page, loc.slot_index)?;
        drop(pm);

        state.remove_id(id)?;
        if let Some(doc) = old_doc {
            self.note_secondary_indexes_remove(collection, &doc, id)?;
        }
        self.flush_if_synced()?;
        Ok(1)
    }

    fn flush_if_synced(&self) -> Result<()> {
        if matches!(self.options.write_concern, WriteConcern::Synced) {
            self.flush()?;
        } else if matches!(self.options.write_concern, WriteConcern::Journaled) {
            let mut pm = self.page_manager.lock()?;
            let dirty = pm.take_dirty_pages();
            if dirty.is_empty() {
                return Ok(());
            }
            let mut wal_guard = self.wal.lock()?;
            match wal_guard.as_mut() {
                Some(w) => {
                    for p in &dirty {
                        w.append_page(p);
                    }
                    w.flush_log()?;
                    for p in dirty {
                        pm.save_page(p, true)?;
                    }
                    w.truncate()?;
                }
                None => {
                    for p in dirty {
                        pm.save_page(p, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_by_id(&self, collection: &str, id: &Bson, tx: Option<TransactionIdKind>) -> Result<Option<Document>> {
        self.require_not_disposed()?;
        let state = self.ensure_collection(collection)?;

        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::Read)?;
            let mut base = std::collections::BTreeMap::new();
            if let Some(loc) = state.lookup(id)? {
                let mut pm = self.page_manager.lock()?;
                let page = pm.get_page(loc.page_id)?;
                if let Some(doc) = DataPageAccess::read_document_at(&mut pm, &page, loc.slot_index, None) {
                    base.insert(format!("{:?}", id), doc);
                }
            }
            self.transaction_manager.merge_overlay(tx, collection, &mut base)?;
            return Ok(base.remove(&format!("{:?}", id)));
        }

        let Some(loc) = state.lookup(id)? else { return Ok(None) };
        let mut pm = self.page_manager.lock()?;
        let page = pm.get_page(loc.page_id)?;
        Ok(DataPageAccess::read_document_at(&mut pm, &page, loc.slot_index, None))
    }

    /// Iterates every owned page of `collection`, decoding live entries and
    /// skipping corrupt ones. Merges a transaction's pending operations when
    /// `tx` is given, per spec.md §4.5.
    pub fn find_all(&self, collection: &str, tx: Option<TransactionIdKind>) -> Result<Vec<Document>> {
        self.require_not_disposed()?;
        let state = self.ensure_collection(collection)?;
        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::Read)?;
        }

        let mut base = std::collections::BTreeMap::new();
        {
            let mut pm = self.page_manager.lock()?;
            for page_id in state.owned_pages()? {
                let page = pm.get_page(page_id)?;
                if page.page_type != PageType::Data {
                    continue;
                }
                for (_, doc) in DataPageAccess::scan_documents(&mut pm, &page) {
                    if let Some(id) = doc.get("_id") {
                        base.insert(format!("{:?}", id), doc);
                    }
                }
            }
        }

        if let Some(tx) = tx {
            self.transaction_manager.merge_overlay(tx, collection, &mut base)?;
        }

        Ok(base.into_values().collect())
    }

    /// Raw scan yielding `(bytes, requires_post_filter)` pairs; large-
    /// document stubs always force `requires_post_filter=true` since their
    /// real bytes live outside the page being scanned.
    pub fn find_all_raw(&self, collection: &str) -> Result<Vec<(Vec<u8>, bool)>> {
        self.find_all_raw_with_predicate_info(collection, &|_| None)
    }

    pub fn find_all_raw_with_predicate_info(
        &self,
        collection: &str,
        pushdown: &dyn Fn(&[u8]) -> Option<bool>,
    ) -> Result<Vec<(Vec<u8>, bool)>> {
        self.require_not_disposed()?;
        let state = self.ensure_collection(collection)?;
        let mut pm = self.page_manager.lock()?;
        let mut out = Vec::new();
        for page_id in state.owned_pages()? {
            let page = pm.get_page(page_id)?;
            if page.page_type != PageType::Data {
                continue;
            }
            for (_, raw) in DataPageAccess::scan_raw(&page) {
                let Some(bytes) = raw else { continue };
                let is_large_stub = looks_like_large_stub(&bytes);
                let requires_post_filter = is_large_stub || pushdown(&bytes).is_none();
                out.push((bytes, requires_post_filter));
            }
        }
        Ok(out)
    }

    // ---- indexes --------------------------------------------------------------

    pub fn ensure_index(&self, collection: &str, field: &str, unique: bool, tx: Option<TransactionIdKind>) -> Result<()> {
        self.require_not_disposed()?;
        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::IntentWrite)?;
            return self.transaction_manager.record_create_index(tx, collection, field, vec![field.to_string()], unique);
        }
        let mut idx = self.index_manager.lock()?;
        if idx.index_exists(collection, field) {
            return Ok(());
        }
        idx.create_index(collection, field, unique)
    }

    pub fn drop_index(&self, collection: &str, field: &str, tx: Option<TransactionIdKind>) -> Result<()> {
        self.require_not_disposed()?;
        if let Some(tx) = tx {
            self.acquire_for_tx(tx, collection, LockMode::IntentWrite)?;
            return self.transaction_manager.record_drop_index(tx, collection, field, vec![field.to_string()], false);
        }
        self.index_manager.lock()?.drop_index(collection, field)
    }

    /// Declares `schema` on `collection`'s metadata document, consumed
    /// during FK validation at transaction commit.
    pub fn register_schema(&self, collection: &str, schema: CollectionSchema) -> Result<()> {
        self.ensure_collection(collection)?;
        let mut pm = self.page_manager.lock()?;
        let mut meta = self.meta.lock()?;
        let mut doc = meta.get_metadata(collection).cloned().unwrap_or_else(Self::metadata_doc_for_new_collection);
        doc.insert(META_ID_FIELD, schema.id_field);
        let links: Vec<Bson> = schema
            .fk_links
            .into_iter()
            .map(|l| Bson::Document(bson::doc! { FK_FIELD: l.field, FK_REFERENCED: l.referenced_collection }))
            .collect();
        doc.insert(META_FK_LINKS, links);
        meta.update_metadata(&mut pm, collection, doc, false)
    }

    pub fn drop_collection(&self, collection: &str) -> Result<()> {
        self.require_not_disposed()?;
        let state = self.ensure_collection(collection)?;

        let mut pm = self.page_manager.lock()?;
        for page_id in state.owned_pages()? {
            let page = pm.get_page(page_id)?;
            for (_, doc) in DataPageAccess::scan_documents(&mut pm, &page) {
                if doc.get_bool(crate::data_page::STUB_IS_LARGE).unwrap_or(false) {
                    if let Ok(idx) = doc.get_i64(crate::data_page::STUB_INDEX) {
                        LargeDocumentStorage::free_chain(&mut pm, idx as u32)?;
                    }
                }
            }
            pm.free_page(page_id)?;
        }

        let mut meta = self.meta.lock()?;
        meta.remove_collection(&mut pm, collection, false)?;
        drop(meta);
        drop(pm);

        state.clear()?;
        self.collections.write()?.remove(collection);

        let mut idx = self.index_manager.lock()?;
        for field in idx.get_indexes(collection).into_iter().map(|d| d.field.clone()).collect::<Vec<_>>() {
            idx.drop_index(collection, &field)?;
        }
        Ok(())
    }

    // ---- transactions -----------------------------------------------------

    pub fn begin_transaction(&self) -> Result<TransactionIdKind> {
        self.transaction_manager.begin_transaction()
    }

    pub fn commit_transaction(&self, tx: TransactionIdKind) -> Result<()> {
        self.transaction_manager.commit(tx, self)
    }

    pub fn rollback_transaction(&self, tx: TransactionIdKind) -> Result<()> {
        self.transaction_manager.rollback(tx, self)
    }

    // ---- durability ---------------------------------------------------------

    /// Drains dirty pages and synchronizes through the WAL (if enabled) or
    /// directly to disk, per spec.md §4.2.
    pub fn flush(&self) -> Result<()> {
        let mut pm = self.page_manager.lock()?;
        let dirty = pm.take_dirty_pages();
        if dirty.is_empty() {
            return Ok(());
        }
        let mut wal_guard = self.wal.lock()?;
        match wal_guard.as_mut() {
            Some(w) => w.synchronize(&dirty, pm.disk_mut())?,
            None => {
                for p in dirty {
                    pm.save_page(p, true)?;
                }
            }
        }
        Ok(())
    }

    /// Alias for `flush`, exposed separately to match spec.md §4.5's public
    /// surface; this crate does not distinguish an incremental checkpoint
    /// from a full flush.
    pub fn checkpoint(&self) -> Result<()> {
        self.flush()
    }

    /// Writes every live page to a fresh `<path>.compact` file and
    /// atomically replaces the original, per spec.md §6.
    ///
    /// Compaction renumbers pages (freed slots are dropped, so ids shift
    /// down), which means every cross-reference baked into page contents —
    /// `prev`/`next` links, a collection's `root_page_id` in the metadata
    /// registry, a large-document stub's `_largeDocumentIndex`, and an
    /// overflow index page's chunk-id list — has to be rewritten through the
    /// same old-id -> new-id mapping, not just each page's own `page_id`
    /// field. Once the compacted file is in place, the live engine's page
    /// manager, metadata store, and per-collection caches are rebuilt from it
    /// so this `Engine` keeps working against the new layout without
    /// requiring a reopen.
    pub fn compact_database(&self) -> Result<()> {
        self.flush()?;
        let compact_path = compact_path_for(&self.path);
        if compact_path.exists() {
            std::fs::remove_file(&compact_path)?;
        }

        let mut pm = self.page_manager.lock()?;
        // held only to block concurrent metadata mutation for the duration of compaction
        let meta_guard = self.meta.lock()?;
        let page_size = pm.page_size();
        let cache_size = self.options.cache_size.max(1);
        let live_ids = pm.live_page_ids()?;

        let mut id_map: HashMap<u32, u32> = HashMap::with_capacity(live_ids.len());
        for (new_id, &old_id) in (1u32..).zip(live_ids.iter()) {
            id_map.insert(old_id, new_id);
        }

        let mut out = PageManager::open(&compact_path, page_size, cache_size, false)?;
        *out.header_mut() = pm.header().clone();
        out.header_mut().total_pages = live_ids.len() as u32;
        out.header_mut().used_pages = live_ids.len() as u32;
        if let Some(&new_root) = id_map.get(&pm.header().collection_root_page_id) {
            out.header_mut().collection_root_page_id = new_root;
        }
        out.disk_mut().set_page_count(live_ids.len() as u32)?;

        for &old_id in &live_ids {
            if old_id == DB_HEADER_PAGE_ID {
                continue; // the freshly opened `out` already owns page 1
            }
            let mut page = pm.get_page(old_id)?;
            page.page_id = id_map[&old_id];
            page.prev_page_id = id_map.get(&page.prev_page_id).copied().unwrap_or(0);
            page.next_page_id = id_map.get(&page.next_page_id).copied().unwrap_or(0);

            match page.page_type {
                PageType::Data => DataPageAccess::remap_large_doc_refs(&mut page, &id_map)?,
                PageType::LargeDocumentIndex => LargeDocumentStorage::remap_index_page(&mut page, &id_map)?,
                PageType::Collection => CollectionMetaStore::remap_page(&mut page, &id_map)?,
                _ => {}
            }

            out.save_page(page, false)?;
        }

        for page in out.take_dirty_pages() {
            let bytes = page.to_bytes(page_size);
            out.disk_mut().write_page(page.page_id, &bytes)?;
        }
        out.write_header_page_direct()?;
        out.disk_mut().sync_all()?;
        drop(out);
        drop(meta_guard);
        drop(pm);

        std::fs::rename(&compact_path, &self.path)?;

        let mut fresh_pm = PageManager::open(&self.path, page_size, cache_size, self.options.read_only)?;
        let root = fresh_pm.header().collection_root_page_id;
        let fresh_meta = CollectionMetaStore::load(&mut fresh_pm, root)?;

        *self.page_manager.lock()? = fresh_pm;
        *self.meta.lock()? = fresh_meta;
        self.collections.write()?.clear();
        Ok(())
    }

    pub fn get_statistics(&self) -> Result<EngineStatistics> {
        let pm = self.page_manager.lock()?;
        let collections = self.collections.read()?.len();
        Ok(EngineStatistics {
            total_pages: pm.total_pages(),
            used_pages: pm.used_pages(),
            free_pages: pm.total_pages().saturating_sub(pm.used_pages()),
            page_size: pm.page_size(),
            collection_count: collections,
            transactions: self.transaction_manager.get_statistics(),
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Cheap heuristic used only for the raw-scan predicate path: sniffs the
/// `_isLargeDocument` key without a full BSON decode by checking for the
/// stub's field name in the byte stream.
fn looks_like_large_stub(bytes: &[u8]) -> bool {
    let needle = crate::data_page::STUB_IS_LARGE.as_bytes();
    bytes.windows(needle.len()).any(|w| w == needle)
}

fn compact_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".compact");
    PathBuf::from(os)
}

enum FlushIntervalMillis {
    Some(u64),
    None,
}

fn flush_interval_millis(options: &Options) -> FlushIntervalMillis {
    match options.background_flush_interval {
        crate::options::FlushInterval::Infinite => FlushIntervalMillis::None,
        crate::options::FlushInterval::Millis(ms) => FlushIntervalMillis::Some(ms),
    }
}

impl OperationSink for Engine {
    fn insert_document(&self, collection: &str, doc: Document) -> Result<Bson> {
        self.apply_insert(collection, doc)
    }

    fn update_document(&self, collection: &str, doc: Document) -> Result<usize> {
        self.apply_update(collection, doc)
    }

    fn delete_document(&self, collection: &str, id: &Bson) -> Result<usize> {
        self.apply_delete(collection, id)
    }

    fn create_index(&self, collection: &str, name: &str, fields: &[String], unique: bool) -> Result<()> {
        let field = fields.first().map(String::as_str).unwrap_or(name);
        let mut idx = self.index_manager.lock()?;
        if idx.index_exists(collection, field) {
            return Ok(());
        }
        idx.create_index(collection, field, unique)
    }

    fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.index_manager.lock()?.drop_index(collection, name)
    }

    fn get_schema(&self, collection: &str) -> Option<CollectionSchema> {
        let meta = self.meta.lock().ok()?;
        let doc = meta.get_metadata(collection)?;
        let id_field = doc.get_str(META_ID_FIELD).unwrap_or("_id").to_string();
        let fk_links = doc
            .get_array(META_FK_LINKS)
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| b.as_document())
                    .map(|d| ForeignKeyLink {
                        field: d.get_str(FK_FIELD).unwrap_or_default().to_string(),
                        referenced_collection: d.get_str(FK_REFERENCED).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(CollectionSchema { id_field, fk_links })
    }

    fn id_exists(&self, collection: &str, id: &Bson) -> bool {
        self.ensure_collection(collection)
            .ok()
            .map(|s| s.contains_id(id).unwrap_or(false))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::tempdir;

    fn test_engine() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let options = Options::builder().page_size(4096).build().unwrap();
        (Engine::open(&path, options).unwrap(), dir)
    }

    #[test]
    fn insert_then_find_by_id_round_trips() {
        let (engine, _dir) = test_engine();
        let id = engine.insert_document("users", doc! { "name": "ada" }, None).unwrap();
        let found = engine.find_by_id("users", &id, None).unwrap().unwrap();
        assert_eq!(found.get_str("name").unwrap(), "ada");
    }

    #[test]
    fn duplicate_id_insert_fails() {
        let (engine, _dir) = test_engine();
        engine.insert_document("users", doc! { "_id": 1 }, None).unwrap();
        let err = engine.insert_document("users", doc! { "_id": 1 }, None).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn delete_then_find_all_is_empty() {
        let (engine, _dir) = test_engine();
        let id = engine.insert_document("users", doc! { "_id": 1 }, None).unwrap();
        assert_eq!(engine.delete_document("users", &id, None).unwrap(), 1);
        assert!(engine.find_all("users", None).unwrap().is_empty());
    }

    #[test]
    fn reinserting_many_documents_reuses_freed_pages() {
        let (engine, _dir) = test_engine();
        for i in 0..100 {
            engine.insert_document("users", doc! { "_id": i }, None).unwrap();
        }
        assert_eq!(engine.find_all("users", None).unwrap().len(), 100);
        let used_after_first_batch = engine.get_statistics().unwrap().used_pages;

        for i in 0..100 {
            engine.delete_document("users", &Bson::Int32(i), None).unwrap();
        }
        assert!(engine.find_all("users", None).unwrap().is_empty());

        for i in 1000..1100 {
            engine.insert_document("users", doc! { "_id": i }, None).unwrap();
        }
        assert_eq!(engine.find_all("users", None).unwrap().len(), 100);
        let used_after_second_batch = engine.get_statistics().unwrap().used_pages;
        assert!(used_after_second_batch <= used_after_first_batch);
    }

    #[test]
    fn large_document_round_trips_and_shrinks_back() {
        let (engine, _dir) = test_engine();
        let big = "x".repeat(6000);
        engine.insert_document("blobs", doc! { "_id": 1, "payload": big.clone() }, None).unwrap();

        let found = engine.find_by_id("blobs", &Bson::Int32(1), None).unwrap().unwrap();
        assert_eq!(found.get_str("payload").unwrap().len(), 6000);

        engine.update_document("blobs", doc! { "_id": 1, "payload": "x".repeat(10) }, None).unwrap();
        let shrunk = engine.find_by_id("blobs", &Bson::Int32(1), None).unwrap().unwrap();
        assert_eq!(shrunk.get_str("payload").unwrap().len(), 10);
    }

    #[test]
    fn transaction_commit_makes_insert_visible() {
        let (engine, _dir) = test_engine();
        let tx = engine.begin_transaction().unwrap();
        engine.insert_document("users", doc! { "_id": 1 }, Some(tx)).unwrap();
        assert!(engine.find_by_id("users", &Bson::Int32(1), None).unwrap().is_none());

        engine.commit_transaction(tx).unwrap();
        assert!(engine.find_by_id("users", &Bson::Int32(1), None).unwrap().is_some());
    }

    #[test]
    fn transaction_rollback_leaves_no_trace() {
        let (engine, _dir) = test_engine();
        engine.insert_document("users", doc! { "_id": 1, "val": "A" }, None).unwrap();

        let tx = engine.begin_transaction().unwrap();
        engine.update_document("users", doc! { "_id": 1, "val": "B" }, Some(tx)).unwrap();
        engine.insert_document("users", doc! { "_id": 2, "val": "C" }, Some(tx)).unwrap();
        engine.insert_document("users", doc! { "_id": 3, "val": "D" }, Some(tx)).unwrap();
        engine.delete_document("users", &Bson::Int32(3), Some(tx)).unwrap();
        engine.rollback_transaction(tx).unwrap();

        let all = engine.find_all("users", None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get_str("val").unwrap(), "A");
    }

    #[test]
    fn duplicate_id_inside_transaction_fails_commit() {
        let (engine, _dir) = test_engine();
        let tx = engine.begin_transaction().unwrap();
        engine.insert_document("users", doc! { "_id": 1 }, Some(tx)).unwrap();
        engine.insert_document("users", doc! { "_id": 1 }, Some(tx)).unwrap();

        let err = engine.commit_transaction(tx).unwrap_err();
        assert!(matches!(err, Error::DuplicateKeysInTransaction));
        assert_eq!(engine.find_all("users", None).unwrap().len(), 0);
    }

    #[test]
    fn batch_insert_collects_individual_failures() {
        let (engine, _dir) = test_engine();
        engine.insert_document("users", doc! { "_id": 1 }, None).unwrap();

        let outcome = engine
            .insert_documents(
                "users",
                vec![None, Some(doc! { "_id": 2 }), Some(doc! { "_id": 1 })],
                None,
            )
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert!(outcome.errors.is_some());
    }

    #[test]
    fn drop_collection_removes_all_documents_and_pages() {
        let (engine, _dir) = test_engine();
        engine.insert_document("users", doc! { "_id": 1 }, None).unwrap();
        engine.drop_collection("users").unwrap();
        assert!(engine.find_all("users", None).unwrap().is_empty());
    }

    /// spec.md §8 property 3 (index/data agreement): deleting a document
    /// that isn't the last slot on its page must not strand `find_by_id`
    /// for the documents that come after it once the page compacts.
    #[test]
    fn deleting_a_middle_document_keeps_later_documents_findable_by_id() {
        let (engine, _dir) = test_engine();
        engine.insert_document("users", doc! { "_id": 1, "val": "A" }, None).unwrap();
        engine.insert_document("users", doc! { "_id": 2, "val": "B" }, None).unwrap();
        engine.insert_document("users", doc! { "_id": 3, "val": "C" }, None).unwrap();

        assert_eq!(engine.delete_document("users", &Bson::Int32(2), None).unwrap(), 1);

        let found = engine.find_by_id("users", &Bson::Int32(3), None).unwrap();
        assert_eq!(found.unwrap().get_str("val").unwrap(), "C");
        assert_eq!(engine.find_all("users", None).unwrap().len(), 2);
    }

    /// spec.md §4.5: an update whose new value no longer fits in the free
    /// space its old slot plus the page's remaining capacity can offer must
    /// fall back to delete-then-reinsert instead of panicking inside
    /// `rewrite_page`'s fixed-capacity buffer, and the documents sharing
    /// that page with the old slot must stay findable afterward.
    #[test]
    fn updating_a_document_past_its_pages_capacity_relocates_it() {
        let (engine, _dir) = test_engine();
        let pad = "x".repeat(300);

        engine.insert_document("users", doc! { "_id": 1, "val": "small" }, None).unwrap();
        for i in 2..14 {
            engine.insert_document("users", doc! { "_id": i, "pad": pad.clone() }, None).unwrap();
        }

        let big = "y".repeat(1000);
        assert_eq!(
            engine.update_document("users", doc! { "_id": 1, "pad": big.clone() }, None).unwrap(),
            1
        );

        let found = engine.find_by_id("users", &Bson::Int32(1), None).unwrap().unwrap();
        assert_eq!(found.get_str("pad").unwrap(), big);

        for i in 2..14 {
            let sibling = engine.find_by_id("users", &Bson::Int32(i), None).unwrap();
            assert!(sibling.is_some(), "document {i} should still be findable after its page compacted");
        }
        assert_eq!(engine.find_all("users", None).unwrap().len(), 13);
    }

    /// spec.md §8 S5: crash between the WAL fsync and the main-file write
    /// must still leave every record recoverable on reopen. `flush`'s own
    /// write-then-truncate happens in one call, so the only way to observe
    /// the "WAL durable, main file stale" window is to drive the two halves
    /// by hand the way `flush` does internally.
    #[test]
    fn wal_crash_recovery_replays_pending_frames_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let options = Options::builder()
            .page_size(4096)
            .enable_journaling(true)
            .write_concern(WriteConcern::None)
            .build()
            .unwrap();
        let engine = Engine::open(&path, options.clone()).unwrap();

        for k in 0..10 {
            engine.insert_document("users", doc! { "_id": k }, None).unwrap();
        }

        let pre_flush_image = std::fs::read(&path).unwrap();

        let dirty = engine.page_manager.lock().unwrap().take_dirty_pages();
        assert!(!dirty.is_empty());

        let wal_path = options.wal_path(&path);
        {
            let mut wal_guard = engine.wal.lock().unwrap();
            let wal = wal_guard.as_mut().unwrap();
            for p in &dirty {
                wal.append_page(p);
            }
            wal.flush_log().unwrap();
        }
        let wal_with_frames = std::fs::read(&wal_path).unwrap();
        engine.shutdown().unwrap();
        drop(engine);

        std::fs::write(&path, &pre_flush_image).unwrap();
        std::fs::write(&wal_path, &wal_with_frames).unwrap();

        let reopened = Engine::open(&path, options).unwrap();
        let all = reopened.find_all("users", None).unwrap();
        assert_eq!(all.len(), 10);
    }

    /// The very first collection used in a fresh database allocates the
    /// `CollectionMetaStore` page itself and updates
    /// `DatabaseHeader.collection_root_page_id` -- a header-page mutation
    /// just like any other dirty page. If that header update only reached
    /// the WAL before a crash, `PageManager::open` (which reads page 1
    /// straight off disk before replay runs) must not keep using the
    /// pre-replay, root-less header once replay has corrected page 1 on
    /// disk, or the reopened engine recreates an empty metadata registry
    /// and orphans the collection that was actually written.
    #[test]
    fn wal_replay_refreshes_header_so_metadata_root_is_not_recreated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let options = Options::builder()
            .page_size(4096)
            .enable_journaling(true)
            .write_concern(WriteConcern::None)
            .build()
            .unwrap();
        let engine = Engine::open(&path, options.clone()).unwrap();
        let pre_insert_image = std::fs::read(&path).unwrap();

        engine.insert_document("users", doc! { "_id": 1, "name": "ada" }, None).unwrap();

        let dirty = engine.page_manager.lock().unwrap().take_dirty_pages();
        assert!(dirty.iter().any(|p| p.page_id == DB_HEADER_PAGE_ID));

        let wal_path = options.wal_path(&path);
        {
            let mut wal_guard = engine.wal.lock().unwrap();
            let wal = wal_guard.as_mut().unwrap();
            for p in &dirty {
                wal.append_page(p);
            }
            wal.flush_log().unwrap();
        }
        let wal_with_frames = std::fs::read(&wal_path).unwrap();
        engine.shutdown().unwrap();
        drop(engine);

        std::fs::write(&path, &pre_insert_image).unwrap();
        std::fs::write(&wal_path, &wal_with_frames).unwrap();

        let reopened = Engine::open(&path, options).unwrap();
        let all = reopened.find_all("users", None).unwrap();
        assert_eq!(all.len(), 1, "collection registered before the crash must still be known after replay");
        assert_eq!(all[0].get_str("name").unwrap(), "ada");
    }

    /// `WriteConcern::Journaled` fsyncs the WAL and force-writes dirty pages
    /// to the main file on every mutating call; the WAL frames it staged
    /// must then be truncated, same as `flush`/`synchronize` do, or the log
    /// grows without bound and every reopen replays the database's entire
    /// write history instead of finding an empty WAL.
    #[test]
    fn journaled_write_concern_truncates_the_wal_after_each_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let options = Options::builder()
            .page_size(4096)
            .enable_journaling(true)
            .write_concern(WriteConcern::Journaled)
            .build()
            .unwrap();
        let engine = Engine::open(&path, options).unwrap();

        for i in 0..20 {
            engine.insert_document("users", doc! { "_id": i }, None).unwrap();
        }

        assert!(
            !engine.wal.lock().unwrap().as_ref().unwrap().has_frames().unwrap(),
            "WAL should be truncated after each journaled write completes"
        );
    }
}
