//! Owns the set of active transactions, enforces `max_active_transactions`
//! and `transaction_timeout`, and runs two-phase commit with compensation
//! rollback per spec.md §4.7. Grounded on the state-machine shape of
//! `transaction/transaction_inner.rs` and `journal/journal.rs`'s
//! `TransactionType` (read/write transaction bookkeeping), enriched with
//! `PenTest-duck-horizon-database/src/mvcc/mod.rs`'s dense `#[cfg(test)]`
//! test idiom for this module's own test style.
//!
//! `TransactionManager` never touches `Engine` directly -- it commits
//! against an `OperationSink`, the seam that lets `Engine` implement the
//! apply/rollback pairs without a reference cycle between the two types.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bson::{Bson, Document};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock_manager::LockManager;
use crate::transaction::{OperationType, Transaction, TransactionIdKind, TransactionState};

#[derive(Debug, Clone)]
pub struct ForeignKeyLink {
    pub field: String,
    pub referenced_collection: String,
}

#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub id_field: String,
    pub fk_links: Vec<ForeignKeyLink>,
}

/// The callback surface `TransactionManager` applies committed/rolled-back
/// operations through. `Engine` is the only real implementation; tests use
/// a fake.
pub trait OperationSink {
    fn insert_document(&self, collection: &str, doc: Document) -> Result<Bson>;
    fn update_document(&self, collection: &str, doc: Document) -> Result<usize>;
    fn delete_document(&self, collection: &str, id: &Bson) -> Result<usize>;
    fn create_index(&self, collection: &str, name: &str, fields: &[String], unique: bool) -> Result<()>;
    fn drop_index(&self, collection: &str, name: &str) -> Result<()>;
    fn get_schema(&self, collection: &str) -> Option<CollectionSchema>;
    fn id_exists(&self, collection: &str, id: &Bson) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct TransactionManagerStats {
    pub active: usize,
    pub committed_total: u64,
    pub rolled_back_total: u64,
    pub failed_total: u64,
    pub timed_out_total: u64,
}

struct Counters {
    committed_total: u64,
    rolled_back_total: u64,
    failed_total: u64,
    timed_out_total: u64,
}

pub struct TransactionManager {
    transactions: Mutex<HashMap<TransactionIdKind, Transaction>>,
    lock_manager: Arc<LockManager>,
    next_id: AtomicU64,
    max_active_transactions: usize,
    transaction_timeout: Duration,
    counters: Mutex<Counters>,
    cleanup_signal: Arc<(Mutex<bool>, Condvar)>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, max_active_transactions: usize, transaction_timeout: Duration) -> TransactionManager {
        TransactionManager {
            transactions: Mutex::new(HashMap::new()),
            lock_manager,
            next_id: AtomicU64::new(1),
            max_active_transactions,
            transaction_timeout,
            counters: Mutex::new(Counters {
                committed_total: 0,
                rolled_back_total: 0,
                failed_total: 0,
                timed_out_total: 0,
            }),
            cleanup_signal: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn begin_transaction(&self) -> Result<TransactionIdKind> {
        let mut txs = self.transactions.lock()?;
        if txs.len() >= self.max_active_transactions {
            return Err(Error::TooManyTransactions);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        txs.insert(id, Transaction::new(id));
        Ok(id)
    }

    fn with_tx<R>(&self, id: TransactionIdKind, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
        let mut txs = self.transactions.lock()?;
        let tx = txs.get_mut(&id).ok_or(Error::TransactionNotActive)?;
        f(tx)
    }

    pub fn record_insert(&self, id: TransactionIdKind, collection: &str, new_doc: Document) -> Result<()> {
        self.with_tx(id, |tx| tx.record_insert(collection, new_doc))
    }

    pub fn record_update(&self, id: TransactionIdKind, collection: &str, document_id: Bson, original: Document, new_doc: Document) -> Result<()> {
        self.with_tx(id, |tx| tx.record_update(collection, document_id, original, new_doc))
    }

    pub fn record_delete(&self, id: TransactionIdKind, collection: &str, document_id: Bson, original: Document) -> Result<()> {
        self.with_tx(id, |tx| tx.record_delete(collection, document_id, original))
    }

    pub fn record_create_index(&self, id: TransactionIdKind, collection: &str, name: &str, fields: Vec<String>, unique: bool) -> Result<()> {
        self.with_tx(id, |tx| tx.record_create_index(collection, name, fields, unique))
    }

    pub fn record_drop_index(&self, id: TransactionIdKind, collection: &str, name: &str, fields: Vec<String>, unique: bool) -> Result<()> {
        self.with_tx(id, |tx| tx.record_drop_index(collection, name, fields, unique))
    }

    pub fn create_savepoint(&self, id: TransactionIdKind) -> Result<Uuid> {
        self.with_tx(id, |tx| tx.create_savepoint())
    }

    pub fn rollback_to_savepoint(&self, id: TransactionIdKind, savepoint: Uuid) -> Result<()> {
        self.with_tx(id, |tx| tx.rollback_to_savepoint(savepoint))
    }

    pub fn release_savepoint(&self, id: TransactionIdKind, savepoint: Uuid) -> Result<()> {
        self.with_tx(id, |tx| tx.release_savepoint(savepoint))
    }

    /// Merges `transaction_id`'s pending ops over `base` for `find_all`.
    pub fn merge_overlay(&self, id: TransactionIdKind, collection: &str, base: &mut std::collections::BTreeMap<String, Document>) -> Result<()> {
        let txs = self.transactions.lock()?;
        if let Some(tx) = txs.get(&id) {
            tx.merge_overlay(collection, base);
        }
        Ok(())
    }

    fn validate_duplicate_ids(tx: &Transaction) -> Result<()> {
        let mut seen: HashMap<&str, Vec<&Bson>> = HashMap::new();
        for op in &tx.operations {
            if !matches!(op.op_type, OperationType::Insert) {
                continue;
            }
            let Some(id) = &op.document_id else { continue };
            let bucket = seen.entry(op.collection.as_str()).or_default();
            if bucket.iter().any(|seen_id| *seen_id == id) {
                return Err(Error::DuplicateKeysInTransaction);
            }
            bucket.push(id);
        }
        Ok(())
    }

    fn validate_foreign_keys(tx: &Transaction, sink: &dyn OperationSink) -> Result<()> {
        for op in &tx.operations {
            if !matches!(op.op_type, OperationType::Insert) {
                continue;
            }
            let Some(schema) = sink.get_schema(&op.collection) else { continue };
            let Some(doc) = &op.new_doc else { continue };

            for link in &schema.fk_links {
                let value = lookup_fk_field(doc, &link.field);
                match value {
                    None | Some(Bson::Null) => continue,
                    Some(v) => {
                        if !sink.id_exists(&link.referenced_collection, v) {
                            return Err(Error::ForeignKeyViolation {
                                field: link.field.clone(),
                                collection: link.referenced_collection.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_single(op: &crate::transaction::TransactionOperation, sink: &dyn OperationSink) -> Result<()> {
        match op.op_type {
            OperationType::Insert => {
                sink.insert_document(&op.collection, op.new_doc.clone().unwrap_or_default())?;
                Ok(())
            }
            OperationType::Update => {
                sink.update_document(&op.collection, op.new_doc.clone().unwrap_or_default())?;
                Ok(())
            }
            OperationType::Delete => {
                let id = op.document_id.as_ref().ok_or(Error::MissingId)?;
                sink.delete_document(&op.collection, id)?;
                Ok(())
            }
            OperationType::CreateIndex => {
                let name = op.index_name.as_deref().ok_or_else(|| Error::UnsupportedOperation("CreateIndex without name".into()))?;
                let fields = op.index_fields.clone().unwrap_or_default();
                sink.create_index(&op.collection, name, &fields, op.index_unique.unwrap_or(false))
            }
            OperationType::DropIndex => {
                let name = op.index_name.as_deref().ok_or_else(|| Error::UnsupportedOperation("DropIndex without name".into()))?;
                sink.drop_index(&op.collection, name)
            }
        }
    }

    fn rollback_single(op: &crate::transaction::TransactionOperation, sink: &dyn OperationSink) {
        let result: Result<()> = match op.op_type {
            OperationType::Insert => op
                .document_id
                .as_ref()
                .map(|id| sink.delete_document(&op.collection, id).map(|_| ()))
                .unwrap_or(Ok(())),
            OperationType::Update => op
                .original_doc
                .clone()
                .map(|d| sink.update_document(&op.collection, d).map(|_| ()))
                .unwrap_or(Ok(())),
            OperationType::Delete => op
                .original_doc
                .clone()
                .map(|d| sink.insert_document(&op.collection, d).map(|_| ()))
                .unwrap_or(Ok(())),
            OperationType::CreateIndex => op
                .index_name
                .as_deref()
                .map(|n| sink.drop_index(&op.collection, n))
                .unwrap_or(Ok(())),
            OperationType::DropIndex => op.index_name.as_deref().map(|n| {
                sink.create_index(&op.collection, n, op.index_fields.as_deref().unwrap_or(&[]), op.index_unique.unwrap_or(false))
            }).unwrap_or(Ok(())),
        };
        // compensation failures are swallowed; best-effort rollback per spec.md §4.7
        let _ = result;
    }

    /// Two-phase apply with compensation: validate, apply in order, and on
    /// first failure roll back the already-applied prefix in reverse.
    pub fn commit(&self, id: TransactionIdKind, sink: &dyn OperationSink) -> Result<()> {
        let mut tx = {
            let mut txs = self.transactions.lock()?;
            txs.remove(&id).ok_or(Error::TransactionNotActive)?
        };

        if tx.state != TransactionState::Active {
            return Err(Error::TransactionNotActive);
        }

        if let Err(e) = Self::validate_duplicate_ids(&tx).and_then(|_| Self::validate_foreign_keys(&tx, sink)) {
            tx.state = TransactionState::Failed;
            self.lock_manager.release_all_locks(id)?;
            self.counters.lock()?.failed_total += 1;
            return Err(e);
        }

        let mut applied = 0usize;
        let mut commit_err = None;
        for op in &tx.operations {
            match Self::apply_single(op, sink) {
                Ok(()) => applied += 1,
                Err(e) => {
                    commit_err = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = commit_err {
            for op in tx.operations[..applied].iter().rev() {
                Self::rollback_single(op, sink);
            }
            tx.state = TransactionState::Failed;
            self.lock_manager.release_all_locks(id)?;
            self.counters.lock()?.failed_total += 1;
            return Err(Error::TransactionCommitError(Box::new(err)));
        }

        tx.state = TransactionState::Committed;
        self.lock_manager.release_all_locks(id)?;
        self.counters.lock()?.committed_total += 1;
        Ok(())
    }

    /// Explicit rollback: applies `rollback_single` to every operation in
    /// reverse, swallowing failures, then marks the transaction
    /// `RolledBack`. Permitted from `Failed` too.
    pub fn rollback(&self, id: TransactionIdKind, sink: &dyn OperationSink) -> Result<()> {
        let mut tx = {
            let mut txs = self.transactions.lock()?;
            txs.remove(&id).ok_or(Error::TransactionNotActive)?
        };

        for op in tx.operations.iter().rev() {
            Self::rollback_single(op, sink);
        }
        tx.state = TransactionState::RolledBack;
        self.lock_manager.release_all_locks(id)?;
        self.counters.lock()?.rolled_back_total += 1;
        Ok(())
    }

    /// Auto-rollback of any still-active transaction; swallows errors.
    pub fn dispose(&self, sink: &dyn OperationSink) {
        let ids: Vec<TransactionIdKind> = match self.transactions.lock() {
            Ok(txs) => txs.keys().copied().collect(),
            Err(_) => return,
        };
        for id in ids {
            let _ = self.rollback(id, sink);
        }
    }

    /// Marks every transaction older than `transaction_timeout` as
    /// `Failed` and evicts it (locks released, best-effort). Returns the
    /// number evicted.
    pub fn cleanup_once(&self) -> Result<usize> {
        let now = Instant::now();
        let mut txs = self.transactions.lock()?;
        let expired: Vec<TransactionIdKind> = txs
            .iter()
            .filter(|(_, tx)| now.duration_since(tx.started_at) > self.transaction_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            txs.remove(id);
            self.lock_manager.release_all_locks(*id)?;
        }
        drop(txs);

        if !expired.is_empty() {
            let mut counters = self.counters.lock()?;
            counters.timed_out_total += expired.len() as u64;
            counters.failed_total += expired.len() as u64;
        }
        Ok(expired.len())
    }

    /// Spawns the periodic cleanup worker: a single thread with a
    /// cancellable sleep, joined deterministically by `stop_cleanup_thread`.
    pub fn spawn_cleanup_thread(self: &Arc<Self>, interval: Duration) -> std::thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        let signal = Arc::clone(&self.cleanup_signal);
        std::thread::spawn(move || {
            let (lock, cvar) = &*signal;
            loop {
                let guard = lock.lock().unwrap();
                let (guard, timed_out) = cvar.wait_timeout(guard, interval).unwrap();
                if *guard {
                    break;
                }
                drop(timed_out);
                let _ = manager.cleanup_once();
            }
        })
    }

    pub fn stop_cleanup_thread(&self) {
        let (lock, cvar) = &*self.cleanup_signal;
        let mut stop = lock.lock().unwrap();
        *stop = true;
        cvar.notify_all();
    }

    pub fn get_statistics(&self) -> TransactionManagerStats {
        let active = self.transactions.lock().map(|t| t.len()).unwrap_or(0);
        let counters = self.counters.lock().ok();
        TransactionManagerStats {
            active,
            committed_total: counters.as_ref().map(|c| c.committed_total).unwrap_or(0),
            rolled_back_total: counters.as_ref().map(|c| c.rolled_back_total).unwrap_or(0),
            failed_total: counters.as_ref().map(|c| c.failed_total).unwrap_or(0),
            timed_out_total: counters.as_ref().map(|c| c.timed_out_total).unwrap_or(0),
        }
    }
}

/// Tries the declared field name, then falls back to the same name with
/// its first character lowercased, per this crate's Open Question
/// decision on FK alternate-name lookup.
fn lookup_fk_field<'a>(doc: &'a Document, field: &str) -> Option<&'a Bson> {
    if let Some(v) = doc.get(field) {
        return Some(v);
    }
    let mut chars = field.chars();
    let alt = match chars.next() {
        Some(c) => c.to_lowercase().collect::<String>() + chars.as_str(),
        None => return None,
    };
    doc.get(&alt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeSink {
        inserted: StdMutex<Vec<(String, Document)>>,
        deleted: StdMutex<Vec<(String, Bson)>>,
        fail_on_collection: Option<String>,
        schemas: StdMutex<HashMap<String, CollectionSchema>>,
        existing_ids: StdMutex<Vec<(String, Bson)>>,
    }

    impl OperationSink for FakeSink {
        fn insert_document(&self, collection: &str, doc: Document) -> Result<Bson> {
            if self.fail_on_collection.as_deref() == Some(collection) {
                return Err(Error::Other("forced failure".into()));
            }
            let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
            self.inserted.lock().unwrap().push((collection.to_string(), doc));
            Ok(id)
        }
        fn update_document(&self, _collection: &str, _doc: Document) -> Result<usize> {
            Ok(1)
        }
        fn delete_document(&self, collection: &str, id: &Bson) -> Result<usize> {
            self.deleted.lock().unwrap().push((collection.to_string(), id.clone()));
            Ok(1)
        }
        fn create_index(&self, _c: &str, _n: &str, _f: &[String], _u: bool) -> Result<()> {
            Ok(())
        }
        fn drop_index(&self, _c: &str, _n: &str) -> Result<()> {
            Ok(())
        }
        fn get_schema(&self, collection: &str) -> Option<CollectionSchema> {
            self.schemas.lock().unwrap().get(collection).cloned()
        }
        fn id_exists(&self, collection: &str, id: &Bson) -> bool {
            self.existing_ids.lock().unwrap().iter().any(|(c, i)| c == collection && i == id)
        }
    }

    fn new_manager() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()), 8, Duration::from_secs(60))
    }

    #[test]
    fn commit_applies_inserts_in_order() {
        let tm = new_manager();
        let sink = FakeSink::default();
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "users", doc! { "_id": 1 }).unwrap();
        tm.record_insert(id, "users", doc! { "_id": 2 }).unwrap();

        tm.commit(id, &sink).unwrap();
        assert_eq!(sink.inserted.lock().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_ids_in_same_collection_fail_validation() {
        let tm = new_manager();
        let sink = FakeSink::default();
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "users", doc! { "_id": 1 }).unwrap();
        tm.record_insert(id, "users", doc! { "_id": 1 }).unwrap();

        let err = tm.commit(id, &sink).unwrap_err();
        assert!(matches!(err, Error::DuplicateKeysInTransaction));
    }

    #[test]
    fn failure_mid_commit_rolls_back_prefix_in_reverse() {
        let tm = new_manager();
        let mut sink = FakeSink::default();
        sink.fail_on_collection = Some("orders".to_string());
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "users", doc! { "_id": 1 }).unwrap();
        tm.record_insert(id, "orders", doc! { "_id": 2 }).unwrap();

        let err = tm.commit(id, &sink).unwrap_err();
        assert!(matches!(err, Error::TransactionCommitError(_)));
        assert_eq!(*sink.deleted.lock().unwrap(), vec![("users".to_string(), Bson::Int32(1))]);
    }

    #[test]
    fn foreign_key_violation_blocks_commit() {
        let tm = new_manager();
        let sink = FakeSink::default();
        sink.schemas.lock().unwrap().insert(
            "orders".to_string(),
            CollectionSchema {
                id_field: "_id".to_string(),
                fk_links: vec![ForeignKeyLink { field: "userId".to_string(), referenced_collection: "users".to_string() }],
            },
        );
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "orders", doc! { "_id": 1, "userId": 99 }).unwrap();

        let err = tm.commit(id, &sink).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation { .. }));
    }

    #[test]
    fn foreign_key_resolves_via_lowercased_alternate_name() {
        let tm = new_manager();
        let sink = FakeSink::default();
        sink.existing_ids.lock().unwrap().push(("users".to_string(), Bson::Int32(7)));
        sink.schemas.lock().unwrap().insert(
            "orders".to_string(),
            CollectionSchema {
                id_field: "_id".to_string(),
                fk_links: vec![ForeignKeyLink { field: "UserId".to_string(), referenced_collection: "users".to_string() }],
            },
        );
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "orders", doc! { "_id": 1, "userId": 7 }).unwrap();

        tm.commit(id, &sink).unwrap();
    }

    #[test]
    fn too_many_active_transactions_rejected() {
        let tm = TransactionManager::new(Arc::new(LockManager::new()), 1, Duration::from_secs(60));
        tm.begin_transaction().unwrap();
        assert!(matches!(tm.begin_transaction(), Err(Error::TooManyTransactions)));
    }

    #[test]
    fn cleanup_evicts_expired_transactions() {
        let tm = TransactionManager::new(Arc::new(LockManager::new()), 8, Duration::from_millis(1));
        tm.begin_transaction().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let evicted = tm.cleanup_once().unwrap();
        assert_eq!(evicted, 1);
    }

    #[test]
    fn explicit_rollback_reverses_all_operations() {
        let tm = new_manager();
        let sink = FakeSink::default();
        let id = tm.begin_transaction().unwrap();
        tm.record_insert(id, "users", doc! { "_id": 1 }).unwrap();

        tm.rollback(id, &sink).unwrap();
        assert_eq!(sink.deleted.lock().unwrap().len(), 1);
    }
}
