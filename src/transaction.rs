//! A single multi-statement transaction: an ordered operation log plus
//! savepoints, per spec.md §4.7. Grounded on the state-machine shape of
//! `PenTest-duck-horizon-database/src/mvcc/mod.rs`'s `Transaction`
//! (states, ordered op log), adapted to this crate's apply/rollback-pair
//! commit protocol instead of MVCC snapshot isolation.

use std::collections::BTreeMap;
use std::time::Instant;

use bson::{Bson, Document};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    CreateIndex,
    DropIndex,
}

#[derive(Debug, Clone)]
pub struct TransactionOperation {
    pub id: u64,
    pub op_type: OperationType,
    pub collection: String,
    pub document_id: Option<Bson>,
    pub original_doc: Option<Document>,
    pub new_doc: Option<Document>,
    pub index_name: Option<String>,
    pub index_fields: Option<Vec<String>>,
    pub index_unique: Option<bool>,
}

pub struct Transaction {
    pub id: TransactionIdKind,
    pub state: TransactionState,
    pub started_at: Instant,
    pub operations: Vec<TransactionOperation>,
    savepoints: BTreeMap<Uuid, usize>,
    savepoint_order: Vec<Uuid>,
    next_op_id: u64,
}

pub type TransactionIdKind = u64;

impl Transaction {
    pub fn new(id: TransactionIdKind) -> Transaction {
        Transaction {
            id,
            state: TransactionState::Active,
            started_at: Instant::now(),
            operations: Vec::new(),
            savepoints: BTreeMap::new(),
            savepoint_order: Vec::new(),
            next_op_id: 0,
        }
    }

    fn require_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::TransactionNotActive);
        }
        Ok(())
    }

    fn push(&mut self, op: TransactionOperation) -> Result<()> {
        self.require_active()?;
        self.operations.push(op);
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    pub fn record_insert(&mut self, collection: &str, new_doc: Document) -> Result<()> {
        let id = self.next_id();
        self.push(TransactionOperation {
            id,
            op_type: OperationType::Insert,
            collection: collection.to_string(),
            document_id: new_doc.get("_id").cloned(),
            original_doc: None,
            new_doc: Some(new_doc),
            index_name: None,
            index_fields: None,
            index_unique: None,
        })
    }

    pub fn record_update(&mut self, collection: &str, document_id: Bson, original_doc: Document, new_doc: Document) -> Result<()> {
        let id = self.next_id();
        self.push(TransactionOperation {
            id,
            op_type: OperationType::Update,
            collection: collection.to_string(),
            document_id: Some(document_id),
            original_doc: Some(original_doc),
            new_doc: Some(new_doc),
            index_name: None,
            index_fields: None,
            index_unique: None,
        })
    }

    pub fn record_delete(&mut self, collection: &str, document_id: Bson, original_doc: Document) -> Result<()> {
        let id = self.next_id();
        self.push(TransactionOperation {
            id,
            op_type: OperationType::Delete,
            collection: collection.to_string(),
            document_id: Some(document_id),
            original_doc: Some(original_doc),
            new_doc: None,
            index_name: None,
            index_fields: None,
            index_unique: None,
        })
    }

    pub fn record_create_index(&mut self, collection: &str, name: &str, fields: Vec<String>, unique: bool) -> Result<()> {
        let id = self.next_id();
        self.push(TransactionOperation {
            id,
            op_type: OperationType::CreateIndex,
            collection: collection.to_string(),
            document_id: None,
            original_doc: None,
            new_doc: None,
            index_name: Some(name.to_string()),
            index_fields: Some(fields),
            index_unique: Some(unique),
        })
    }

    pub fn record_drop_index(&mut self, collection: &str, name: &str, fields: Vec<String>, unique: bool) -> Result<()> {
        let id = self.next_id();
        self.push(TransactionOperation {
            id,
            op_type: OperationType::DropIndex,
            collection: collection.to_string(),
            document_id: None,
            original_doc: None,
            new_doc: None,
            index_name: Some(name.to_string()),
            index_fields: Some(fields),
            index_unique: Some(unique),
        })
    }

    /// Merges this transaction's pending operations for `collection` over
    /// a base document set: inserts are yielded, updates override the
    /// stored version, deletes suppress rows. Used by `find_all`.
    pub fn merge_overlay(&self, collection: &str, base: &mut BTreeMap<String, Document>) {
        for op in &self.operations {
            if op.collection != collection {
                continue;
            }
            let Some(id) = &op.document_id else { continue };
            let Some(key) = bson_doc_key(id) else { continue };
            match op.op_type {
                OperationType::Insert | OperationType::Update => {
                    if let Some(doc) = &op.new_doc {
                        base.insert(key, doc.clone());
                    }
                }
                OperationType::Delete => {
                    base.remove(&key);
                }
                OperationType::CreateIndex | OperationType::DropIndex => {}
            }
        }
    }

    pub fn create_savepoint(&mut self) -> Result<Uuid> {
        self.require_active()?;
        let id = Uuid::new_v4();
        self.savepoints.insert(id, self.operations.len());
        self.savepoint_order.push(id);
        Ok(id)
    }

    pub fn rollback_to_savepoint(&mut self, id: Uuid) -> Result<()> {
        let len = *self
            .savepoints
            .get(&id)
            .ok_or_else(|| Error::InvalidSavepoint)?;
        self.operations.truncate(len);

        if let Some(pos) = self.savepoint_order.iter().position(|&s| s == id) {
            for later in self.savepoint_order.split_off(pos + 1) {
                self.savepoints.remove(&later);
            }
        }
        Ok(())
    }

    pub fn release_savepoint(&mut self, id: Uuid) -> Result<()> {
        if self.savepoints.remove(&id).is_none() {
            return Err(Error::InvalidSavepoint);
        }
        self.savepoint_order.retain(|&s| s != id);
        Ok(())
    }
}

fn bson_doc_key(id: &Bson) -> Option<String> {
    Some(format!("{:?}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn savepoint_rollback_truncates_operations() {
        let mut tx = Transaction::new(1);
        tx.record_insert("users", doc! { "_id": 1 }).unwrap();
        let sp = tx.create_savepoint().unwrap();
        tx.record_insert("users", doc! { "_id": 2 }).unwrap();
        assert_eq!(tx.operations.len(), 2);

        tx.rollback_to_savepoint(sp).unwrap();
        assert_eq!(tx.operations.len(), 1);
    }

    #[test]
    fn rollback_to_invalid_savepoint_errors() {
        let mut tx = Transaction::new(1);
        let sp = tx.create_savepoint().unwrap();
        tx.release_savepoint(sp).unwrap();
        assert!(matches!(tx.rollback_to_savepoint(sp), Err(Error::InvalidSavepoint)));
    }

    #[test]
    fn merge_overlay_reflects_insert_update_delete() {
        let mut tx = Transaction::new(1);
        tx.record_insert("users", doc! { "_id": 1, "name": "a" }).unwrap();
        tx.record_insert("users", doc! { "_id": 2, "name": "b" }).unwrap();
        tx.record_update("users", Bson::Int32(1), doc! { "_id": 1, "name": "a" }, doc! { "_id": 1, "name": "a2" })
            .unwrap();
        tx.record_delete("users", Bson::Int32(2), doc! { "_id": 2, "name": "b" }).unwrap();

        let mut base = BTreeMap::new();
        tx.merge_overlay("users", &mut base);

        assert_eq!(base.len(), 1);
        let only = base.values().next().unwrap();
        assert_eq!(only.get_str("name").unwrap(), "a2");
    }

    #[test]
    fn pushing_after_requiring_active_fails_when_not_active() {
        let mut tx = Transaction::new(1);
        tx.state = TransactionState::Committed;
        assert!(matches!(
            tx.record_insert("users", doc! { "_id": 1 }),
            Err(Error::TransactionNotActive)
        ));
    }
}
