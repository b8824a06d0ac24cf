//! Secondary-index management as an external black-box: `Engine` talks to
//! an `IndexManager` trait object rather than owning index storage itself.
//! `BTreeIndexManager` is the concrete, in-memory implementation shipped
//! for tests and standalone use. Trait-seam placement follows the
//! teacher's own preference for pulling storage engines behind a trait
//! (seen across its `backend/*` module split), generalized here to index
//! storage specifically since indexing sits outside this crate's stated
//! scope.

use std::collections::BTreeMap;

use bson::Bson;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub collection: String,
    pub field: String,
    pub unique: bool,
}

/// A pluggable secondary-index backend keyed by `(collection, field)`.
/// Implementations are free to store however they like; this crate only
/// ever calls through the trait.
pub trait IndexManager: Send + Sync {
    fn create_index(&mut self, collection: &str, field: &str, unique: bool) -> Result<()>;
    fn drop_index(&mut self, collection: &str, field: &str) -> Result<()>;
    fn index_exists(&self, collection: &str, field: &str) -> bool;
    fn get_index(&self, collection: &str, field: &str) -> Option<&IndexDescriptor>;
    fn get_indexes(&self, collection: &str) -> Vec<&IndexDescriptor>;

    /// Records that `key` now maps to the document identified by `doc_id`
    /// for the given `(collection, field)` index, if one exists.
    fn note_insert(&mut self, collection: &str, field: &str, key: &Bson, doc_id: &Bson) -> Result<()>;
    fn note_remove(&mut self, collection: &str, field: &str, key: &Bson, doc_id: &Bson) -> Result<()>;
    fn lookup(&self, collection: &str, field: &str, key: &Bson) -> Vec<Bson>;
}

#[derive(Default)]
pub struct BTreeIndexManager {
    descriptors: BTreeMap<(String, String), IndexDescriptor>,
    entries: BTreeMap<(String, String), BTreeMap<BsonKey, Vec<Bson>>>,
}

/// `Bson` has no total order by itself; this wraps the BSON-vs-BSON
/// comparison the way a document key field realistically behaves
/// (comparable scalars), falling back to stable string comparison for
/// anything else so the map never panics on an unorderable pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BsonKey(String);

pub(crate) fn bson_sort_key(b: &Bson) -> BsonKey {
    BsonKey(match b {
        Bson::String(s) => format!("s:{}", s),
        Bson::Int32(i) => format!("i:{:020}", i),
        Bson::Int64(i) => format!("i:{:020}", i),
        Bson::Double(d) => format!("d:{:020}", d),
        Bson::ObjectId(oid) => format!("o:{}", oid),
        Bson::Boolean(b) => format!("b:{}", b),
        other => format!("x:{:?}", other),
    })
}

impl BTreeIndexManager {
    pub fn new() -> BTreeIndexManager {
        BTreeIndexManager::default()
    }
}

impl IndexManager for BTreeIndexManager {
    fn create_index(&mut self, collection: &str, field: &str, unique: bool) -> Result<()> {
        let key = (collection.to_string(), field.to_string());
        if self.descriptors.contains_key(&key) {
            return Err(Error::InvalidArgument(format!(
                "index already exists on {}.{}",
                collection, field
            )));
        }
        self.descriptors.insert(
            key.clone(),
            IndexDescriptor {
                collection: collection.to_string(),
                field: field.to_string(),
                unique,
            },
        );
        self.entries.insert(key, BTreeMap::new());
        Ok(())
    }

    fn drop_index(&mut self, collection: &str, field: &str) -> Result<()> {
        let key = (collection.to_string(), field.to_string());
        if self.descriptors.remove(&key).is_none() {
            return Err(Error::InvalidArgument(format!("no index on {}.{}", collection, field)));
        }
        self.entries.remove(&key);
        Ok(())
    }

    fn index_exists(&self, collection: &str, field: &str) -> bool {
        self.descriptors.contains_key(&(collection.to_string(), field.to_string()))
    }

    fn get_index(&self, collection: &str, field: &str) -> Option<&IndexDescriptor> {
        self.descriptors.get(&(collection.to_string(), field.to_string()))
    }

    fn get_indexes(&self, collection: &str) -> Vec<&IndexDescriptor> {
        self.descriptors
            .values()
            .filter(|d| d.collection == collection)
            .collect()
    }

    fn note_insert(&mut self, collection: &str, field: &str, key: &Bson, doc_id: &Bson) -> Result<()> {
        let index_key = (collection.to_string(), field.to_string());
        let Some(descriptor) = self.descriptors.get(&index_key) else {
            return Ok(());
        };
        let entries = self.entries.entry(index_key).or_default();
        let bucket = entries.entry(bson_sort_key(key)).or_default();
        if descriptor.unique && !bucket.is_empty() {
            return Err(Error::DuplicateKey(key.clone()));
        }
        bucket.push(doc_id.clone());
        Ok(())
    }

    fn note_remove(&mut self, collection: &str, field: &str, key: &Bson, doc_id: &Bson) -> Result<()> {
        let index_key = (collection.to_string(), field.to_string());
        if let Some(entries) = self.entries.get_mut(&index_key) {
            if let Some(bucket) = entries.get_mut(&bson_sort_key(key)) {
                bucket.retain(|id| id != doc_id);
            }
        }
        Ok(())
    }

    fn lookup(&self, collection: &str, field: &str, key: &Bson) -> Vec<Bson> {
        let index_key = (collection.to_string(), field.to_string());
        self.entries
            .get(&index_key)
            .and_then(|entries| entries.get(&bson_sort_key(key)))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn create_then_lookup_round_trips() {
        let mut idx = BTreeIndexManager::new();
        idx.create_index("users", "email", true).unwrap();
        idx.note_insert("users", "email", &bson!("a@x.com"), &bson!(1)).unwrap();

        assert_eq!(idx.lookup("users", "email", &bson!("a@x.com")), vec![bson!(1)]);
    }

    #[test]
    fn unique_index_rejects_duplicate_key() {
        let mut idx = BTreeIndexManager::new();
        idx.create_index("users", "email", true).unwrap();
        idx.note_insert("users", "email", &bson!("a@x.com"), &bson!(1)).unwrap();

        let err = idx.note_insert("users", "email", &bson!("a@x.com"), &bson!(2)).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn drop_index_removes_descriptor_and_entries() {
        let mut idx = BTreeIndexManager::new();
        idx.create_index("users", "email", false).unwrap();
        idx.drop_index("users", "email").unwrap();
        assert!(!idx.index_exists("users", "email"));
    }
}
