#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-index** – Per-entity-type queryable collections and declared
//! attribute indices.
//!
//! Grounded on the teacher's `toka-store-semantic::DefaultPluginRegistry`:
//! an `RwLock<HashMap<_, _>>` registry keyed by a stable id, rejecting a
//! duplicate registration rather than silently overwriting it. Generalized
//! from semantic-analysis plugins to per-entity-type attribute extractors,
//! and from a single flat plugin space to one [`Collection`] per
//! [`LayoutFingerprint`].
//!
//! The consumer calls [`IndexEngine::add_to_collection`] inside the same
//! critical section as the journal commit (§4.7 step 6, "index updates
//! happen while locks are still held to preserve read-your-writes"); this
//! crate itself has no opinion about locking beyond its own internal
//! bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use aeon_layout::Value;
use aeon_types::{EntityId, HybridTimestamp, LayoutFingerprint};

/// An entity as handed to the index engine: its identity, stamp, and decoded
/// value tree (attribute extractors read fields out of this).
#[derive(Debug, Clone)]
pub struct IndexedEntity {
    /// Entity identifier.
    pub id: EntityId,
    /// HLC stamp at admission.
    pub timestamp: HybridTimestamp,
    /// Decoded value tree, as produced by the codec.
    pub value: Value,
}

/// A sortable, opaque index key extracted from an entity's value tree.
pub type IndexKey = Vec<u8>;

/// Declares how to derive an [`IndexKey`] for one attribute of entities of a
/// given type. `None` means this entity has no value for the attribute (it
/// is simply omitted from that index, not an error).
pub trait AttributeIndex: Send + Sync {
    /// Stable name of this index within its entity type's collection.
    fn name(&self) -> &str;

    /// Extract the indexed key from a decoded entity value.
    fn extract(&self, value: &Value) -> Option<IndexKey>;
}

/// Errors raised by index engine operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    /// An index of this name is already registered for this entity type.
    ///
    /// Resolves the spec's Open Question on `configureIndices`: rather than
    /// swallowing an "already added" condition by matching error text, the
    /// caller gets an explicit, typed signal and decides for itself whether
    /// that is fine (use [`IndexEngine::add_index`] for the idempotent
    /// convenience wrapper) or unexpected.
    #[error("index {0:?} is already registered for this entity type")]
    AlreadyPresent(String),
}

struct Collection {
    entities: Vec<IndexedEntity>,
    indices: HashMap<String, Box<dyn AttributeIndex>>,
    by_key: HashMap<String, BTreeMap<IndexKey, Vec<EntityId>>>,
}

impl Collection {
    fn new() -> Self {
        Self { entities: Vec::new(), indices: HashMap::new(), by_key: HashMap::new() }
    }
}

/// Maintains one queryable [`Collection`] per entity type (keyed by its
/// layout fingerprint), each with its own declared attribute indices.
#[derive(Default)]
pub struct IndexEngine {
    collections: RwLock<HashMap<LayoutFingerprint, Collection>>,
}

impl IndexEngine {
    /// Construct an empty index engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute index for `fingerprint`'s collection, erroring
    /// with [`IndexError::AlreadyPresent`] if an index of the same name is
    /// already registered.
    pub async fn try_add_index(
        &self,
        fingerprint: LayoutFingerprint,
        index: Box<dyn AttributeIndex>,
    ) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(fingerprint).or_insert_with(Collection::new);
        if collection.indices.contains_key(index.name()) {
            return Err(IndexError::AlreadyPresent(index.name().to_string()));
        }
        collection.by_key.insert(index.name().to_string(), BTreeMap::new());
        collection.indices.insert(index.name().to_string(), index);
        Ok(())
    }

    /// Idempotent convenience wrapper over [`Self::try_add_index`]: a
    /// duplicate registration is a no-op rather than an error, matching
    /// §4.6's "re-adding an already-registered index is a no-op."
    pub async fn add_index(&self, fingerprint: LayoutFingerprint, index: Box<dyn AttributeIndex>) {
        match self.try_add_index(fingerprint, index).await {
            Ok(()) | Err(IndexError::AlreadyPresent(_)) => {}
        }
    }

    /// Add an entity to its type's collection, updating every declared
    /// index for that type. Must be called inside the same critical section
    /// as the journal commit that made the entity durable (§4.7 step 6).
    pub async fn add_to_collection(&self, fingerprint: LayoutFingerprint, entity: IndexedEntity) {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(fingerprint).or_insert_with(Collection::new);
        for (name, index) in &collection.indices {
            if let Some(key) = index.extract(&entity.value) {
                collection.by_key.get_mut(name).expect("index bookkeeping in sync").entry(key).or_default().push(entity.id);
            }
        }
        collection.entities.push(entity);
    }

    /// Number of entities held for `fingerprint`'s collection.
    pub async fn entity_count(&self, fingerprint: LayoutFingerprint) -> usize {
        self.collections.read().await.get(&fingerprint).map_or(0, |c| c.entities.len())
    }

    /// Every entity id whose extracted key for `index_name` equals `key`.
    /// A query primitive offered for convenience; per §4.6 the richer query
    /// language built on top of this is out of scope for the core.
    pub async fn lookup(
        &self,
        fingerprint: LayoutFingerprint,
        index_name: &str,
        key: &IndexKey,
    ) -> Vec<EntityId> {
        self.collections
            .read()
            .await
            .get(&fingerprint)
            .and_then(|c| c.by_key.get(index_name))
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// All entity ids currently held for `fingerprint`, in insertion order.
    pub async fn all_ids(&self, fingerprint: LayoutFingerprint) -> Vec<EntityId> {
        self.collections
            .read()
            .await
            .get(&fingerprint)
            .map(|c| c.entities.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }
}

/// Shared handle to an [`IndexEngine`], the shape the consumer and facade
/// hold it by.
pub type SharedIndexEngine = Arc<IndexEngine>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct AmountIndex;
    impl AttributeIndex for AmountIndex {
        fn name(&self) -> &str {
            "amount"
        }
        fn extract(&self, value: &Value) -> Option<IndexKey> {
            let fields = value.as_fields()?;
            fields.iter().find(|(n, _)| n == "amount").and_then(|(_, v)| match v {
                Value::I64(n) => Some(n.to_be_bytes().to_vec()),
                _ => None,
            })
        }
    }

    fn entity(id: EntityId, amount: i64) -> IndexedEntity {
        IndexedEntity {
            id,
            timestamp: HybridTimestamp::new(1, 0),
            value: Value::Layout(vec![("amount".to_string(), Value::I64(amount))]),
        }
    }

    const FP: LayoutFingerprint = LayoutFingerprint([1u8; 20]);

    #[tokio::test]
    async fn duplicate_index_registration_is_reported() {
        let engine = IndexEngine::new();
        engine.try_add_index(FP, Box::new(AmountIndex)).await.unwrap();
        let err = engine.try_add_index(FP, Box::new(AmountIndex)).await.unwrap_err();
        assert_eq!(err, IndexError::AlreadyPresent("amount".to_string()));
    }

    #[tokio::test]
    async fn add_index_is_idempotent() {
        let engine = IndexEngine::new();
        engine.add_index(FP, Box::new(AmountIndex)).await;
        engine.add_index(FP, Box::new(AmountIndex)).await;
        // No panic, no error surfaced; still usable.
        let id = EntityId(Uuid::new_v4());
        engine.add_to_collection(FP, entity(id, 42)).await;
        assert_eq!(engine.entity_count(FP).await, 1);
    }

    #[tokio::test]
    async fn lookup_finds_entities_by_extracted_key() {
        let engine = IndexEngine::new();
        engine.try_add_index(FP, Box::new(AmountIndex)).await.unwrap();
        let a = EntityId(Uuid::new_v4());
        let b = EntityId(Uuid::new_v4());
        engine.add_to_collection(FP, entity(a, 42)).await;
        engine.add_to_collection(FP, entity(b, 7)).await;

        let found = engine.lookup(FP, "amount", &42i64.to_be_bytes().to_vec()).await;
        assert_eq!(found, vec![a]);
    }

    #[tokio::test]
    async fn collections_are_independent_per_fingerprint() {
        let engine = IndexEngine::new();
        let other_fp = LayoutFingerprint([2u8; 20]);
        engine.add_to_collection(FP, entity(EntityId(Uuid::new_v4()), 1)).await;
        assert_eq!(engine.entity_count(FP).await, 1);
        assert_eq!(engine.entity_count(other_fp).await, 0);
    }
}
