//! Command/event type registration (§4.8): the set of entity types the
//! repository knows about, and the bookkeeping that turns registering a new
//! one into an `IntroduceEntityLayouts` publish.
//!
//! Grounded on the teacher's `toka-kernel::registry` opcode-handler table —
//! an `RwLock<HashMap<name, _>>` of pluggable providers, generalized here
//! from "opcode handler" to "entity type this repository will accept".

use std::collections::BTreeMap;
use std::sync::Arc;

use aeon_index::AttributeIndex;
use aeon_layout::EntityDescriptor;
use aeon_types::LayoutFingerprint;
use tokio::sync::RwLock;

/// Declares one entity type (a command or an event) the repository should
/// know about: its stable name and the shape the layout engine derives a
/// fingerprint from.
///
/// A real deployment implements this once per command/event type it wants
/// to register proactively (most types are instead discovered lazily the
/// first time they are published, via `LayoutCache::get_or_derive`); this
/// trait exists for the ones an operator wants introduced up front, e.g. so
/// `installed_commands()` reports them before the first publish.
pub trait TypeSetProvider: Send + Sync {
    /// Stable name this type is registered and reported under.
    fn type_name(&self) -> &str;

    /// The type's declared shape.
    fn descriptor(&self) -> EntityDescriptor;
}

/// A `BTreeMap` keyed by type name so `installed_commands()`/
/// `installed_events()` report in a stable, deterministic order.
#[derive(Default)]
pub(crate) struct TypeRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn TypeSetProvider>>>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a provider, returning its descriptor if this name was not
    /// already registered (re-registering the same name is a no-op that
    /// reports `None`, since there is nothing new to introduce).
    pub(crate) async fn add(&self, provider: Arc<dyn TypeSetProvider>) -> Option<EntityDescriptor> {
        let mut guard = self.providers.write().await;
        if guard.contains_key(provider.type_name()) {
            return None;
        }
        let descriptor = provider.descriptor();
        guard.insert(provider.type_name().to_string(), provider);
        Some(descriptor)
    }

    pub(crate) async fn remove(&self, type_name: &str) {
        self.providers.write().await.remove(type_name);
    }

    pub(crate) async fn names(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    pub(crate) async fn descriptors(&self) -> Vec<EntityDescriptor> {
        self.providers.read().await.values().map(|p| p.descriptor()).collect()
    }
}

/// An `IndexEngine::add_index` call deferred because it arrived while the
/// repository was not `Running` — applied during `start()`'s "runs queued
/// initialization callbacks" step (§4.8).
pub(crate) struct PendingIndexRegistration {
    pub(crate) fingerprint: LayoutFingerprint,
    pub(crate) index: Box<dyn AttributeIndex>,
}
