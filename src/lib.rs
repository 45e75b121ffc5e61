#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon** – Event-sourcing command repository: the root facade (C8) tying
//! together the hybrid logical clock, layout/codec engine, command
//! consumer, journal, lock provider, and index engine exposed by the
//! `aeon-*` crates.
//!
//! Grounded on the teacher's `toka-kernel::Kernel`: a struct holding `Arc`s
//! to its collaborators behind trait objects, a `submit`-style entry point,
//! and a folded error enum — generalized here from a fixed
//! validate/dispatch/emit pipeline to the one-way `New → Starting → Running
//! → Stopping → Terminated` lifecycle state machine of §4.8.

mod config;
mod error;
mod introduce;
mod registry;

pub use aeon_bus::{EntitySubscriber, NotifiedEntity, SubscriberId};
pub use aeon_clock::{HybridClock, PhysicalClock};
pub use aeon_codec::CodecError;
pub use aeon_consumer::ConsumerError;
pub use aeon_index::{AttributeIndex, IndexEngine, IndexError, IndexKey, IndexedEntity};
pub use aeon_layout::{
    canonicalize, take_field, EntityDescriptor, FieldType, Layout, LayoutCache, LayoutError, LayoutValue, Value,
};
pub use aeon_locks::{LocalLockProvider, LockError, LockGuard, LockProvider};
pub use aeon_store_core::{EntityMeta, EventFilter, Journal, JournalEntry, StorageError, Transaction};
pub use aeon_types::{
    Command, CommandExecution, CommandTerminatedExceptionally, Committed, EntityHeader, EntityId,
    EntityLayoutIntroduced, EventCausalityEstablished, HostErrorOccurred, HybridTimestamp, LayoutFingerprint,
};

pub use config::RepositoryConfig;
pub use error::RepositoryError;
pub use introduce::IntroduceEntityLayouts;
pub use registry::TypeSetProvider;

use std::sync::Arc;

use aeon_bus::SubscriberRegistry;
use aeon_consumer::CommandConsumer;
use tokio::sync::{Mutex, RwLock};

use introduce::{publish_introduce_entity_layouts, IntroductionContext};
use registry::{PendingIndexRegistration, TypeRegistry};

/// The repository's one-way lifecycle (§4.8). Transitions only ever move
/// forward; there is no path back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but never started.
    New,
    /// `start()` is in progress.
    Starting,
    /// Accepting `publish` calls.
    Running,
    /// `stop()` is in progress; in-flight and queued commands are draining.
    Stopping,
    /// Fully stopped. A terminated repository cannot be restarted; build a
    /// new one.
    Terminated,
}

/// Builds a [`Repository`] from its required collaborators.
///
/// `journal` and `locks` have no safe default and must be supplied;
/// `clock` and `index` default to the in-process implementations
/// (`HybridClock::new()`, `IndexEngine::new()`) the corresponding crates
/// already ship, since those are reasonable for a single-process
/// deployment and a caller only needs to override them (a seeded clock, a
/// pre-populated index engine) in less common cases.
pub struct RepositoryBuilder {
    clock: Option<Arc<HybridClock>>,
    journal: Option<Arc<dyn Journal>>,
    locks: Option<Arc<dyn LockProvider>>,
    index: Option<Arc<IndexEngine>>,
    config: RepositoryConfig,
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self { clock: None, journal: None, locks: None, index: None, config: RepositoryConfig::default() }
    }
}

impl RepositoryBuilder {
    /// Start building with default configuration and no collaborators set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply the hybrid logical clock. Defaults to a fresh
    /// `HybridClock::new()` if never called.
    pub fn clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Supply the durable journal. Required.
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Supply the named lock provider. Required.
    pub fn locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Supply the index engine. Defaults to a fresh `IndexEngine::new()` if
    /// never called.
    pub fn index(mut self, index: Arc<IndexEngine>) -> Self {
        self.index = Some(index);
        self
    }

    /// Supply the repository configuration. Defaults to
    /// [`RepositoryConfig::default`] if never called.
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Construct the repository in the `New` state. Fails if `journal` or
    /// `locks` was never supplied.
    pub fn build(self) -> Result<Repository, RepositoryError> {
        let journal = self.journal.ok_or_else(|| RepositoryError::NotConfigured("journal".to_string()))?;
        let locks = self.locks.ok_or_else(|| RepositoryError::NotConfigured("lock provider".to_string()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(HybridClock::new()));
        let index = self.index.unwrap_or_else(|| Arc::new(IndexEngine::new()));
        Ok(Repository::new(clock, journal, locks, index, self.config))
    }
}

/// The repository facade: owns the lifecycle state machine and delegates
/// every operation to its collaborators.
pub struct Repository {
    state: RwLock<LifecycleState>,
    config: RwLock<RepositoryConfig>,
    clock: Arc<HybridClock>,
    journal: Arc<dyn Journal>,
    locks: Arc<dyn LockProvider>,
    index: Arc<IndexEngine>,
    subscribers: Arc<SubscriberRegistry>,
    layouts: LayoutCache,
    commands: TypeRegistry,
    events: TypeRegistry,
    pending_index: Mutex<Vec<PendingIndexRegistration>>,
    consumer: RwLock<Option<CommandConsumer>>,
}

impl Repository {
    fn new(
        clock: Arc<HybridClock>,
        journal: Arc<dyn Journal>,
        locks: Arc<dyn LockProvider>,
        index: Arc<IndexEngine>,
        config: RepositoryConfig,
    ) -> Self {
        let subscribers = Arc::new(SubscriberRegistry::new(config.subscriber_timeout()));
        Self {
            state: RwLock::new(LifecycleState::New),
            config: RwLock::new(config),
            clock,
            journal,
            locks,
            index,
            subscribers,
            layouts: LayoutCache::new(),
            commands: TypeRegistry::new(),
            events: TypeRegistry::new(),
            pending_index: Mutex::new(Vec::new()),
            consumer: RwLock::new(None),
        }
    }

    /// Start building a repository.
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    /// The repository's current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Read the most recently issued HLC timestamp without advancing the
    /// clock.
    pub async fn get_timestamp(&self) -> HybridTimestamp {
        self.clock.peek()
    }

    /// Replace the repository's configuration. Fails with
    /// [`RepositoryError::IllegalState`] while `Running` — the consumer's
    /// worker pool and lock timeout are fixed for the life of a `start()`
    /// call.
    pub async fn update_config(&self, new_config: RepositoryConfig) -> Result<(), RepositoryError> {
        if *self.state.read().await == LifecycleState::Running {
            return Err(RepositoryError::IllegalState("cannot mutate configuration while running".to_string()));
        }
        *self.config.write().await = new_config;
        Ok(())
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> RepositoryConfig {
        self.config.read().await.clone()
    }

    /// Validate collaborators (already guaranteed by the builder), bring
    /// the clock up to date with the journal's last committed timestamp,
    /// apply any index registrations deferred while not running, start the
    /// command consumer, then publish and join on the bootstrap
    /// `IntroduceEntityLayouts` command before reporting `Running`.
    pub async fn start(&self) -> Result<(), RepositoryError> {
        {
            let mut state = self.state.write().await;
            if *state != LifecycleState::New {
                return Err(RepositoryError::IllegalState(format!("cannot start from {:?}", *state)));
            }
            *state = LifecycleState::Starting;
        }

        if let Some(observed) = self.journal.max_committed_timestamp().await? {
            self.clock.update(observed);
        }

        {
            let mut pending = self.pending_index.lock().await;
            for registration in pending.drain(..) {
                self.index.add_index(registration.fingerprint, registration.index).await;
            }
        }

        let config = self.config.read().await.clone();
        let consumer = CommandConsumer::start(
            self.clock.clone(),
            self.journal.clone(),
            self.locks.clone(),
            self.layouts.clone(),
            self.index.clone(),
            self.subscribers.clone(),
            aeon_consumer::ConsumerConfig {
                worker_count: config.worker_count,
                queue_depth: config.queue_depth,
                lock_timeout: config.lock_timeout(),
            },
        );
        *self.consumer.write().await = Some(consumer);

        self.announce_known_types().await?;

        *self.state.write().await = LifecycleState::Running;
        Ok(())
    }

    /// Stop accepting new work, drain in-flight and queued commands, and
    /// transition to `Terminated`. A stopped repository cannot be
    /// restarted.
    pub async fn stop(&self) -> Result<(), RepositoryError> {
        {
            let mut state = self.state.write().await;
            if *state != LifecycleState::Running {
                return Err(RepositoryError::IllegalState(format!("cannot stop from {:?}", *state)));
            }
            *state = LifecycleState::Stopping;
        }

        if let Some(consumer) = self.consumer.write().await.take() {
            consumer.stop().await;
        }

        *self.state.write().await = LifecycleState::Terminated;
        Ok(())
    }

    /// Publish a command through the full pipeline (§4.7), resolving to its
    /// output or the error kind that terminated it. Fails immediately with
    /// [`RepositoryError::IllegalState`] unless the repository is
    /// `Running`.
    pub async fn publish<C>(&self, command: C) -> Result<C::Output, RepositoryError>
    where
        C: Command + LayoutValue,
        C::Event: LayoutValue,
    {
        if *self.state.read().await != LifecycleState::Running {
            return Err(RepositoryError::IllegalState("repository is not running".to_string()));
        }
        let guard = self.consumer.read().await;
        let consumer =
            guard.as_ref().ok_or_else(|| RepositoryError::IllegalState("command consumer not started".to_string()))?;
        Ok(consumer.publish(command).await?)
    }

    /// Register an attribute index for `fingerprint`'s collection. Applied
    /// immediately while `Running`; queued to apply during the next
    /// `start()` otherwise.
    pub async fn add_index(&self, fingerprint: LayoutFingerprint, index: Box<dyn AttributeIndex>) {
        if *self.state.read().await == LifecycleState::Running {
            self.index.add_index(fingerprint, index).await;
        } else {
            self.pending_index.lock().await.push(PendingIndexRegistration { fingerprint, index });
        }
    }

    /// Names of every registered command type.
    pub async fn installed_commands(&self) -> Vec<String> {
        self.commands.names().await
    }

    /// Names of every registered event type.
    pub async fn installed_events(&self) -> Vec<String> {
        self.events.names().await
    }

    /// Register a command type provider. If this name is new, queues (or,
    /// while `Running`, immediately publishes) an `IntroduceEntityLayouts`
    /// announcement.
    pub async fn add_command_set_provider(&self, provider: Arc<dyn TypeSetProvider>) -> Result<(), RepositoryError> {
        if self.commands.add(provider).await.is_some() {
            self.announce_if_running().await?;
        }
        Ok(())
    }

    /// Deregister a command type provider by name. Already-journaled
    /// `EntityLayoutIntroduced` entries for its layout are unaffected —
    /// this only stops it being reported by `installed_commands()` and
    /// re-announced.
    pub async fn remove_command_set_provider(&self, type_name: &str) {
        self.commands.remove(type_name).await;
    }

    /// Register an event type provider. Same announcement semantics as
    /// [`Self::add_command_set_provider`].
    pub async fn add_event_set_provider(&self, provider: Arc<dyn TypeSetProvider>) -> Result<(), RepositoryError> {
        if self.events.add(provider).await.is_some() {
            self.announce_if_running().await?;
        }
        Ok(())
    }

    /// Deregister an event type provider by name.
    pub async fn remove_event_set_provider(&self, type_name: &str) {
        self.events.remove(type_name).await;
    }

    /// Register an entity subscriber, notified with every entity appended
    /// by a committed command (§4.7 step 7).
    pub async fn add_entity_subscriber(&self, subscriber: Arc<dyn EntitySubscriber>) -> SubscriberId {
        self.subscribers.add(subscriber).await
    }

    /// Deregister an entity subscriber.
    pub async fn remove_entity_subscriber(&self, id: SubscriberId) {
        self.subscribers.remove(id).await
    }

    async fn known_type_names(&self) -> Vec<String> {
        let mut names = self.commands.names().await;
        names.extend(self.events.names().await);
        names.sort();
        names
    }

    async fn all_descriptors(&self) -> Vec<EntityDescriptor> {
        let mut descriptors = self.commands.descriptors().await;
        descriptors.extend(self.events.descriptors().await);
        descriptors
    }

    async fn announce_known_types(&self) -> Result<(), RepositoryError> {
        let type_names = self.known_type_names().await;
        let descriptors = self.all_descriptors().await;
        let ctx = IntroductionContext {
            clock: &self.clock,
            journal: &self.journal,
            layouts: &self.layouts,
            index: &self.index,
            subscribers: &self.subscribers,
        };
        publish_introduce_entity_layouts(&ctx, type_names, &descriptors).await
    }

    async fn announce_if_running(&self) -> Result<(), RepositoryError> {
        if *self.state.read().await == LifecycleState::Running {
            self.announce_known_types().await
        } else {
            Ok(())
        }
    }
}
