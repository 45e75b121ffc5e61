#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-store-memory** – In-memory, non-durable [`Journal`] backend.
//!
//! Grounded on the teacher's `toka-store-memory::MemoryBackend`: a pair of
//! `HashMap`s guarded by a lock plus a broadcast channel for live updates,
//! generalized from "one header/payload table" to the aeon wire model
//! (ordered committed entries, a fingerprint-gating transaction, and two
//! independent broadcast feeds for newly observed command/event
//! fingerprints). Suitable for tests and development; nothing here survives
//! process restart.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use aeon_store_core::{
    causal_hash, decode_event_payload, encode_event_payload, CausalDigest, EntityMeta, EventFilter,
    Journal, JournalEntry, StorageError, Transaction,
};
use aeon_types::{EntityId, HybridTimestamp, LayoutFingerprint};

const DEFAULT_BUFFER: usize = 1024;

enum PendingAppend {
    Command { payload: Vec<u8>, meta: EntityMeta },
    Event { payload: Vec<u8>, meta: EntityMeta, cause_id: EntityId },
    LayoutIntroduction { payload: Vec<u8>, meta: EntityMeta, cause_id: EntityId, introduced: LayoutFingerprint },
}

impl PendingAppend {
    fn fingerprint(&self) -> LayoutFingerprint {
        match self {
            PendingAppend::Command { meta, .. } => meta.fingerprint,
            PendingAppend::Event { meta, .. } => meta.fingerprint,
            PendingAppend::LayoutIntroduction { meta, .. } => meta.fingerprint,
        }
    }

    fn cause_id(&self) -> Option<EntityId> {
        match self {
            PendingAppend::Command { .. } => None,
            PendingAppend::Event { cause_id, .. } | PendingAppend::LayoutIntroduction { cause_id, .. } => {
                Some(*cause_id)
            }
        }
    }

    fn into_entry(self, causal_digest: CausalDigest) -> (JournalEntry, bool) {
        match self {
            PendingAppend::Command { payload, meta } => {
                (JournalEntry { meta, payload, causal_digest }, false)
            }
            PendingAppend::Event { payload, meta, cause_id } => {
                let wire = encode_event_payload(cause_id, &payload);
                (JournalEntry { meta, payload: wire, causal_digest }, true)
            }
            PendingAppend::LayoutIntroduction { payload, meta, cause_id, .. } => {
                let wire = encode_event_payload(cause_id, &payload);
                (JournalEntry { meta, payload: wire, causal_digest }, true)
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<JournalEntry>,
    known_fingerprints: HashSet<LayoutFingerprint>,
    max_timestamp: Option<HybridTimestamp>,
}

/// An in-memory, non-persistent journal.
///
/// Mirrors `MemoryBackend`'s shape but speaks the aeon `Journal`/`Transaction`
/// contract: fingerprint-gated appends, atomic multi-entry commits, and two
/// broadcast feeds (`on_commands_added`/`on_events_added` in spec terms).
#[derive(Clone)]
pub struct MemoryJournal {
    inner: Arc<RwLock<Inner>>,
    commands_tx: Arc<broadcast::Sender<LayoutFingerprint>>,
    events_tx: Arc<broadcast::Sender<LayoutFingerprint>>,
}

impl std::fmt::Debug for MemoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJournal").finish_non_exhaustive()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJournal {
    /// Create a new, empty in-memory journal.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Create a new in-memory journal with a custom broadcast buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (commands_tx, _) = broadcast::channel(buffer_size);
        let (events_tx, _) = broadcast::channel(buffer_size);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            commands_tx: Arc::new(commands_tx),
            events_tx: Arc::new(events_tx),
        }
    }

    /// Current number of committed entries (commands, events, and layout
    /// introductions combined).
    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

/// An open append transaction against a [`MemoryJournal`].
///
/// Buffers appends in memory and validates/applies them all at once on
/// [`Transaction::commit`] — nothing is visible via `iter_events` until then.
pub struct MemoryTransaction {
    journal: MemoryJournal,
    buffer: Vec<PendingAppend>,
    finished: bool,
}

impl MemoryTransaction {
    fn new(journal: MemoryJournal) -> Self {
        Self { journal, buffer: Vec::new(), finished: false }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn append_command(&mut self, payload: &[u8], meta: EntityMeta) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::TransactionFinished);
        }
        self.buffer.push(PendingAppend::Command { payload: payload.to_vec(), meta });
        Ok(())
    }

    async fn append_event(
        &mut self,
        payload: &[u8],
        meta: EntityMeta,
        cause_id: EntityId,
    ) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::TransactionFinished);
        }
        self.buffer.push(PendingAppend::Event { payload: payload.to_vec(), meta, cause_id });
        Ok(())
    }

    async fn introduce_layout(
        &mut self,
        payload: &[u8],
        meta: EntityMeta,
        cause_id: EntityId,
        introduced: LayoutFingerprint,
    ) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::TransactionFinished);
        }
        self.buffer.push(PendingAppend::LayoutIntroduction {
            payload: payload.to_vec(),
            meta,
            cause_id,
            introduced,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        let mut guard = self.journal.inner.write().await;

        // Validate the whole buffer against a local view of known
        // fingerprints before mutating shared state — all-or-nothing (§4.4).
        let mut known = guard.known_fingerprints.clone();
        for pending in &self.buffer {
            match pending {
                PendingAppend::LayoutIntroduction { introduced, .. } => {
                    known.insert(*introduced);
                }
                other => {
                    if !known.contains(&other.fingerprint()) {
                        return Err(StorageError::UnknownFingerprint(other.fingerprint()));
                    }
                }
            }
        }

        // Every command's own digest, indexed by its entity id, so events
        // (and layout introductions, which may precede their causing command
        // in buffer order) can chain to the command that caused them even
        // though neither has been committed yet.
        let mut command_digests: std::collections::HashMap<EntityId, CausalDigest> = std::collections::HashMap::new();
        for pending in &self.buffer {
            if let PendingAppend::Command { payload, meta } = pending {
                command_digests.insert(meta.id, causal_hash(payload, &[]));
            }
        }

        let mut newly_introduced = Vec::new();
        for pending in std::mem::take(&mut self.buffer) {
            if let PendingAppend::LayoutIntroduction { introduced, .. } = &pending {
                newly_introduced.push(*introduced);
            }
            let is_command = matches!(pending, PendingAppend::Command { .. });
            let timestamp = match &pending {
                PendingAppend::Command { meta, .. }
                | PendingAppend::Event { meta, .. }
                | PendingAppend::LayoutIntroduction { meta, .. } => meta.timestamp,
            };
            let fingerprint = pending.fingerprint();
            let payload_bytes: &[u8] = match &pending {
                PendingAppend::Command { payload, .. }
                | PendingAppend::Event { payload, .. }
                | PendingAppend::LayoutIntroduction { payload, .. } => payload,
            };
            let causal_digest = match pending.cause_id().and_then(|id| command_digests.get(&id)) {
                Some(parent) => causal_hash(payload_bytes, &[*parent]),
                None => causal_hash(payload_bytes, &[]),
            };
            let (entry, is_event) = pending.into_entry(causal_digest);
            guard.entries.push(entry);
            guard.max_timestamp = Some(match guard.max_timestamp {
                Some(existing) if existing >= timestamp => existing,
                _ => timestamp,
            });
            if is_command {
                let _ = self.journal.commands_tx.send(fingerprint);
            } else if is_event {
                let _ = self.journal.events_tx.send(fingerprint);
            }
        }
        guard.known_fingerprints.extend(newly_introduced);
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }

    async fn iter_events(
        &self,
        filter: EventFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, StorageError> {
        let guard = self.inner.read().await;
        let filtered: Vec<JournalEntry> = guard
            .entries
            .iter()
            .filter(|entry| {
                filter.after.map_or(true, |after| entry.meta.timestamp > after)
                    && filter.fingerprint.map_or(true, |fp| entry.meta.fingerprint == fp)
            })
            .cloned()
            .collect();
        Ok(Box::new(filtered.into_iter()))
    }

    fn subscribe_commands_added(&self) -> broadcast::Receiver<LayoutFingerprint> {
        self.commands_tx.subscribe()
    }

    fn subscribe_events_added(&self) -> broadcast::Receiver<LayoutFingerprint> {
        self.events_tx.subscribe()
    }

    async fn max_committed_timestamp(&self) -> Result<Option<HybridTimestamp>, StorageError> {
        Ok(self.inner.read().await.max_timestamp)
    }

    async fn known_fingerprints(&self) -> Result<Vec<LayoutFingerprint>, StorageError> {
        Ok(self.inner.read().await.known_fingerprints.iter().copied().collect())
    }
}

/// Split a decoded event payload back into cause id and codec payload; a
/// thin re-export so callers iterating `JournalEntry`s from this backend
/// don't need to depend on `aeon-store-core` directly just for this.
pub fn split_event_payload(bytes: &[u8]) -> Result<(EntityId, &[u8]), StorageError> {
    decode_event_payload(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn meta(fingerprint: LayoutFingerprint, ts: HybridTimestamp) -> EntityMeta {
        EntityMeta { id: EntityId(Uuid::new_v4()), timestamp: ts, fingerprint }
    }

    const BOOTSTRAP_FP: LayoutFingerprint = LayoutFingerprint([0xEE; 20]);
    const COMMAND_FP: LayoutFingerprint = LayoutFingerprint([1u8; 20]);
    const EVENT_FP: LayoutFingerprint = LayoutFingerprint([2u8; 20]);

    #[tokio::test]
    async fn rejects_unknown_fingerprint() {
        let journal = MemoryJournal::new();
        let mut tx = journal.begin().await.unwrap();
        let err = tx
            .append_command(b"payload", meta(COMMAND_FP, HybridTimestamp::new(1, 0)))
            .await;
        assert!(err.is_ok(), "buffering never validates eagerly");
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownFingerprint(fp) if fp == COMMAND_FP));
    }

    #[tokio::test]
    async fn introduced_fingerprint_unlocks_subsequent_appends_in_same_tx() {
        let journal = MemoryJournal::new();
        let mut tx = journal.begin().await.unwrap();
        let cmd_id = EntityId(Uuid::new_v4());
        tx.introduce_layout(
            b"schema",
            meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)),
            cmd_id,
            COMMAND_FP,
        )
        .await
        .unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(1, 1))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(journal.entry_count().await, 2);
        let known = journal.known_fingerprints().await.unwrap();
        assert!(known.contains(&COMMAND_FP));
    }

    #[tokio::test]
    async fn abort_leaves_no_trace() {
        let journal = MemoryJournal::new();
        let mut tx = journal.begin().await.unwrap();
        let cmd_id = EntityId(Uuid::new_v4());
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)), cmd_id, COMMAND_FP)
            .await
            .unwrap();
        tx.abort().await.unwrap();
        assert_eq!(journal.entry_count().await, 0);
        assert!(journal.known_fingerprints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn iter_events_filters_by_timestamp_and_fingerprint() {
        let journal = MemoryJournal::new();
        let cmd_id = EntityId(Uuid::new_v4());
        let mut tx = journal.begin().await.unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)), cmd_id, COMMAND_FP)
            .await
            .unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 1)), cmd_id, EVENT_FP)
            .await
            .unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(2, 0))).await.unwrap();
        tx.append_event(b"evt", meta(EVENT_FP, HybridTimestamp::new(3, 0)), cmd_id).await.unwrap();
        tx.commit().await.unwrap();

        let entries: Vec<_> = journal
            .iter_events(EventFilter { after: Some(HybridTimestamp::new(2, 0)), fingerprint: None })
            .await
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].meta.fingerprint, EVENT_FP);
    }

    #[tokio::test]
    async fn max_committed_timestamp_tracks_highest_stamp() {
        let journal = MemoryJournal::new();
        let cmd_id = EntityId(Uuid::new_v4());
        let mut tx = journal.begin().await.unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(5, 0)), cmd_id, COMMAND_FP)
            .await
            .unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(10, 3))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(journal.max_committed_timestamp().await.unwrap(), Some(HybridTimestamp::new(10, 3)));
    }

    #[tokio::test]
    async fn commands_and_events_broadcast_on_distinct_channels() {
        let journal = MemoryJournal::new();
        let mut commands_rx = journal.subscribe_commands_added();
        let mut events_rx = journal.subscribe_events_added();
        let cmd_id = EntityId(Uuid::new_v4());

        let mut tx = journal.begin().await.unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)), cmd_id, COMMAND_FP)
            .await
            .unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 1)), cmd_id, EVENT_FP)
            .await
            .unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(2, 0))).await.unwrap();
        tx.append_event(b"evt", meta(EVENT_FP, HybridTimestamp::new(3, 0)), cmd_id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(commands_rx.recv().await.unwrap(), COMMAND_FP);
        // The two bootstrap introductions and the user event all land on the
        // events channel (layout introductions are events too).
        assert_eq!(events_rx.recv().await.unwrap(), BOOTSTRAP_FP);
        assert_eq!(events_rx.recv().await.unwrap(), BOOTSTRAP_FP);
        assert_eq!(events_rx.recv().await.unwrap(), EVENT_FP);
    }

    #[tokio::test]
    async fn causal_digest_chains_event_to_its_command() {
        let journal = MemoryJournal::new();
        let cmd_id = EntityId(Uuid::new_v4());
        let mut tx = journal.begin().await.unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)), cmd_id, COMMAND_FP)
            .await
            .unwrap();
        tx.append_command(b"cmd", EntityMeta { id: cmd_id, ..meta(COMMAND_FP, HybridTimestamp::new(1, 1)) })
            .await
            .unwrap();
        tx.append_event(b"evt", meta(EVENT_FP, HybridTimestamp::new(1, 2)), cmd_id).await.unwrap();
        tx.commit().await.unwrap();

        let entries: Vec<_> =
            journal.iter_events(EventFilter::default()).await.unwrap().collect();
        let command_entry = entries.iter().find(|e| e.meta.fingerprint == COMMAND_FP).unwrap();
        let event_entry = entries.iter().find(|e| e.meta.fingerprint == EVENT_FP).unwrap();
        assert_eq!(
            event_entry.causal_digest,
            causal_hash(b"evt", &[causal_hash(b"cmd", &[])]),
            "the event's digest must chain from its causing command's digest"
        );
        assert_ne!(command_entry.causal_digest, event_entry.causal_digest);
    }
}
