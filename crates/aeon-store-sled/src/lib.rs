#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-store-sled** – Durable, embedded [`Journal`] backend backed by
//! `sled`.
//!
//! Grounded on the teacher's `toka-store-sled::SledBackend`: open/create a
//! database with one tree per concern, keep a live broadcast feed alongside
//! the durable writes. Generalized from "headers + payloads, deduplicated by
//! digest" to the aeon wire model: an append-only, sequence-keyed entries
//! tree (sled's native id generator supplies monotonically increasing,
//! restart-stable sequence numbers) plus a fingerprints tree standing in for
//! the journal's "known fingerprints" gate. Unlike the teacher's per-call
//! `commit`, a whole `Transaction`'s buffered appends apply as one atomic
//! `sled` transaction spanning both trees — the all-or-nothing contract of
//! spec §4.4.

use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{abort, TransactionError, Transactional};
use sled::{Db, Tree};
use tokio::sync::broadcast;

use aeon_store_core::{
    causal_hash, decode_header, encode_event_payload, encode_header, CausalDigest, EntityMeta,
    EventFilter, Journal, JournalEntry, StorageError, Transaction as JournalTransaction,
};
use aeon_types::{EntityId, HybridTimestamp, LayoutFingerprint};

const DEFAULT_BROADCAST_SIZE: usize = 256;
const MAX_TS_KEY: &[u8] = b"max_ts";

fn encode_max_ts(ts: HybridTimestamp) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..8].copy_from_slice(&ts.wall_ms.to_be_bytes());
    out[8..12].copy_from_slice(&ts.logical.to_be_bytes());
    out
}

fn decode_max_ts(bytes: &[u8]) -> HybridTimestamp {
    let wall_ms = u64::from_be_bytes(bytes[0..8].try_into().expect("fixed-width max_ts"));
    let logical = u32::from_be_bytes(bytes[8..12].try_into().expect("fixed-width max_ts"));
    HybridTimestamp::new(wall_ms, logical)
}

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

    fn timestamp(&self) -> HybridTimestamp {
        match self {
            PendingAppend::Command { meta, .. } => meta.timestamp,
            PendingAppend::Event { meta, .. } => meta.timestamp,
            PendingAppend::LayoutIntroduction { meta, .. } => meta.timestamp,
        }
    }

    /// `[48 B header][payload][32 B causal digest]`. The trailing digest is
    /// an internal integrity aid, stripped back off in [`SledJournal::iter_events`]
    /// before the payload is handed to a caller — it plays no part in the
    /// codec's wire format.
    fn wire_bytes(&self, causal_digest: CausalDigest) -> Vec<u8> {
        match self {
            PendingAppend::Command { payload, meta } => {
                let mut out = encode_header(meta).to_vec();
                out.extend_from_slice(payload);
                out.extend_from_slice(&causal_digest);
                out
            }
            PendingAppend::Event { payload, meta, cause_id } => {
                let mut out = encode_header(meta).to_vec();
                out.extend_from_slice(&encode_event_payload(*cause_id, payload));
                out.extend_from_slice(&causal_digest);
                out
            }
            PendingAppend::LayoutIntroduction { payload, meta, cause_id, .. } => {
                let mut out = encode_header(meta).to_vec();
                out.extend_from_slice(&encode_event_payload(*cause_id, payload));
                out.extend_from_slice(&causal_digest);
                out
            }
        }
    }

    fn is_command(&self) -> bool {
        matches!(self, PendingAppend::Command { .. })
    }
}

/// A persistent journal backed by an embedded `sled` database.
///
/// Three trees: `entries` (sequence-keyed wire entries, in commit order),
/// `fingerprints` (the known-fingerprint gate), and `meta` (a single
/// `max_ts` key used to reseed the clock on restart).
#[derive(Debug)]
pub struct SledJournal {
    db: Db,
    entries: Tree,
    fingerprints: Tree,
    meta: Tree,
    commands_tx: broadcast::Sender<LayoutFingerprint>,
    events_tx: broadcast::Sender<LayoutFingerprint>,
}

impl SledJournal {
    /// Open or create a durable journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(sled::Config::default().path(path))
    }

    /// Open a journal with a custom `sled::Config`.
    pub fn open_with_config(config: sled::Config) -> Result<Self, StorageError> {
        let db = config.open().map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::from_db(db)
    }

    /// Wrap an already-open `sled::Db`.
    pub fn from_db(db: Db) -> Result<Self, StorageError> {
        let entries = db.open_tree("entries").map_err(|e| StorageError::Backend(e.to_string()))?;
        let fingerprints =
            db.open_tree("fingerprints").map_err(|e| StorageError::Backend(e.to_string()))?;
        let meta = db.open_tree("meta").map_err(|e| StorageError::Backend(e.to_string()))?;
        let (commands_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        let (events_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self { db, entries, fingerprints, meta, commands_tx, events_tx })
    }

    /// Open a temporary, throwaway journal for tests.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::open_with_config(sled::Config::new().temporary(true))
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.entries.flush_async().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        self.fingerprints.flush_async().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        self.meta.flush_async().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Total number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// An open append transaction against a [`SledJournal`].
pub struct SledTransaction {
    journal_entries: Tree,
    journal_fingerprints: Tree,
    journal_meta: Tree,
    db: Db,
    commands_tx: broadcast::Sender<LayoutFingerprint>,
    events_tx: broadcast::Sender<LayoutFingerprint>,
    buffer: Vec<PendingAppend>,
    finished: bool,
}

#[async_trait]
impl JournalTransaction for SledTransaction {
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
        if self.buffer.is_empty() {
            return Ok(());
        }

        // Sequence ids up front: `generate_id` is its own atomic, durable
        // counter, stable across restarts, independent of whether this
        // transaction ultimately succeeds (a wasted id on abort is harmless
        // — sled's keyspace tolerates gaps).
        let mut seq_ids = Vec::with_capacity(self.buffer.len());
        for _ in 0..self.buffer.len() {
            let id = self.db.generate_id().map_err(|e| StorageError::Backend(e.to_string()))?;
            seq_ids.push(id);
        }

        let buffer = std::mem::take(&mut self.buffer);
        let max_ts = buffer.iter().map(PendingAppend::timestamp).max();
        let mut command_fingerprints = Vec::new();
        let mut event_fingerprints = Vec::new();

        // Index each command's own digest by its entity id so a causally
        // dependent event — or a layout introduction appended earlier in
        // buffer order than the command it introduces a type for — can
        // chain to it regardless of relative buffer position.
        let mut command_digests: std::collections::HashMap<EntityId, CausalDigest> = std::collections::HashMap::new();
        for pending in &buffer {
            if let PendingAppend::Command { payload, meta } = pending {
                command_digests.insert(meta.id, causal_hash(payload, &[]));
            }
        }
        let digest_of = |pending: &PendingAppend| -> CausalDigest {
            match pending {
                PendingAppend::Command { payload, .. } => causal_hash(payload, &[]),
                PendingAppend::Event { payload, cause_id, .. }
                | PendingAppend::LayoutIntroduction { payload, cause_id, .. } => {
                    match command_digests.get(cause_id) {
                        Some(parent) => causal_hash(payload, &[*parent]),
                        None => causal_hash(payload, &[]),
                    }
                }
            }
        };

        let trees = (&self.journal_entries, &self.journal_fingerprints, &self.journal_meta);
        let result: Result<(), TransactionError<StorageError>> =
            trees.transaction(|(entries, fingerprints, meta)| {
                for (seq, pending) in seq_ids.iter().zip(buffer.iter()) {
                    if let PendingAppend::LayoutIntroduction { introduced, .. } = pending {
                        fingerprints.insert(&introduced.0, &[1u8][..])?;
                    } else if fingerprints.get(&pending.fingerprint().0)?.is_none() {
                        return abort(StorageError::UnknownFingerprint(pending.fingerprint()));
                    }
                    entries.insert(&seq.to_be_bytes(), pending.wire_bytes(digest_of(pending)))?;
                }
                if let Some(ts) = max_ts {
                    let existing = meta
                        .get(MAX_TS_KEY)?
                        .map(|v| decode_max_ts(&v))
                        .filter(|existing| *existing >= ts);
                    if existing.is_none() {
                        meta.insert(MAX_TS_KEY, &encode_max_ts(ts)[..])?;
                    }
                }
                Ok(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(storage_err) => storage_err,
            TransactionError::Storage(sled_err) => StorageError::Backend(sled_err.to_string()),
        })?;

        for pending in &buffer {
            if let PendingAppend::LayoutIntroduction { .. } = pending {
                // A layout introduction is itself an event of the bootstrap
                // type — broadcast its own fingerprint, matching
                // `MemoryJournal`'s behavior, not the fingerprint it
                // introduces.
                let _ = self.events_tx.send(pending.fingerprint());
            } else if pending.is_command() {
                command_fingerprints.push(pending.fingerprint());
            } else {
                event_fingerprints.push(pending.fingerprint());
            }
        }
        for fp in command_fingerprints {
            let _ = self.commands_tx.send(fp);
        }
        for fp in event_fingerprints {
            let _ = self.events_tx.send(fp);
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl Journal for SledJournal {
    async fn begin(&self) -> Result<Box<dyn JournalTransaction>, StorageError> {
        Ok(Box::new(SledTransaction {
            journal_entries: self.entries.clone(),
            journal_fingerprints: self.fingerprints.clone(),
            journal_meta: self.meta.clone(),
            db: self.db.clone(),
            commands_tx: self.commands_tx.clone(),
            events_tx: self.events_tx.clone(),
            buffer: Vec::new(),
            finished: false,
        }))
    }

    async fn iter_events(
        &self,
        filter: EventFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, StorageError> {
        let mut out = Vec::new();
        for kv in self.entries.iter() {
            let (_key, value) = kv.map_err(|e| StorageError::Backend(e.to_string()))?;
            let (meta, rest) = decode_header(&value)?;
            if rest.len() < 32 {
                return Err(StorageError::Truncated { needed: 32, got: rest.len() });
            }
            let (payload, digest_bytes) = rest.split_at(rest.len() - 32);
            if filter.after.map_or(false, |after| meta.timestamp <= after) {
                continue;
            }
            if filter.fingerprint.map_or(false, |fp| meta.fingerprint != fp) {
                continue;
            }
            let mut causal_digest: CausalDigest = [0u8; 32];
            causal_digest.copy_from_slice(digest_bytes);
            out.push(JournalEntry { meta, payload: payload.to_vec(), causal_digest });
        }
        Ok(Box::new(out.into_iter()))
    }

    fn subscribe_commands_added(&self) -> broadcast::Receiver<LayoutFingerprint> {
        self.commands_tx.subscribe()
    }

    fn subscribe_events_added(&self) -> broadcast::Receiver<LayoutFingerprint> {
        self.events_tx.subscribe()
    }

    async fn max_committed_timestamp(&self) -> Result<Option<HybridTimestamp>, StorageError> {
        Ok(self
            .meta
            .get(MAX_TS_KEY)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(|v| decode_max_ts(&v)))
    }

    async fn known_fingerprints(&self) -> Result<Vec<LayoutFingerprint>, StorageError> {
        let mut out = Vec::new();
        for kv in self.fingerprints.iter() {
            let (key, _value) = kv.map_err(|e| StorageError::Backend(e.to_string()))?;
            let mut fp = [0u8; 20];
            fp.copy_from_slice(&key);
            out.push(LayoutFingerprint(fp));
        }
        Ok(out)
    }
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
        let journal = SledJournal::temporary().unwrap();
        let mut tx = journal.begin().await.unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(1, 0))).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownFingerprint(fp) if fp == COMMAND_FP));
        assert_eq!(journal.entry_count(), 0);
    }

    #[tokio::test]
    async fn committed_entries_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let cmd_id = EntityId(Uuid::new_v4());
        {
            let journal = SledJournal::open(&path).unwrap();
            let mut tx = journal.begin().await.unwrap();
            tx.introduce_layout(
                b"schema",
                meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)),
                cmd_id,
                COMMAND_FP,
            )
            .await
            .unwrap();
            tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(2, 0))).await.unwrap();
            tx.commit().await.unwrap();
            journal.flush().await.unwrap();
        }
        {
            let journal = SledJournal::open(&path).unwrap();
            assert_eq!(journal.entry_count(), 2);
            assert_eq!(
                journal.max_committed_timestamp().await.unwrap(),
                Some(HybridTimestamp::new(2, 0))
            );
            let known = journal.known_fingerprints().await.unwrap();
            assert!(known.contains(&COMMAND_FP));
        }
    }

    #[tokio::test]
    async fn abort_leaves_no_trace() {
        let journal = SledJournal::temporary().unwrap();
        let mut tx = journal.begin().await.unwrap();
        tx.append_command(b"cmd", meta(COMMAND_FP, HybridTimestamp::new(1, 0))).await.unwrap();
        tx.abort().await.unwrap();
        assert_eq!(journal.entry_count(), 0);
    }

    #[tokio::test]
    async fn iter_events_respects_filter() {
        let journal = SledJournal::temporary().unwrap();
        let cmd_id = EntityId(Uuid::new_v4());
        let mut tx = journal.begin().await.unwrap();
        tx.introduce_layout(b"s", meta(BOOTSTRAP_FP, HybridTimestamp::new(1, 0)), cmd_id, EVENT_FP)
            .await
            .unwrap();
        tx.append_event(b"evt", meta(EVENT_FP, HybridTimestamp::new(2, 0)), cmd_id).await.unwrap();
        tx.commit().await.unwrap();

        let entries: Vec<_> = journal
            .iter_events(EventFilter { after: None, fingerprint: Some(EVENT_FP) })
            .await
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].meta.fingerprint, EVENT_FP);
    }

    #[tokio::test]
    async fn causal_digest_chains_event_to_its_command() {
        let journal = SledJournal::temporary().unwrap();
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

        let entries: Vec<_> = journal.iter_events(EventFilter::default()).await.unwrap().collect();
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
