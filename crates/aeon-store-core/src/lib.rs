#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-store-core** – Core journal abstractions for the aeon command
//! pipeline.
//!
//! This crate defines the transactional append contract every durability
//! backend implements (`aeon-store-memory`, `aeon-store-sled`) without
//! providing a concrete implementation itself. It knows nothing about
//! layouts or the binary codec — entities arrive as opaque bytes plus an
//! [`EntityMeta`] envelope, the same separation `aeon-layout`/`aeon-codec`
//! keep from `aeon-types`.

use std::fmt;

use async_trait::async_trait;

use aeon_types::{EntityId, HybridTimestamp, LayoutFingerprint};

//─────────────────────────────
//  Wire header
//─────────────────────────────

/// Envelope metadata persisted alongside every entity's payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    /// Entity identifier.
    pub id: EntityId,
    /// HLC stamp at admission.
    pub timestamp: HybridTimestamp,
    /// Layout fingerprint of the entity's type.
    pub fingerprint: LayoutFingerprint,
}

/// Length, in bytes, of the fixed-width header preceding every entity's
/// payload: `[20 B fingerprint][8 B wall_ms][4 B logical][16 B uuid]`.
pub const HEADER_LEN: usize = 20 + 8 + 4 + 16;

/// Encode an [`EntityMeta`] into the fixed-width wire header.
pub fn encode_header(meta: &EntityMeta) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..20].copy_from_slice(&meta.fingerprint.0);
    out[20..28].copy_from_slice(&meta.timestamp.wall_ms.to_be_bytes());
    out[28..32].copy_from_slice(&meta.timestamp.logical.to_be_bytes());
    out[32..48].copy_from_slice(meta.id.0.as_bytes());
    out
}

/// Decode a fixed-width wire header, returning the parsed [`EntityMeta`] and
/// the slice of `bytes` following it.
pub fn decode_header(bytes: &[u8]) -> Result<(EntityMeta, &[u8]), StorageError> {
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::Truncated { needed: HEADER_LEN, got: bytes.len() });
    }
    let mut fingerprint = [0u8; 20];
    fingerprint.copy_from_slice(&bytes[0..20]);
    let wall_ms = u64::from_be_bytes(bytes[20..28].try_into().unwrap());
    let logical = u32::from_be_bytes(bytes[28..32].try_into().unwrap());
    let id = uuid::Uuid::from_slice(&bytes[32..48]).expect("slice is exactly 16 bytes");
    let meta = EntityMeta {
        id: EntityId(id),
        timestamp: HybridTimestamp::new(wall_ms, logical),
        fingerprint: LayoutFingerprint(fingerprint),
    };
    Ok((meta, &bytes[HEADER_LEN..]))
}

/// Prefix an event payload with its causing command's id, per the wire
/// format's "causality link events additionally embed `[16 B cause_uuid]`
/// in payload position 0" rule.
pub fn encode_event_payload(cause_id: EntityId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(cause_id.0.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a causality-linked event payload back into its cause id and the
/// remaining codec payload (the inverse of [`encode_event_payload`]).
pub fn decode_event_payload(bytes: &[u8]) -> Result<(EntityId, &[u8]), StorageError> {
    if bytes.len() < 16 {
        return Err(StorageError::Truncated { needed: 16, got: bytes.len() });
    }
    let cause_id = uuid::Uuid::from_slice(&bytes[0..16]).expect("slice is exactly 16 bytes");
    Ok((EntityId(cause_id), &bytes[16..]))
}

//─────────────────────────────
//  Causal digest
//─────────────────────────────

/// A content digest chaining an entity's payload to its causing entity's own
/// digest, independent of the SHA-1 layout fingerprint (which identifies a
/// *schema*, not a specific committed entity).
pub type CausalDigest = [u8; 32];

/// Compute a causal digest: `BLAKE3(payload || parent_digest_1 || …)`.
/// Identical payload plus identical parent digests always yields the same
/// result; any divergence in either changes it. Backends compute this once
/// per committed entry and carry it on the corresponding [`JournalEntry`] as
/// an internal integrity aid — it is never part of the wire format and plays
/// no role in fingerprint-gating or the layout engine.
pub fn causal_hash(payload: &[u8], parent_digests: &[CausalDigest]) -> CausalDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    for digest in parent_digests {
        hasher.update(digest);
    }
    *hasher.finalize().as_bytes()
}

//─────────────────────────────
//  Journal entry, as read back
//─────────────────────────────

/// An entity as read back from the journal via [`Journal::iter_events`]:
/// envelope plus raw payload bytes (undecoded — the caller knows how to
/// interpret them via the layout the fingerprint names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Envelope metadata.
    pub meta: EntityMeta,
    /// Raw entity payload, as persisted.
    pub payload: Vec<u8>,
    /// Causal digest computed by the backend at commit time.
    pub causal_digest: CausalDigest,
}

/// Filter applied when iterating committed events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only include entries stamped strictly after this timestamp.
    pub after: Option<HybridTimestamp>,
    /// Only include entries of this fingerprint.
    pub fingerprint: Option<LayoutFingerprint>,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by journal operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Input ran out of bytes while decoding a wire entry.
    #[error("truncated journal entry: needed {needed} byte(s), got {got}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes actually available.
        got: usize,
    },
    /// An append named a fingerprint with no prior `EntityLayoutIntroduced`.
    #[error("unknown layout fingerprint: {0}")]
    UnknownFingerprint(LayoutFingerprint),
    /// The transaction was already committed or aborted.
    #[error("transaction already finished")]
    TransactionFinished,
    /// The backing store rejected an operation.
    #[error("backend error: {0}")]
    Backend(String),
}

//─────────────────────────────
//  Transaction contract
//─────────────────────────────

/// A single all-or-nothing unit of append work. Dropping a transaction
/// without calling [`Transaction::commit`] or [`Transaction::abort`] leaves
/// it uncommitted; backends are encouraged (but not required by this trait)
/// to treat an unfinished drop as an implicit abort.
#[async_trait]
pub trait Transaction: Send {
    /// Buffer a command for append. Rejected with
    /// [`StorageError::UnknownFingerprint`] if `meta.fingerprint` has not
    /// previously been introduced.
    async fn append_command(&mut self, payload: &[u8], meta: EntityMeta) -> Result<(), StorageError>;

    /// Buffer a user or built-in event for append, linked to the command
    /// that caused it.
    async fn append_event(
        &mut self,
        payload: &[u8],
        meta: EntityMeta,
        cause_id: EntityId,
    ) -> Result<(), StorageError>;

    /// Buffer an `EntityLayoutIntroduced` event for append and mark
    /// `introduced` as a known fingerprint for all future appends (in this
    /// transaction, once committed, and in every transaction thereafter).
    /// `meta.fingerprint` names the `EntityLayoutIntroduced` event's own
    /// type, which every journal accepts unconditionally as a bootstrap
    /// fingerprint.
    async fn introduce_layout(
        &mut self,
        payload: &[u8],
        meta: EntityMeta,
        cause_id: EntityId,
        introduced: LayoutFingerprint,
    ) -> Result<(), StorageError>;

    /// Make every buffered append durable and visible. All-or-nothing: if
    /// this returns `Err`, none of the transaction's appends are visible.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every buffered append. Leaves no trace in the journal.
    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

//─────────────────────────────
//  Journal contract
//─────────────────────────────

/// The durable, transactional event store the command consumer appends
/// through.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Begin a new transaction. The consumer never holds two open
    /// transactions at once per worker (see the concurrency model), but
    /// multiple workers may each hold one concurrently.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    /// Lazily iterate committed entries matching `filter`, in commit order.
    async fn iter_events(
        &self,
        filter: EventFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, StorageError>;

    /// Subscribe to a live feed of fingerprints newly observed among
    /// committed commands. Stands in for the spec's `on_commands_added`
    /// registration point.
    fn subscribe_commands_added(&self) -> tokio::sync::broadcast::Receiver<LayoutFingerprint>;

    /// Subscribe to a live feed of fingerprints newly observed among
    /// committed events. Stands in for the spec's `on_events_added`
    /// registration point.
    fn subscribe_events_added(&self) -> tokio::sync::broadcast::Receiver<LayoutFingerprint>;

    /// The highest HLC timestamp this journal has ever committed, if any —
    /// used to reseed the clock on restart.
    async fn max_committed_timestamp(&self) -> Result<Option<HybridTimestamp>, StorageError>;

    /// Every fingerprint this journal has accepted an
    /// `EntityLayoutIntroduced` for, bootstrap fingerprint included.
    async fn known_fingerprints(&self) -> Result<Vec<LayoutFingerprint>, StorageError>;
}

impl fmt::Debug for dyn Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Transaction")
    }
}
