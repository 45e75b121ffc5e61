#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-types** – Shared primitive data structures for the aeon command
//! pipeline.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It makes no assumptions about layout derivation, binary encoding, or
//! storage — those live in `aeon-layout`, `aeon-codec` and `aeon-store-core`
//! respectively.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod command;
pub use command::{Command, CommandExecution};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Stable, unique identifier for any [`Entity`] — a command or an event.
///
/// Backed by a 128-bit UUID (v4), matching the data model's "128-bit UUID"
/// requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Generate a fresh, random entity identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// 160-bit content hash identifying a canonicalized [`Layout`](aeon_layout) schema.
///
/// Lives here (rather than in `aeon-layout`) because both the wire header
/// (§6) and the core entity model need to name a fingerprint without
/// depending on the layout engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutFingerprint(pub [u8; 20]);

impl fmt::Display for LayoutFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

//─────────────────────────────
//  Hybrid logical clock timestamp
//─────────────────────────────

/// Pair `(physical_ms, logical)` assigned to every entity.
///
/// Total order is lexicographic: first by wall-clock milliseconds, then by
/// the logical counter. See `aeon-clock` for how these are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Monotonic wall-clock milliseconds at the time of the tick.
    pub wall_ms: u64,
    /// Logical tie-breaker, reset to zero whenever `wall_ms` advances.
    pub logical: u32,
}

impl HybridTimestamp {
    /// The smallest representable timestamp; never issued by a live clock.
    pub const MIN: HybridTimestamp = HybridTimestamp { wall_ms: 0, logical: 0 };

    /// Construct a timestamp directly. Prefer `HybridClock::tick` in
    /// production code; this is for tests and deserialization helpers.
    pub fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.logical.cmp(&other.logical))
    }
}

//─────────────────────────────
//  Entity header
//─────────────────────────────

/// Metadata common to every persisted entity (command or event), assigned
/// by the command consumer during the Timestamping/Executing phases — never
/// by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHeader {
    /// Stable identifier.
    pub id: EntityId,
    /// HLC stamp at the moment this entity was admitted.
    pub timestamp: HybridTimestamp,
    /// Fingerprint of the entity's layout.
    pub fingerprint: LayoutFingerprint,
}

/// An entity paired with its envelope metadata, ready for journaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committed<T> {
    /// Envelope header.
    pub header: EntityHeader,
    /// Entity-specific payload.
    pub body: T,
}

//─────────────────────────────
//  Built-in event kinds
//─────────────────────────────

/// Declares a causal edge from a command to one of the events it produced.
///
/// Emitted once per user event by the consumer during the Executing phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCausalityEstablished {
    /// The event this edge points to.
    pub event_id: EntityId,
    /// The command that caused it.
    pub cause_id: EntityId,
}

/// Recorded when an in-progress command fails, in lieu of any user events it
/// had already produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTerminatedExceptionally {
    /// Human-readable failure summary.
    pub message: String,
}

/// Recorded once per newly observed entity type, before the first entity of
/// that fingerprint is appended anywhere in the journal.
///
/// `schema` holds the layout's canonical encoding (opaque here — decode it
/// with `aeon_layout::Layout::decode_schema`) so this crate does not need to
/// depend on the layout engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLayoutIntroduced {
    /// Fingerprint the schema belongs to.
    pub fingerprint: LayoutFingerprint,
    /// Canonical, encoded schema bytes.
    pub schema: Vec<u8>,
}

/// Opaque capture of a host-side failure raised by a command's `execute`.
///
/// Named `HostErrorOccurred` per the redesign flag on the source's
/// `JavaExceptionOccurred` — the host language is no longer necessarily the
/// JVM, so the event is renamed to describe what it records rather than
/// where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostErrorOccurred {
    /// Opaque failure detail captured from the command's `execute`.
    pub detail: String,
}

/// Parent event identifiers a causal chain entry may reference; mirrors the
/// small, usually-one-or-two-parent shape of a causality edge without
/// forcing a heap allocation for the common case.
pub type ParentIds = SmallVec<[EntityId; 4]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_timestamp_orders_lexicographically() {
        let a = HybridTimestamp::new(100, 5);
        let b = HybridTimestamp::new(100, 6);
        let c = HybridTimestamp::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn entity_id_roundtrips_through_json() {
        let id = EntityId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn fingerprint_displays_as_hex() {
        let fp = LayoutFingerprint([0xab; 20]);
        assert_eq!(fp.to_string(), "ab".repeat(20));
    }
}
