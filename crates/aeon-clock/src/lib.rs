#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-clock** – Hybrid Logical Clock (HLC) for the aeon command pipeline.
//!
//! Assigns monotonically increasing, causally consistent `(wall_ms, logical)`
//! timestamps to every command and event, across restarts and across
//! reconciliation with externally observed timestamps (recovery, federation).
//! See spec §4.1 for the tick/update algorithms this crate implements
//! verbatim.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use aeon_types::HybridTimestamp;

//─────────────────────────────
//  Physical time source
//─────────────────────────────

/// Source of monotonic wall-clock milliseconds. A real deployment backs this
/// with NTP-disciplined system time (out of scope for this crate per the
/// spec's "NTP physical-time source" exclusion — only the interface lives
/// here); tests back it with a fully controlled fake.
pub trait PhysicalClock: Send + Sync {
    /// The current wall-clock time in milliseconds, or `None` if the time
    /// source is currently unavailable (the clock degrades to logical-only
    /// advancement for this tick when that happens).
    fn now_millis(&self) -> Option<u64>;
}

/// [`PhysicalClock`] backed by [`SystemTime`]. Never reports unavailability
/// in practice — `SystemTime::now()` only fails to compare against
/// `UNIX_EPOCH` if the system clock is set before 1970, which this maps to a
/// degraded tick rather than panicking.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPhysicalClock;

impl PhysicalClock for SystemPhysicalClock {
    fn now_millis(&self) -> Option<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64)
    }
}

//─────────────────────────────
//  Hybrid logical clock
//─────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pt: u64,
    l: u32,
}

/// A hybrid logical clock: holds `(pt, l)` and advances it under a single
/// writer lock so every issued timestamp is totally ordered (§5 "HLC tick is
/// serialized").
pub struct HybridClock {
    state: Mutex<ClockState>,
    source: Box<dyn PhysicalClock>,
    degraded: AtomicBool,
    degraded_ticks: AtomicU64,
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .field("degraded_ticks", &self.degraded_ticks.load(Ordering::Relaxed))
            .finish()
    }
}

impl HybridClock {
    /// Construct a clock seeded at [`HybridTimestamp::MIN`], backed by the
    /// real system clock.
    pub fn new() -> Self {
        Self::with_source(Box::new(SystemPhysicalClock))
    }

    /// Construct a clock backed by an arbitrary [`PhysicalClock`] (primarily
    /// for tests) and seeded at [`HybridTimestamp::MIN`].
    pub fn with_source(source: Box<dyn PhysicalClock>) -> Self {
        Self::seeded(HybridTimestamp::MIN, source)
    }

    /// Construct a clock seeded from a previously persisted timestamp — the
    /// restart path (S4): the journal's max committed timestamp reseeds the
    /// clock so it never re-issues a stamp it has already emitted.
    pub fn seeded(seed: HybridTimestamp, source: Box<dyn PhysicalClock>) -> Self {
        Self {
            state: Mutex::new(ClockState { pt: seed.wall_ms, l: seed.logical }),
            source,
            degraded: AtomicBool::new(false),
            degraded_ticks: AtomicU64::new(0),
        }
    }

    /// Advance the clock and return the newly issued timestamp.
    ///
    /// ```text
    /// now = physical_time_now()
    /// if now > pt:  pt' = now;  l' = 0
    /// else:         pt' = pt;  l' = l + 1
    /// ```
    /// If the physical time source is unavailable, `now` is treated as `pt`
    /// (the `else` branch), so the clock advances logical-only and the
    /// degraded counter ticks — wall-clock regression or unavailability
    /// never decreases the emitted timestamp.
    pub fn tick(&self) -> HybridTimestamp {
        let mut guard = self.state.lock().expect("hybrid clock poisoned");
        let now = self.source.now_millis();
        match now {
            Some(now) if now > guard.pt => {
                guard.pt = now;
                guard.l = 0;
                self.degraded.store(false, Ordering::Relaxed);
            }
            Some(_) => {
                guard.l += 1;
                self.degraded.store(false, Ordering::Relaxed);
            }
            None => {
                guard.l += 1;
                self.degraded.store(true, Ordering::Relaxed);
                self.degraded_ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
        HybridTimestamp::new(guard.pt, guard.l)
    }

    /// Reconcile with an externally observed peer timestamp (recovery or
    /// federation ingestion), per:
    /// ```text
    /// max_pt = max(pt, peer_pt, now)
    /// if max_pt == pt == peer_pt: l' = max(l, peer_l) + 1
    /// elif max_pt == pt:          l' = l + 1
    /// elif max_pt == peer_pt:     l' = peer_l + 1
    /// else:                       l' = 0
    /// pt' = max_pt
    /// ```
    pub fn update(&self, peer: HybridTimestamp) -> HybridTimestamp {
        let mut guard = self.state.lock().expect("hybrid clock poisoned");
        let observed = self.source.now_millis();
        let now = observed.unwrap_or(guard.pt);
        if observed.is_none() {
            self.degraded.store(true, Ordering::Relaxed);
            self.degraded_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.degraded.store(false, Ordering::Relaxed);
        }

        let max_pt = guard.pt.max(peer.wall_ms).max(now);
        let new_l = if max_pt == guard.pt && max_pt == peer.wall_ms {
            guard.l.max(peer.logical) + 1
        } else if max_pt == guard.pt {
            guard.l + 1
        } else if max_pt == peer.wall_ms {
            peer.logical + 1
        } else {
            0
        };

        guard.pt = max_pt;
        guard.l = new_l;
        HybridTimestamp::new(guard.pt, guard.l)
    }

    /// Read the most recently issued timestamp without advancing the clock.
    pub fn peek(&self) -> HybridTimestamp {
        let guard = self.state.lock().expect("hybrid clock poisoned");
        HybridTimestamp::new(guard.pt, guard.l)
    }

    /// Whether the most recent tick/update advanced logical-only because the
    /// physical time source was unavailable.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Monotone count of ticks that advanced logical-only due to a degraded
    /// physical time source — readable by observability without locking the
    /// clock.
    pub fn degraded_ticks(&self) -> u64 {
        self.degraded_ticks.load(Ordering::Relaxed)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}
