//! Hybrid Logical Clock: a physical-time-anchored, strictly monotonic,
//! site-tagged timestamp.
//!
//! Serializes to a fixed 26-byte big-endian encoding whose lexicographic
//! order equals HLC order, so an HLC can be used directly as (a prefix of)
//! an ordered KV key.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::site::SiteId;

/// Wire and in-memory length of a serialized [`Hlc`]: 8 bytes wall time + 2
/// bytes counter + 16 bytes site id.
pub const HLC_BYTE_LEN: usize = 8 + 2 + SiteId::BYTE_LEN;

/// A Hybrid Logical Clock timestamp: `(wallTime, counter, siteId)`.
///
/// Ordering is derived field-by-field in declaration order: wall time
/// first, counter second, site id third — matching the byte layout
/// produced by [`Hlc::to_bytes`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hlc {
    pub wall_time: u64,
    pub counter: u16,
    pub site_id: SiteId,
}

impl std::fmt::Debug for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hlc({})", self)
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:04x}-{}", self.wall_time, self.counter, self.site_id)
    }
}

impl Hlc {
    /// The zero value for a freshly-opened replica that has never ticked.
    pub fn zero(site_id: SiteId) -> Self {
        Hlc {
            wall_time: 0,
            counter: 0,
            site_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HLC_BYTE_LEN] {
        let mut out = [0u8; HLC_BYTE_LEN];
        out[0..8].copy_from_slice(&self.wall_time.to_be_bytes());
        out[8..10].copy_from_slice(&self.counter.to_be_bytes());
        out[10..26].copy_from_slice(&self.site_id.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HLC_BYTE_LEN {
            return Err(SyncError::corrupt(
                bytes,
                format!("HLC must be exactly {HLC_BYTE_LEN} bytes"),
            ));
        }
        let wall_time = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let counter = u16::from_be_bytes(bytes[8..10].try_into().unwrap());
        let site_id = SiteId::from_bytes(&bytes[10..26])?;
        Ok(Hlc {
            wall_time,
            counter,
            site_id,
        })
    }
}

/// Persistable `(wallTime, counter)` pair, restored at engine open; the site
/// id is restored separately since it does not change across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlcClockState {
    pub wall_time: u64,
    pub counter: u16,
}

/// Source of physical time, abstracted so tests can drive the clock
/// deterministically without sleeping.
pub trait PhysicalClock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_millis(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }
}

/// A single replica's Hybrid Logical Clock, holding the mutable
/// `(wallTime, counter)` state.
///
/// Not internally lock-guarded: callers serialize access to one
/// `SyncManager`, so `HlcClock` takes `&mut self`.
pub struct HlcClock<C: PhysicalClock = SystemClock> {
    site_id: SiteId,
    state: HlcClockState,
    max_drift_millis: u64,
    physical: C,
}

impl HlcClock<SystemClock> {
    pub fn new(site_id: SiteId, max_drift_millis: u64) -> Self {
        HlcClock {
            site_id,
            state: HlcClockState {
                wall_time: 0,
                counter: 0,
            },
            max_drift_millis,
            physical: SystemClock,
        }
    }
}

impl<C: PhysicalClock> HlcClock<C> {
    pub fn with_physical_clock(site_id: SiteId, max_drift_millis: u64, physical: C) -> Self {
        HlcClock {
            site_id,
            state: HlcClockState {
                wall_time: 0,
                counter: 0,
            },
            max_drift_millis,
            physical,
        }
    }

    /// Restores persisted `(wallTime, counter)` state at engine open.
    pub fn restore(&mut self, state: HlcClockState) {
        self.state = state;
    }

    pub fn state(&self) -> HlcClockState {
        self.state
    }

    /// Returns the current state as an `Hlc` without mutating it.
    pub fn now(&self) -> Hlc {
        Hlc {
            wall_time: self.state.wall_time,
            counter: self.state.counter,
            site_id: self.site_id,
        }
    }

    /// Generates a new local HLC, strictly greater than every previously
    /// emitted or received HLC on this replica.
    pub fn tick(&mut self) -> Result<Hlc> {
        let physical_now = self.physical.now_millis();
        let wall_time = physical_now.max(self.state.wall_time);
        let counter = if wall_time == self.state.wall_time {
            self.state
                .counter
                .checked_add(1)
                .ok_or(SyncError::CounterOverflow { wall_time })?
        } else {
            0
        };
        self.state = HlcClockState { wall_time, counter };
        Ok(self.now())
    }

    /// Merges a remote HLC into local state, failing with [`SyncError::ClockSkew`]
    /// if the remote wall time is implausibly far ahead of local physical
    /// time. On success the resulting HLC strictly dominates both the prior
    /// local state and the remote HLC.
    pub fn receive(&mut self, remote: &Hlc) -> Result<Hlc> {
        let physical_now = self.physical.now_millis();
        if remote.wall_time > physical_now
            && remote.wall_time - physical_now > self.max_drift_millis
        {
            return Err(SyncError::clock_skew(remote, self.max_drift_millis));
        }

        let wall_time = physical_now.max(self.state.wall_time).max(remote.wall_time);

        let counter = match (wall_time == self.state.wall_time, wall_time == remote.wall_time) {
            (true, true) => self.state.counter.max(remote.counter).checked_add(1),
            (true, false) => self.state.counter.checked_add(1),
            (false, true) => remote.counter.checked_add(1),
            (false, false) => Some(0),
        }
        .ok_or(SyncError::CounterOverflow { wall_time })?;

        self.state = HlcClockState { wall_time, counter };
        Ok(self.now())
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeClock(Cell<u64>);

    impl PhysicalClock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.get()
        }
    }

    fn site() -> SiteId {
        SiteId::generate()
    }

    #[test]
    fn tick_is_strictly_monotonic() {
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, FakeClock(Cell::new(1000)));
        let mut last = clock.tick().unwrap();
        for _ in 0..1000 {
            let next = clock.tick().unwrap();
            assert!(next > last, "{:?} should be > {:?}", next, last);
            last = next;
        }
    }

    #[test]
    fn tick_at_same_millis_increments_counter() {
        let fake = FakeClock(Cell::new(5000));
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, fake);
        let a = clock.tick().unwrap();
        let b = clock.tick().unwrap();
        assert_eq!(a.wall_time, b.wall_time);
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn tick_advances_wall_time_resets_counter() {
        let fake = FakeClock(Cell::new(5000));
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, fake);
        let a = clock.tick().unwrap();
        assert_eq!(a.counter, 0);
    }

    #[test]
    fn receive_advances_past_remote_and_local() {
        let fake = FakeClock(Cell::new(1000));
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, fake);
        let local_before = clock.tick().unwrap();
        let remote = Hlc {
            wall_time: 2000,
            counter: 7,
            site_id: site(),
        };
        let merged = clock.receive(&remote).unwrap();
        assert!(merged > local_before);
        assert!(merged > remote);
    }

    #[test]
    fn receive_rejects_excessive_skew() {
        let fake = FakeClock(Cell::new(1000));
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, fake);
        let remote = Hlc {
            wall_time: 1000 + 60_001,
            counter: 0,
            site_id: site(),
        };
        let before = clock.state();
        let err = clock.receive(&remote).unwrap_err();
        assert!(matches!(err, SyncError::ClockSkew { .. }));
        assert_eq!(clock.state(), before, "no state change on rejected receive");
    }

    #[test]
    fn counter_overflow_is_fatal() {
        let fake = FakeClock(Cell::new(1000));
        let mut clock = HlcClock::with_physical_clock(site(), 60_000, fake);
        clock.restore(HlcClockState {
            wall_time: 1000,
            counter: u16::MAX,
        });
        let err = clock.tick().unwrap_err();
        assert!(matches!(err, SyncError::CounterOverflow { .. }));
    }

    #[test]
    fn serialization_round_trips_at_26_bytes() {
        let hlc = Hlc {
            wall_time: 1_700_000_000_123,
            counter: 42,
            site_id: site(),
        };
        let bytes = hlc.to_bytes();
        assert_eq!(bytes.len(), HLC_BYTE_LEN);
        assert_eq!(HLC_BYTE_LEN, 26);
        let back = Hlc::from_bytes(&bytes).unwrap();
        assert_eq!(hlc, back);
    }

    #[test]
    fn byte_order_matches_hlc_order() {
        let s = site();
        let earlier = Hlc {
            wall_time: 100,
            counter: 5,
            site_id: s,
        };
        let later = Hlc {
            wall_time: 100,
            counter: 6,
            site_id: s,
        };
        assert!(earlier < later);
        assert!(earlier.to_bytes() < later.to_bytes());
    }
}
