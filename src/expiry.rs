//! Ingress expiry computation and the clock it reads.
//!
//! Expiries are rounded down to coarse boundaries so that repeated calls
//! built in the same window produce the same `ingress_expiry` (and hence
//! the same request id), which is what the replica's duplicate detection
//! keys on. Rounding only ever moves the expiry earlier, never past the
//! corrected current time.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MINUTE_MS: u64 = 60_000;
const SECOND_MS: u64 = 1_000;
const NS_PER_MS: u64 = 1_000_000;

/// Wall-clock source used when building requests and checking certificate
/// freshness. Implementations must be cheap and callable from any task.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The default clock: system wall time behind an atomic high-watermark.
///
/// The watermark makes successive reads non-decreasing even if the OS
/// clock steps backwards (NTP adjustment, resume from suspension), which
/// the expiry monotonicity invariant relies on.
#[derive(Debug, Default)]
pub struct SystemClock {
    watermark_ms: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let system_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let previous = self.watermark_ms.fetch_max(system_ms, Ordering::AcqRel);
        previous.max(system_ms)
    }
}

/// An absolute ingress expiry, in nanoseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Expiry(u64);

impl Expiry {
    /// Computes an expiry `delta_ms` into the future of the drift-corrected
    /// clock.
    ///
    /// The result is rounded down to the minute when the minute boundary
    /// still lies at least a minute ahead of the corrected now, otherwise
    /// down to the second.
    pub fn from_delta(delta_ms: u64, drift_ms: i64, now_ms: u64) -> Self {
        let corrected = now_ms.saturating_add_signed(drift_ms);
        let target = corrected.saturating_add(delta_ms);
        let floor_minute = target - target % MINUTE_MS;

        let rounded = if target - corrected >= MINUTE_MS
            && floor_minute.saturating_sub(corrected) >= MINUTE_MS
        {
            floor_minute
        } else {
            target - target % SECOND_MS
        };
        Expiry(rounded * NS_PER_MS)
    }

    pub fn from_nanos(ns: u64) -> Self {
        Expiry(ns)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

// The JSON carrier keeps the nanosecond count as a decimal string so the
// value survives languages whose native numbers top out at 2^53.
#[derive(Serialize, Deserialize)]
struct ExpiryCarrier {
    #[serde(rename = "__expiry_ns__")]
    ns: String,
}

impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ExpiryCarrier { ns: self.0.to_string() }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let carrier = ExpiryCarrier::deserialize(deserializer)?;
        let ns = carrier
            .ns
            .parse::<u64>()
            .map_err(|e| D::Error::custom(format!("invalid expiry carrier: {e}")))?;
        Ok(Expiry(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-05-01T12:34:56.789Z
    const NOW_MS: u64 = 1_746_102_896_789;

    #[test]
    fn long_deltas_round_down_to_the_minute() {
        let expiry = Expiry::from_delta(5 * MINUTE_MS, 0, NOW_MS);
        let target = NOW_MS + 5 * MINUTE_MS;
        assert_eq!(expiry.as_nanos(), (target - target % MINUTE_MS) * NS_PER_MS);
        assert_eq!(expiry.as_nanos() % (MINUTE_MS * NS_PER_MS), 0);
    }

    #[test]
    fn short_deltas_round_down_to_the_second() {
        let expiry = Expiry::from_delta(30 * SECOND_MS, 0, NOW_MS);
        let target = NOW_MS + 30 * SECOND_MS;
        assert_eq!(expiry.as_nanos(), (target - target % SECOND_MS) * NS_PER_MS);
    }

    #[test]
    fn minute_rounding_requires_a_full_minute_of_margin() {
        // One minute ahead of a mid-minute now: flooring to the minute
        // would leave less than a minute of margin, so seconds win.
        let expiry = Expiry::from_delta(MINUTE_MS, 0, NOW_MS);
        let target = NOW_MS + MINUTE_MS;
        assert_eq!(expiry.as_nanos(), (target - target % SECOND_MS) * NS_PER_MS);

        // From an exact minute boundary the margin holds.
        let aligned_now = NOW_MS - NOW_MS % MINUTE_MS;
        let expiry = Expiry::from_delta(MINUTE_MS, 0, aligned_now);
        assert_eq!(expiry.as_nanos(), (aligned_now + MINUTE_MS) * NS_PER_MS);
    }

    #[test]
    fn never_rounds_below_the_corrected_clock() {
        for delta in [0, 1, 999, SECOND_MS, 59_999, MINUTE_MS, 5 * MINUTE_MS] {
            for drift in [-120_000i64, 0, 120_000] {
                let corrected = NOW_MS.saturating_add_signed(drift);
                let expiry = Expiry::from_delta(delta, drift, NOW_MS);
                assert!(
                    expiry.as_nanos() >= corrected.saturating_sub(SECOND_MS) * NS_PER_MS,
                    "expiry fell behind corrected clock for delta={delta} drift={drift}"
                );
            }
        }
    }

    #[test]
    fn is_monotonic_in_now_for_fixed_inputs() {
        let mut previous = 0;
        for advance in 0..180 {
            let expiry = Expiry::from_delta(5 * MINUTE_MS, -30_000, NOW_MS + advance * SECOND_MS);
            assert!(expiry.as_nanos() >= previous);
            previous = expiry.as_nanos();
        }
    }

    #[test]
    fn json_carrier_round_trips_bit_exact() {
        let expiry = Expiry::from_nanos(u64::MAX - 3);
        let json = serde_json::to_string(&expiry).unwrap();
        assert!(json.contains("__expiry_ns__"));
        assert!(json.contains(&(u64::MAX - 3).to_string()));
        let decoded: Expiry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, expiry);
    }

    #[test]
    fn json_carrier_rejects_non_integers() {
        assert!(serde_json::from_str::<Expiry>(r#"{"__expiry_ns__":"12.5"}"#).is_err());
        assert!(serde_json::from_str::<Expiry>(r#"{"__expiry_ns__":"-1"}"#).is_err());
    }

    #[test]
    fn system_clock_never_decreases() {
        let clock = SystemClock::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let now = clock.now_ms();
            assert!(now >= previous);
            previous = now;
        }
    }
}
