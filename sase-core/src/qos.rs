//! QoS marker / shaper (spec §4.8, §3 "QoS token bucket"). DSCP marking is
//! unconditional; the scavenger-class token bucket is the only class that
//! can drop a packet at this stage. Token buckets are per-worker, per
//! (tenant, class) — no cross-worker sharing, same shared-nothing rule as
//! [`crate::session`] and [`crate::nat`].

use std::collections::HashMap;
use std::time::Instant;

use crate::metadata::QosClass;

/// Upper six bits of the ToS/traffic-class byte; lower two ECN bits are
/// preserved untouched (spec §4.8: "ECN bits are preserved").
const DSCP_MASK: u8 = 0b1111_1100;
const ECN_MASK: u8 = 0b0000_0011;

/// Rewrites the ToS/traffic-class byte's DSCP bits for `class`, leaving the
/// ECN bits alone. Idempotent: re-marking the same class twice is a no-op
/// (spec §8: "DSCP marking is idempotent within a class").
pub fn mark_dscp(tos_byte: u8, class: QosClass) -> u8 {
    let dscp = class.dscp() << 2;
    (tos_byte & ECN_MASK) | (dscp & DSCP_MASK)
}

/// A per-(tenant, class) token bucket (spec §3 "QoS token bucket"). Burst
/// is fixed at `rate_bps * 0.1s` per spec §3's formula, refilled lazily on
/// each `try_consume` rather than by a background timer.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    rate_bps: f64,
    burst_bytes: f64,
}

impl TokenBucket {
    pub fn new(rate_bps: u64, now: Instant) -> Self {
        let burst_bytes = rate_bps as f64 * 0.1;
        Self {
            tokens: burst_bytes,
            last_update: now,
            rate_bps: rate_bps as f64,
            burst_bytes,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_bps).min(self.burst_bytes);
        self.last_update = now;
    }

    /// Attempts to admit a `packet_bytes`-sized packet at `now`. Refills
    /// first, then admits iff `tokens >= packet_bytes` (spec §4.8), leaving
    /// `tokens` untouched on denial so a later retry at the same instant
    /// behaves identically.
    pub fn try_consume(&mut self, packet_bytes: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= packet_bytes as f64 {
            self.tokens -= packet_bytes as f64;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn burst_bytes(&self) -> f64 {
        self.burst_bytes
    }
}

/// Per-worker map of (tenant, class) to its token bucket. Only the
/// scavenger class is actually rate-limited by the stage (spec §4.8), but
/// the table is keyed generally so a control-plane rate-limit update (spec
/// §6 "set rate limit") can target any class.
#[derive(Default)]
pub struct ShaperTable {
    buckets: HashMap<(u32, QosClass), TokenBucket>,
}

impl ShaperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the bucket for `(tenant_id, class)` at
    /// `rate_bps` (spec §6 "set rate limit (tenant_id, qos_class, Mbps)").
    pub fn configure(&mut self, tenant_id: u32, class: QosClass, rate_bps: u64, now: Instant) {
        self.buckets.insert((tenant_id, class), TokenBucket::new(rate_bps, now));
    }

    /// Marks DSCP for every packet, and additionally rate-limits
    /// `QosClass::Scavenger` against its tenant's bucket. Returns `true` if
    /// the packet is admitted. Classes with no configured bucket (no rate
    /// limit installed) are always admitted.
    pub fn admit(&mut self, tenant_id: u32, class: QosClass, packet_bytes: u64, now: Instant) -> bool {
        if class != QosClass::Scavenger {
            return true;
        }
        match self.buckets.get_mut(&(tenant_id, class)) {
            Some(bucket) => bucket.try_consume(packet_bytes, now),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mark_dscp_preserves_ecn_bits() {
        let tos = 0b0000_0010; // ECN bit set, no DSCP
        let marked = mark_dscp(tos, QosClass::Realtime);
        assert_eq!(marked & ECN_MASK, 0b0000_0010);
        assert_eq!(marked >> 2, 46);
    }

    #[test]
    fn mark_dscp_is_idempotent_within_a_class() {
        let tos = 0b0000_0001;
        let once = mark_dscp(tos, QosClass::Business);
        let twice = mark_dscp(once, QosClass::Business);
        assert_eq!(once, twice);
    }

    #[test]
    fn all_qos_classes_map_to_spec_dscp_values() {
        assert_eq!(QosClass::Realtime.dscp(), 46);
        assert_eq!(QosClass::Business.dscp(), 26);
        assert_eq!(QosClass::Default.dscp(), 0);
        assert_eq!(QosClass::Bulk.dscp(), 10);
        assert_eq!(QosClass::Scavenger.dscp(), 8);
    }

    #[test]
    fn token_bucket_admits_within_burst_then_empties() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(800_000_000, now); // 100 MB/s => burst 80 MB
        assert!(bucket.try_consume(50_000_000, now));
        assert!(!bucket.try_consume(50_000_000, now));
    }

    #[test]
    fn token_bucket_refills_over_time_and_saturates_at_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1_000_000, now);
        bucket.try_consume(100_000, now);
        let later = now + Duration::from_secs(10);
        bucket.refill(later);
        assert_eq!(bucket.tokens(), bucket.burst_bytes());
    }

    #[test]
    fn shaper_only_rate_limits_scavenger_class() {
        let now = Instant::now();
        let mut table = ShaperTable::new();
        table.configure(7, QosClass::Scavenger, 100, now); // tiny rate
        assert!(table.admit(7, QosClass::Realtime, 1_000_000, now));
        assert!(table.admit(7, QosClass::Scavenger, 1, now));
        assert!(!table.admit(7, QosClass::Scavenger, 1_000_000, now));
    }

    #[test]
    fn unconfigured_bucket_always_admits() {
        let now = Instant::now();
        let mut table = ShaperTable::new();
        assert!(table.admit(1, QosClass::Scavenger, 1_000_000_000, now));
    }
}
