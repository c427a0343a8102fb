//! Stateful NAT44 (spec §4.7, §3 "NAT mapping" / "Per-tenant NAT pool").
//! Mappings are per-worker, keyed by both the internal 5-tuple (outbound
//! lookup) and the external 3-tuple (return-traffic lookup), stored in an
//! arena and indexed by `u32`, same pattern as [`crate::session`].
//!
//! Per SPEC_FULL.md §3.1, each tenant's configured port range is
//! partitioned into contiguous per-worker sub-ranges at control-plane
//! configuration time, so `next_port` never needs cross-worker
//! coordination: each worker owns its own [`NatPool`] slice.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::fivetuple::{FiveTuple, Protocol};

/// Return-direction lookup key: external address, port, and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalKey {
    pub addr: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

/// Established-TCP / UDP vs. half-open-TCP expiry, per spec §4.7.
const UDP_OR_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(300);
const HALF_OPEN_TCP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct NatMapping {
    pub internal: FiveTuple,
    pub external_addr: IpAddr,
    pub external_port: u16,
    pub tenant_id: u32,
    pub expire_time: Instant,
}

/// A worker's slice of a tenant's configured external address and port
/// range. `next_port` is the round-robin allocation cursor (spec §3).
pub struct NatPool {
    pub external_addr: IpAddr,
    pub start: u16,
    pub end: u16,
    next_port: u16,
}

impl NatPool {
    pub fn new(external_addr: IpAddr, start: u16, end: u16) -> Self {
        Self { external_addr, start, end, next_port: start }
    }

    /// True for a pool partitioned down to nothing (spec SPEC_FULL.md
    /// §3.1: "a pool with fewer free ports than workers degrades
    /// gracefully").
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    fn advance(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port >= self.end { self.start } else { self.next_port + 1 };
        port
    }
}

pub enum NatError {
    NoPortAvailable,
}

/// Per-worker NAT state: one pool per tenant, plus the forward/reverse
/// mapping arena.
pub struct NatTable {
    pools: HashMap<u32, NatPool>,
    arena: Vec<NatMapping>,
    free_slots: Vec<u32>,
    by_internal: AHashMap<FiveTuple, u32>,
    by_external: AHashMap<ExternalKey, u32>,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            arena: Vec::new(),
            free_slots: Vec::new(),
            by_internal: AHashMap::new(),
            by_external: AHashMap::new(),
        }
    }

    pub fn configure_pool(&mut self, tenant_id: u32, pool: NatPool) {
        self.pools.insert(tenant_id, pool);
    }

    pub fn len(&self) -> usize {
        self.by_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_internal.is_empty()
    }

    pub fn lookup_internal(&self, tuple: &FiveTuple) -> Option<&NatMapping> {
        self.by_internal.get(tuple).map(|&idx| &self.arena[idx as usize])
    }

    /// Return-direction lookup, used to reverse a NAT translation back to
    /// the original internal tuple (spec §4.7: "return-direction packets
    /// are matched on the external 3-tuple and reversed").
    pub fn lookup_external(&self, key: &ExternalKey) -> Option<&NatMapping> {
        self.by_external.get(key).map(|&idx| &self.arena[idx as usize])
    }

    /// Allocates (or returns an existing) mapping for `tuple`. `tenant_id`
    /// selects the pool, falling back to pool `0` when unconfigured (spec
    /// §4.7). `half_open_tcp` picks the shorter TCP expiry.
    pub fn translate(
        &mut self,
        tuple: FiveTuple,
        tenant_id: u32,
        half_open_tcp: bool,
        now: Instant,
    ) -> Result<NatMapping, NatError> {
        if let Some(&idx) = self.by_internal.get(&tuple) {
            return Ok(self.arena[idx as usize]);
        }

        let pool_tenant = if self.pools.contains_key(&tenant_id) { tenant_id } else { 0 };
        let timeout =
            if tuple.protocol == Protocol::Tcp && half_open_tcp { HALF_OPEN_TCP_TIMEOUT } else { UDP_OR_ESTABLISHED_TIMEOUT };

        let (external_addr, external_port) = {
            let pool = self.pools.get_mut(&pool_tenant).ok_or(NatError::NoPortAvailable)?;
            if pool.is_empty() {
                return Err(NatError::NoPortAvailable);
            }
            let span = (pool.end - pool.start) as u32 + 1;
            let mut allocated = None;
            for _ in 0..span {
                let candidate = pool.advance();
                let key = ExternalKey { addr: pool.external_addr, port: candidate, protocol: tuple.protocol };
                let reusable = match self.by_external.get(&key) {
                    None => true,
                    Some(&idx) => now > self.arena[idx as usize].expire_time,
                };
                if reusable {
                    if let Some(&idx) = self.by_external.get(&key) {
                        self.free_mapping(idx);
                    }
                    allocated = Some(candidate);
                    break;
                }
            }
            match allocated {
                Some(port) => (pool.external_addr, port),
                None => return Err(NatError::NoPortAvailable),
            }
        };

        let mapping = NatMapping {
            internal: tuple,
            external_addr,
            external_port,
            tenant_id: pool_tenant,
            expire_time: now + timeout,
        };

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot as usize] = mapping;
                slot
            }
            None => {
                let slot = self.arena.len() as u32;
                self.arena.push(mapping);
                slot
            }
        };

        self.by_internal.insert(tuple, slot);
        self.by_external
            .insert(ExternalKey { addr: external_addr, port: external_port, protocol: tuple.protocol }, slot);

        Ok(mapping)
    }

    /// Refreshes a mapping's expiry on every packet that continues to use
    /// it (spec §4.7 expire-time semantics are re-applied per packet).
    pub fn touch(&mut self, tuple: &FiveTuple, half_open_tcp: bool, now: Instant) {
        if let Some(&idx) = self.by_internal.get(tuple) {
            let timeout = if tuple.protocol == Protocol::Tcp && half_open_tcp {
                HALF_OPEN_TCP_TIMEOUT
            } else {
                UDP_OR_ESTABLISHED_TIMEOUT
            };
            self.arena[idx as usize].expire_time = now + timeout;
        }
    }

    fn free_mapping(&mut self, slot: u32) {
        let mapping = self.arena[slot as usize];
        self.by_internal.remove(&mapping.internal);
        self.by_external.remove(&ExternalKey {
            addr: mapping.external_addr,
            port: mapping.external_port,
            protocol: mapping.internal.protocol,
        });
        self.free_slots.push(slot);
    }

    /// Sweeps expired mappings, bounded to `max_steps` per invocation
    /// (same opportunistic-sweep discipline as [`crate::session::SessionTable::sweep`]).
    pub fn sweep(&mut self, now: Instant, max_steps: usize) -> usize {
        let expired: Vec<u32> = self
            .by_internal
            .values()
            .copied()
            .filter(|&idx| now > self.arena[idx as usize].expire_time)
            .take(max_steps)
            .collect();
        let count = expired.len();
        for idx in expired {
            self.free_mapping(idx);
        }
        count
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(sport: u16) -> FiveTuple {
        FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: sport,
            dst_port: 443,
            protocol: Protocol::Tcp,
        }
    }

    fn pool() -> NatPool {
        NatPool::new("198.51.100.4".parse().unwrap(), 10000, 11000)
    }

    #[test]
    fn first_packet_allocates_from_pool_start() {
        let mut table = NatTable::new();
        table.configure_pool(7, pool());
        let now = Instant::now();
        let mapping = table.translate(tuple(33000), 7, false, now).unwrap();
        assert_eq!(mapping.external_port, 10000);
        assert_eq!(mapping.external_addr, "198.51.100.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn repeated_lookup_of_same_tuple_returns_same_mapping() {
        let mut table = NatTable::new();
        table.configure_pool(7, pool());
        let now = Instant::now();
        let first = table.translate(tuple(33000), 7, false, now).unwrap();
        let second = table.translate(tuple(33000), 7, false, now).unwrap();
        assert_eq!(first.external_port, second.external_port);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unconfigured_tenant_falls_back_to_pool_zero() {
        let mut table = NatTable::new();
        table.configure_pool(0, pool());
        let now = Instant::now();
        let mapping = table.translate(tuple(33000), 99, false, now).unwrap();
        assert_eq!(mapping.tenant_id, 0);
    }

    #[test]
    fn nat_untranslate_round_trip_recovers_internal_tuple() {
        let mut table = NatTable::new();
        table.configure_pool(7, pool());
        let now = Instant::now();
        let mapping = table.translate(tuple(33000), 7, false, now).unwrap();

        let external_key =
            ExternalKey { addr: mapping.external_addr, port: mapping.external_port, protocol: Protocol::Tcp };
        let looked_up = table.lookup_external(&external_key).unwrap();
        assert_eq!(looked_up.internal, tuple(33000));
    }

    #[test]
    fn pool_exhaustion_yields_no_port_available() {
        let mut table = NatTable::new();
        table.configure_pool(7, NatPool::new("198.51.100.4".parse().unwrap(), 10000, 10000));
        let now = Instant::now();
        table.translate(tuple(1), 7, false, now).unwrap();
        let err = table.translate(tuple(2), 7, false, now);
        assert!(matches!(err, Err(NatError::NoPortAvailable)));
    }

    #[test]
    fn expired_port_is_reclaimed_on_wraparound() {
        let mut table = NatTable::new();
        table.configure_pool(7, NatPool::new("198.51.100.4".parse().unwrap(), 10000, 10000));
        let now = Instant::now();
        table.translate(tuple(1), 7, true, now).unwrap(); // half-open TCP: 30s expiry
        let later = now + Duration::from_secs(31);
        let second = table.translate(tuple(2), 7, false, later).unwrap();
        assert_eq!(second.external_port, 10000);
    }

    #[test]
    fn empty_partitioned_slice_always_exhausts() {
        let mut table = NatTable::new();
        table.configure_pool(7, NatPool::new("198.51.100.4".parse().unwrap(), 10001, 10000));
        let now = Instant::now();
        assert!(matches!(table.translate(tuple(1), 7, false, now), Err(NatError::NoPortAvailable)));
    }

    #[test]
    fn sweep_frees_expired_mappings_bounded_by_max_steps() {
        let mut table = NatTable::new();
        table.configure_pool(7, pool());
        let now = Instant::now();
        table.translate(tuple(1), 7, true, now).unwrap();
        table.translate(tuple(2), 7, true, now).unwrap();
        let later = now + Duration::from_secs(31);
        let swept = table.sweep(later, 1);
        assert_eq!(swept, 1);
        assert_eq!(table.len(), 1);
    }
}
