//! Per-worker session tracking (spec §4.2, §3 "Session record"). Owned
//! entirely by one worker for its lifetime — the table type here is never
//! shared across threads (spec §5: "no worker reads or writes another
//! worker's mutable state on the fast path").

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::fivetuple::FiveTuple;
use crate::metadata::QosClass;

/// TCP FIN/RST on either direction moves a session to `closing`; a short
/// grace period after that makes it `closed` and eligible for eviction
/// (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Established,
    Closing,
    Closed,
}

/// Grace period between `Closing` and eviction eligibility.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

/// A tracked flow. Arena-indexed (spec §9 "pointer graphs → arena +
/// index"): the hash table below maps a 5-tuple to a `u32` slot in
/// `arena`, never to a pointer, so eviction is a swap-remove plus a
/// stale-index no-op on the next lookup miss.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub key: FiveTuple,
    pub state: SessionState,
    pub tenant_id: u32,
    pub policy_id: u32,
    pub qos_class: QosClass,
    pub forward_packets: u64,
    pub forward_bytes: u64,
    pub reverse_packets: u64,
    pub reverse_bytes: u64,
    pub last_active: Instant,
    closing_since: Option<Instant>,
}

impl SessionRecord {
    fn new(key: FiveTuple, tenant_id: u32, now: Instant) -> Self {
        Self {
            key,
            state: SessionState::New,
            tenant_id,
            policy_id: 0,
            qos_class: QosClass::Default,
            forward_packets: 0,
            forward_bytes: 0,
            reverse_packets: 0,
            reverse_bytes: 0,
            last_active: now,
            closing_since: None,
        }
    }

    /// Whether this session has sat in `Closed` long enough to be swept.
    fn evictable(&self, now: Instant, session_timeout: Duration) -> bool {
        match self.state {
            SessionState::Closed => true,
            _ => now.saturating_duration_since(self.last_active) > session_timeout,
        }
    }
}

/// Which direction a packet observed against its session's forward key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One row of a [`SessionTable::dump`] (spec §6 observability surface).
#[derive(Debug, Clone, Copy)]
pub struct SessionDumpEntry {
    pub key: FiveTuple,
    pub state: SessionState,
    pub tenant_id: u32,
    pub forward_packets: u64,
    pub forward_bytes: u64,
    pub reverse_packets: u64,
    pub reverse_bytes: u64,
}

/// Outcome of [`SessionTable::track`].
pub struct TrackResult {
    pub index: u32,
    pub direction: Direction,
    pub is_new: bool,
}

/// Per-worker session hash table. Forward and reverse keys are both
/// inserted at creation time (spec §9 "reverse-direction session
/// identification") so a reply packet resolves to the same arena slot
/// without a second allocation.
pub struct SessionTable {
    arena: Vec<SessionRecord>,
    free_slots: Vec<u32>,
    index: AHashMap<FiveTuple, u32>,
    capacity: usize,
    session_timeout: Duration,
}

impl SessionTable {
    pub fn new(capacity: usize, session_timeout: Duration) -> Self {
        Self {
            arena: Vec::with_capacity(capacity),
            free_slots: Vec::new(),
            index: AHashMap::with_capacity(capacity),
            capacity,
            session_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len() / 2 // forward + reverse keys both point at one slot
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, slot: u32) -> Option<&SessionRecord> {
        self.arena.get(slot as usize)
    }

    /// Dumps up to `limit` live sessions for the control plane's
    /// observability surface (spec §6: "a session table dump producing,
    /// for up to a caller-specified limit, each session's 5-tuple, state,
    /// tenant, counters"). Iterates the forward-key index entries only, so
    /// each live session appears exactly once regardless of the reverse
    /// key also pointing at the same slot.
    pub fn dump(&self, limit: usize) -> Vec<SessionDumpEntry> {
        self.index
            .iter()
            .filter_map(|(key, &slot)| {
                let record = self.arena.get(slot as usize)?;
                (record.key == *key).then(|| SessionDumpEntry {
                    key: record.key,
                    state: record.state,
                    tenant_id: record.tenant_id,
                    forward_packets: record.forward_packets,
                    forward_bytes: record.forward_bytes,
                    reverse_packets: record.reverse_packets,
                    reverse_bytes: record.reverse_bytes,
                })
            })
            .take(limit)
            .collect()
    }

    /// Looks up `key`, creating a session on miss. Returns the arena slot
    /// and whether `key` hit the session's forward or reverse entry, which
    /// the caller uses to attribute the packet's bytes to the right
    /// counters and to detect the `New` → `Established` transition (spec
    /// §4.2: "established on any observed reverse-direction traffic").
    pub fn track(&mut self, key: FiveTuple, tenant_id: u32, now: Instant) -> Option<TrackResult> {
        if let Some(&slot) = self.index.get(&key) {
            let record = &mut self.arena[slot as usize];
            let direction = if record.key == key {
                Direction::Forward
            } else {
                Direction::Reverse
            };
            if direction == Direction::Reverse && record.state == SessionState::New {
                record.state = SessionState::Established;
            }
            record.last_active = now;
            return Some(TrackResult {
                index: slot,
                direction,
                is_new: false,
            });
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot as usize] = SessionRecord::new(key, tenant_id, now);
                slot
            }
            None => {
                if self.arena.len() >= self.capacity && !self.evict_one(now) {
                    return None;
                }
                if self.arena.len() >= self.capacity {
                    return None;
                }
                let slot = self.arena.len() as u32;
                self.arena.push(SessionRecord::new(key, tenant_id, now));
                slot
            }
        };

        self.index.insert(key, slot);
        self.index.insert(key.reversed(), slot);

        Some(TrackResult {
            index: slot,
            direction: Direction::Forward,
            is_new: true,
        })
    }

    /// Records TCP FIN/RST observation, moving the session toward closure.
    pub fn mark_closing(&mut self, slot: u32, now: Instant) {
        if let Some(record) = self.arena.get_mut(slot as usize) {
            record.state = SessionState::Closing;
            record.closing_since = Some(now);
        }
    }

    /// Promotes sessions that have sat in `Closing` past the grace period.
    pub fn advance_closing(&mut self, now: Instant) {
        for record in &mut self.arena {
            if record.state == SessionState::Closing {
                if let Some(since) = record.closing_since {
                    if now.saturating_duration_since(since) > CLOSE_GRACE {
                        record.state = SessionState::Closed;
                    }
                }
            }
        }
    }

    pub fn record_forward(&mut self, slot: u32, bytes: u64) {
        if let Some(record) = self.arena.get_mut(slot as usize) {
            record.forward_packets += 1;
            record.forward_bytes += bytes;
        }
    }

    pub fn record_reverse(&mut self, slot: u32, bytes: u64) {
        if let Some(record) = self.arena.get_mut(slot as usize) {
            record.reverse_packets += 1;
            record.reverse_bytes += bytes;
        }
    }

    /// The live slots, keyed by their forward entry only (same filter
    /// [`SessionTable::dump`] uses) so a freed slot that hasn't been
    /// reused yet is never reconsidered by eviction (it's no longer in
    /// `index`, only the now-stale data lingers in `arena` until reuse).
    fn live_slots(&self) -> impl Iterator<Item = (u32, &SessionRecord)> {
        self.index.iter().filter_map(|(key, &slot)| {
            let record = self.arena.get(slot as usize)?;
            (record.key == *key).then_some((slot, record))
        })
    }

    /// Evicts the oldest session by `last_active`, in LRU order (spec
    /// §4.2: "the oldest sessions (by `last_active`) are evicted in LRU
    /// order"). Returns whether a slot was freed.
    fn evict_one(&mut self, now: Instant) -> bool {
        let oldest = self
            .live_slots()
            .filter(|(_, r)| r.evictable(now, self.session_timeout))
            .min_by_key(|(_, r)| r.last_active)
            .map(|(slot, _)| slot);

        let Some(slot) = oldest else {
            return false;
        };
        let key = self.arena[slot as usize].key;
        self.index.remove(&key);
        self.index.remove(&key.reversed());
        self.free_slots.push(slot);
        true
    }

    /// Opportunistic expiry sweep, bounded to `max_steps` entries per call
    /// (spec §5: "a bounded step of at most K entries per invocation").
    pub fn sweep(&mut self, now: Instant, max_steps: usize) -> usize {
        self.advance_closing(now);
        let mut swept = 0;
        let candidates: Vec<u32> = self
            .live_slots()
            .filter(|(_, r)| r.evictable(now, self.session_timeout))
            .take(max_steps)
            .map(|(slot, _)| slot)
            .collect();
        for slot in candidates {
            let key = self.arena[slot as usize].key;
            self.index.remove(&key);
            self.index.remove(&key.reversed());
            self.free_slots.push(slot);
            swept += 1;
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fivetuple::Protocol;

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: 33000,
            dst_port: 443,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn first_packet_creates_a_new_session() {
        let mut table = SessionTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        let result = table.track(tuple(), 7, now).unwrap();
        assert!(result.is_new);
        assert_eq!(result.direction, Direction::Forward);
        assert_eq!(table.get(result.index).unwrap().state, SessionState::New);
    }

    #[test]
    fn reverse_traffic_transitions_to_established() {
        let mut table = SessionTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        let fwd = table.track(tuple(), 7, now).unwrap();
        let rev = table.track(tuple().reversed(), 7, now).unwrap();
        assert_eq!(rev.index, fwd.index);
        assert_eq!(rev.direction, Direction::Reverse);
        assert_eq!(table.get(fwd.index).unwrap().state, SessionState::Established);
    }

    #[test]
    fn session_table_full_returns_none_when_no_eviction_candidate() {
        let mut table = SessionTable::new(1, Duration::from_secs(60));
        let now = Instant::now();
        table.track(tuple(), 7, now).unwrap();
        let mut other = tuple();
        other.src_port = 33001;
        assert!(table.track(other, 7, now).is_none());
    }

    #[test]
    fn len_counts_sessions_not_index_entries() {
        let mut table = SessionTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        table.track(tuple(), 7, now).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fin_moves_session_to_closing_and_then_closed_after_grace() {
        let mut table = SessionTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        let result = table.track(tuple(), 7, now).unwrap();
        table.mark_closing(result.index, now);
        assert_eq!(table.get(result.index).unwrap().state, SessionState::Closing);

        table.advance_closing(now + Duration::from_secs(1));
        assert_eq!(table.get(result.index).unwrap().state, SessionState::Closing);

        table.advance_closing(now + CLOSE_GRACE + Duration::from_secs(1));
        assert_eq!(table.get(result.index).unwrap().state, SessionState::Closed);
    }

    #[test]
    fn repeated_sweeps_never_free_the_same_slot_twice() {
        // A zero-second timeout makes every session evictable on the very
        // next sweep; without the live-slot filter, a slot already freed
        // by one sweep call would be evictable again from stale arena
        // data and get pushed onto `free_slots` a second time.
        let mut table = SessionTable::new(4, Duration::from_secs(0));
        let now = Instant::now();
        table.track(tuple(), 7, now).unwrap();
        let later = now + Duration::from_secs(1);

        assert_eq!(table.sweep(later, 4), 1);
        assert_eq!(table.sweep(later, 4), 0);

        let mut other_a = tuple();
        other_a.src_port = 1;
        let mut other_b = tuple();
        other_b.src_port = 2;
        let slot_a = table.track(other_a, 7, later).unwrap().index;
        let slot_b = table.track(other_b, 7, later).unwrap().index;
        assert_ne!(slot_a, slot_b, "a double-freed slot would be handed out to two different sessions");
    }

    #[test]
    fn dump_lists_each_live_session_exactly_once() {
        let mut table = SessionTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        let a = table.track(tuple(), 7, now).unwrap();
        let mut other = tuple();
        other.src_port = 33001;
        table.track(other, 9, now).unwrap();

        let rows = table.dump(10);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.tenant_id == 7 && r.key == tuple()));
        assert!(rows.iter().any(|r| r.tenant_id == 9));

        let limited = table.dump(1);
        assert_eq!(limited.len(), 1);
        let _ = a;
    }
}
