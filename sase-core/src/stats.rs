//! Per-worker observability counters (spec §5 "shared resource policy", §8
//! "observability surface"). Each worker owns one [`WorkerCounters`] and
//! only ever touches its own; aggregation sums across workers on read, so
//! no worker ever contends on another's cache line (spec §5: "writes to
//! shared statistics arrays go into a per-worker-per-cache-line slot;
//! readers compute sums").

use std::sync::atomic::{AtomicU64, Ordering};

/// A drop reason, one per spec §7 error kind that results in a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Malformed,
    PolicyDeny,
    DlpCritical,
    IpsDrop,
    NatExhaust,
    SessionExhaust,
    RateLimit,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::Malformed,
        DropReason::PolicyDeny,
        DropReason::DlpCritical,
        DropReason::IpsDrop,
        DropReason::NatExhaust,
        DropReason::SessionExhaust,
        DropReason::RateLimit,
    ];

    fn index(self) -> usize {
        match self {
            DropReason::Malformed => 0,
            DropReason::PolicyDeny => 1,
            DropReason::DlpCritical => 2,
            DropReason::IpsDrop => 3,
            DropReason::NatExhaust => 4,
            DropReason::SessionExhaust => 5,
            DropReason::RateLimit => 6,
        }
    }
}

const DROP_REASON_COUNT: usize = 7;

/// One worker's counters, cache-line aligned so that neighbouring workers'
/// `WorkerCounters` never false-share a line even when packed into a `Vec`.
#[repr(align(64))]
pub struct WorkerCounters {
    packets_processed: AtomicU64,
    bytes_processed: AtomicU64,
    sessions_created: AtomicU64,
    drops: [AtomicU64; DROP_REASON_COUNT],
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self {
            packets_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            drops: Default::default(),
        }
    }

    pub fn record_packet(&self, bytes: u64) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut drops = [0u64; DROP_REASON_COUNT];
        for (i, d) in self.drops.iter().enumerate() {
            drops[i] = d.load(Ordering::Relaxed);
        }
        CounterSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            drops,
        }
    }
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub sessions_created: u64,
    drops: [u64; DROP_REASON_COUNT],
}

impl CounterSnapshot {
    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()]
    }

    fn add(&mut self, other: &CounterSnapshot) {
        self.packets_processed += other.packets_processed;
        self.bytes_processed += other.bytes_processed;
        self.sessions_created += other.sessions_created;
        for i in 0..DROP_REASON_COUNT {
            self.drops[i] += other.drops[i];
        }
    }
}

/// One slot per configured worker. Readers (the observability surface)
/// call [`AggregateCounters::snapshot`] to sum every worker's counters;
/// nothing is ever locked.
pub struct AggregateCounters {
    workers: Vec<WorkerCounters>,
}

impl AggregateCounters {
    pub fn new(worker_count: usize) -> Self {
        let mut workers = Vec::with_capacity(worker_count);
        workers.resize_with(worker_count, WorkerCounters::new);
        Self { workers }
    }

    pub fn worker(&self, worker_id: usize) -> &WorkerCounters {
        &self.workers[worker_id]
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut total = CounterSnapshot::default();
        for w in &self.workers {
            total.add(&w.snapshot());
        }
        total
    }
}
