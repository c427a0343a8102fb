//! The per-worker pipeline driver (spec §2 stage ordering, §9 Design Note
//! "stage graph → tagged next-id", §5 concurrency model). [`WorkerState`]
//! owns everything a worker is allowed to touch on the fast path: its own
//! session/NAT/shaper state, plus `Arc`/`ArcSwap` handles to the read-mostly
//! tables the control plane updates (spec §5: "no worker reads or writes
//! another worker's mutable state on the fast path").

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use crate::app::ClassifierTable;
use crate::buffer::{debug_check_batch_size, PacketBuffer};
use crate::fivetuple::Protocol;
use crate::inspect::{dlp::DlpScanner, ips::IpsScanner};
use crate::metadata::PacketFlags;
use crate::nat::{ExternalKey, NatError, NatTable};
use crate::packet::{self, ParsedPacket, TCP_FLAG_FIN, TCP_FLAG_RST};
use crate::policy::{PolicyAction, SharedPolicyVector};
use crate::qos::ShaperTable;
use crate::session::{Direction, SessionTable};
use crate::stats::{DropReason, WorkerCounters};
use crate::telemetry::Metrics;
use crate::tenant::SharedTenantTable;
use crate::tunnel::TunnelRecord;

/// A closed variant over the fixed pipeline stages (spec §2 / Design Note
/// 9.2: "per-buffer `next` is a small integer. No dynamic dispatch on the
/// fast path."). `Drop` carries the reason so the caller can attribute the
/// right counter without re-deriving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TenantClassify,
    SessionTrack,
    PolicyMatch,
    Ips,
    Dlp,
    AppClassify,
    Nat,
    Qos,
    Encap,
    Output,
    Drop(DropReason),
}

/// Configuration a worker needs that doesn't change per packet: whether DLP
/// runs on every flow regardless of policy (spec §4.3: "next stage is DLP
/// if `action == inspect_dlp` or if DLP is globally enabled"), and how many
/// session/NAT entries the opportunistic sweep processes per batch.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub dlp_globally_enabled: bool,
    pub sweep_steps_per_batch: usize,
    /// Which CPU core the host process should pin this worker to. The core
    /// itself never calls `sched_setaffinity` (spec §1: NIC rings and core
    /// pinning are the dataplane I/O framework's job).
    pub affinity_hint: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { dlp_globally_enabled: false, sweep_steps_per_batch: 256, affinity_hint: None }
    }
}

/// Everything one worker owns or references. Shared tables are behind
/// `Arc`/`ArcSwap`; session, NAT, and shaper state are owned outright and
/// never touched by any other worker.
pub struct WorkerState {
    pub worker_id: usize,
    config: WorkerConfig,

    tenant_table: Arc<SharedTenantTable>,
    policy_vector: Arc<SharedPolicyVector>,
    ips_scanner: Arc<IpsScanner>,
    dlp_scanner: Arc<DlpScanner>,
    app_classifier: Arc<ArcSwap<ClassifierTable>>,
    /// tenant_id -> tunnel (spec §4.9: "mapping from tenant to tunnel
    /// (configurable); absent mapping falls through as `none`").
    tunnels_by_tenant: Arc<ArcSwap<std::collections::HashMap<u32, Arc<TunnelRecord>>>>,

    sessions: SessionTable,
    nat: NatTable,
    shaper: ShaperTable,
    counters: Arc<WorkerCounters>,
    /// Process-wide OpenTelemetry instruments (spec §6 observability
    /// surface). `None` in tests and in any embedding that hasn't called
    /// [`crate::telemetry::init_metrics`].
    metrics: Option<Arc<Metrics>>,
}

impl WorkerState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        config: WorkerConfig,
        tenant_table: Arc<SharedTenantTable>,
        policy_vector: Arc<SharedPolicyVector>,
        ips_scanner: Arc<IpsScanner>,
        dlp_scanner: Arc<DlpScanner>,
        app_classifier: Arc<ArcSwap<ClassifierTable>>,
        tunnels_by_tenant: Arc<ArcSwap<std::collections::HashMap<u32, Arc<TunnelRecord>>>>,
        sessions: SessionTable,
        nat: NatTable,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            worker_id,
            config,
            tenant_table,
            policy_vector,
            ips_scanner,
            dlp_scanner,
            app_classifier,
            tunnels_by_tenant,
            sessions,
            nat,
            shaper: ShaperTable::new(),
            counters,
            metrics: None,
        }
    }

    /// Attaches the process-wide metrics handle. Call once after
    /// construction when [`crate::telemetry::init_metrics`] has been run;
    /// left unset, the worker simply skips the OpenTelemetry updates and
    /// keeps recording into its own [`WorkerCounters`].
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn shaper_mut(&mut self) -> &mut ShaperTable {
        &mut self.shaper
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn counters(&self) -> &WorkerCounters {
        &self.counters
    }

    /// Runs every buffer in `batch` through the full pipeline, returning one
    /// [`Stage`] per input buffer in the same order (spec §8: `|output(B,
    /// S)| == |input(B, S)|` — stages neither duplicate nor lose buffers).
    /// A policy/tenant table snapshot is taken once per batch (spec §5: "a
    /// worker reads the current version at the start of each batch and uses
    /// it for the duration of that batch").
    pub fn process_batch(&mut self, batch: &mut [Box<dyn PacketBuffer>], now: Instant) -> Vec<Stage> {
        debug_check_batch_size(batch.len());
        let tenant_snapshot = self.tenant_table.load_full();
        let policy_snapshot = self.policy_vector.load_full();
        let tunnels_snapshot = self.tunnels_by_tenant.load_full();
        let classifier_snapshot = self.app_classifier.load_full();

        let mut results = Vec::with_capacity(batch.len());
        for buf in batch.iter_mut() {
            let outcome = self.process_one(
                buf.as_mut(),
                &tenant_snapshot,
                &policy_snapshot,
                &tunnels_snapshot,
                &classifier_snapshot,
                now,
            );
            results.push(outcome);
        }
        results
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one(
        &mut self,
        buf: &mut dyn PacketBuffer,
        tenant_table: &crate::tenant::TenantTable,
        policies: &crate::policy::PolicyVector,
        tunnels: &std::collections::HashMap<u32, Arc<TunnelRecord>>,
        classifier: &ClassifierTable,
        now: Instant,
    ) -> Stage {
        let packet_len = buf.length_in_chain() as u64;

        // Stage 1: parse + tenant classify.
        let Ok(parsed) = packet::parse_ethernet_frame(buf.data()) else {
            self.counters.record_drop(DropReason::Malformed);
            if let Some(m) = &self.metrics {
                m.drops_malformed.add(1, &[]);
            }
            return Stage::Drop(DropReason::Malformed);
        };

        let (parsed, assignment) = if let Some(vxlan) = parsed.vxlan {
            let assignment = tenant_table.classify_by_vni(vxlan.vni);
            match packet::parse_ethernet_frame(&buf.data()[vxlan.inner_eth_offset..]) {
                Ok(inner) => (reoffset(inner, vxlan.inner_eth_offset), assignment),
                Err(_) => {
                    self.counters.record_drop(DropReason::Malformed);
                    if let Some(m) = &self.metrics {
                        m.drops_malformed.add(1, &[]);
                    }
                    return Stage::Drop(DropReason::Malformed);
                }
            }
        } else {
            let assignment = tenant_table.classify_by_source(parsed.five_tuple.src_addr);
            (parsed, assignment)
        };

        buf.metadata_mut().tenant_id = assignment.tenant_id;
        buf.metadata_mut().vrf_id = assignment.vrf_id;
        self.counters.record_packet(packet_len);
        if let Some(m) = &self.metrics {
            m.packets_total.add(1, &[]);
            m.bytes_total.add(packet_len, &[]);
        }

        // Stage 2: session tracker.
        let Some(track) = self.sessions.track(parsed.five_tuple, assignment.tenant_id, now) else {
            self.counters.record_drop(DropReason::SessionExhaust);
            if let Some(m) = &self.metrics {
                m.drops_session_exhaust.add(1, &[]);
            }
            return Stage::Drop(DropReason::SessionExhaust);
        };
        buf.metadata_mut().session_idx = track.index;
        if track.is_new {
            self.counters.record_session_created();
            if let Some(m) = &self.metrics {
                m.sessions_active.add(1, &[]);
            }
        }
        match track.direction {
            Direction::Forward => self.sessions.record_forward(track.index, packet_len),
            Direction::Reverse => self.sessions.record_reverse(track.index, packet_len),
        }

        // TCP FIN/RST observed on either direction moves the session toward
        // closure (spec §4.2); the closing grace period is reclaimed by the
        // opportunistic sweep, not here.
        if let Some(flags) = parsed.tcp_flags {
            if flags & (TCP_FLAG_FIN | TCP_FLAG_RST) != 0 {
                self.sessions.mark_closing(track.index, now);
            }
        }

        // Stage 3: policy match (ACL-bypass VNIs skip straight past it, spec §4.1).
        let policy_match = if assignment.acl_bypass {
            None
        } else {
            policies.match_tuple(&parsed.five_tuple, assignment.tenant_id)
        };
        let (action, qos_class, log_enabled, rate_limit_kbps, policy_id) = match policy_match {
            Some(m) => (m.action, m.qos_class, m.log_enabled, m.rate_limit_kbps, m.policy_id),
            None => (PolicyAction::Allow, buf.metadata().qos_class, false, 0, 0),
        };
        buf.metadata_mut().policy_id = policy_id;
        buf.metadata_mut().qos_class = qos_class;
        let _ = rate_limit_kbps; // policy-level rate limits feed qos::ShaperTable::configure out of band

        if action == PolicyAction::Deny {
            self.counters.record_drop(DropReason::PolicyDeny);
            if let Some(m) = &self.metrics {
                m.drops_policy_deny.add(1, &[]);
            }
            return Stage::Drop(DropReason::PolicyDeny);
        }

        let payload = parsed.payload(buf.data()).to_vec();

        // IPS runs unconditionally (spec §4.4); DLP only runs when a policy
        // explicitly asked for it or the worker has it globally enabled
        // (spec §4.3: "next stage is DLP if action == inspect_dlp or if DLP
        // is globally enabled").
        if let Some(hit) = self.ips_scanner.scan(&payload) {
            buf.metadata_mut().flags |= PacketFlags::IPS_INSPECTED;
            if let Some(m) = &self.metrics {
                m.ips_hits_total.add(1, &[opentelemetry::KeyValue::new("category", format!("{:?}", hit.category))]);
            }
            // Only `Drop` blocks the packet here; `Reject` passes through
            // flagged, same as `Alert` — matching node_security_inspect.c,
            // which also only branches to its drop next-node on
            // `IPS_ACTION_DROP`.
            if hit.action == crate::inspect::Action::Drop {
                self.counters.record_drop(DropReason::IpsDrop);
                if let Some(m) = &self.metrics {
                    m.drops_ips_drop.add(1, &[]);
                }
                return Stage::Drop(DropReason::IpsDrop);
            }
        }

        let run_dlp = action == PolicyAction::InspectDlp || self.config.dlp_globally_enabled;
        if run_dlp {
            if let Some((hit, critical)) = self.dlp_scanner.scan(&payload) {
                buf.metadata_mut().flags |= PacketFlags::DLP_INSPECTED;
                if let Some(m) = &self.metrics {
                    m.dlp_hits_total.add(1, &[opentelemetry::KeyValue::new("category", format!("{:?}", hit.category))]);
                }
                if critical {
                    self.counters.record_drop(DropReason::DlpCritical);
                    if let Some(m) = &self.metrics {
                        m.drops_dlp_critical.add(1, &[]);
                    }
                    return Stage::Drop(DropReason::DlpCritical);
                }
            }
        }

        // Stage: application classifier.
        let (app_id, classified_qos) = classifier.classify(&parsed.five_tuple, &payload);
        buf.metadata_mut().app_id = app_id.code();
        if policy_match.is_none() {
            buf.metadata_mut().qos_class = classified_qos;
        }

        // Stage: NAT44 (IPv4 only, per spec §9 Open Question). Return-
        // direction packets arrive with dst = the external 3-tuple, so that
        // lookup is tried first; only a miss falls through to the forward
        // (outbound) allocate-or-reuse path (spec §4.7: "return-direction
        // packets are matched on the external 3-tuple and reversed").
        if matches!(parsed.ip_version, packet::IpVersion::V4) {
            let half_open = parsed.five_tuple.protocol == Protocol::Tcp
                && self.sessions.get(track.index).map(|s| s.state) != Some(crate::session::SessionState::Established);
            let external_key = ExternalKey {
                addr: parsed.five_tuple.dst_addr,
                port: parsed.five_tuple.dst_port,
                protocol: parsed.five_tuple.protocol,
            };
            if let Some(mapping) = self.nat.lookup_external(&external_key).copied() {
                let internal = mapping.internal;
                if let IpAddr::V4(internal_addr) = internal.src_addr {
                    packet::rewrite_ipv4_nat_destination(buf.data_mut(), &parsed, internal_addr, internal.src_port);
                }
                self.nat.touch(&internal, half_open, now);
            } else {
                let mapping_existed = self.nat.lookup_internal(&parsed.five_tuple).is_some();
                match self.nat.translate(parsed.five_tuple, assignment.tenant_id, half_open, now) {
                    Ok(mapping) => {
                        if let IpAddr::V4(new_addr) = mapping.external_addr {
                            packet::rewrite_ipv4_nat_source(buf.data_mut(), &parsed, new_addr, mapping.external_port);
                        }
                        self.nat.touch(&parsed.five_tuple, half_open, now);
                        if !mapping_existed {
                            if let Some(m) = &self.metrics {
                                m.nat_mappings_active.add(1, &[]);
                            }
                        }
                    }
                    Err(NatError::NoPortAvailable) => {
                        self.counters.record_drop(DropReason::NatExhaust);
                        if let Some(m) = &self.metrics {
                            m.drops_nat_exhaust.add(1, &[]);
                        }
                        return Stage::Drop(DropReason::NatExhaust);
                    }
                }
            }
        }

        // Stage: QoS marker / shaper. DSCP marking runs for both IP
        // versions (spec §4.8's "DSCP byte (upper six bits of ToS / traffic
        // class)" covers IPv6's traffic-class field too); only the NAT
        // stage above is IPv4-only.
        let qos_class = buf.metadata().qos_class;
        match parsed.ip_version {
            packet::IpVersion::V4 => packet::mark_dscp_ipv4(buf.data_mut(), &parsed, qos_class),
            packet::IpVersion::V6 => packet::mark_dscp_ipv6(buf.data_mut(), &parsed, qos_class),
        }
        if !self.shaper.admit(assignment.tenant_id, qos_class, packet_len, now) {
            buf.metadata_mut().flags |= PacketFlags::RATE_LIMITED;
            self.counters.record_drop(DropReason::RateLimit);
            if let Some(m) = &self.metrics {
                m.drops_rate_limit.add(1, &[]);
            }
            return Stage::Drop(DropReason::RateLimit);
        }

        // Stage: encapsulator.
        if let Some(tunnel) = tunnels.get(&assignment.tenant_id) {
            tunnel.encapsulate(buf);
            buf.metadata_mut().flags |= PacketFlags::ENCRYPTED;
        }

        if log_enabled {
            buf.metadata_mut().flags |= PacketFlags::LOGGED;
        }

        Stage::Output
    }

    /// Opportunistic expiry sweep, run between batches (spec §5: "the
    /// background expiry sweep... runs on the worker's own thread between
    /// batches — a bounded step of at most K entries per invocation").
    pub fn sweep(&mut self, now: Instant) {
        let sessions_reclaimed = self.sessions.sweep(now, self.config.sweep_steps_per_batch);
        let mappings_reclaimed = self.nat.sweep(now, self.config.sweep_steps_per_batch);
        if let Some(m) = &self.metrics {
            if sessions_reclaimed > 0 {
                m.sessions_active.add(-(sessions_reclaimed as i64), &[]);
            }
            if mappings_reclaimed > 0 {
                m.nat_mappings_active.add(-(mappings_reclaimed as i64), &[]);
            }
        }
    }
}

/// Rebuilds a [`ParsedPacket`] with every offset shifted by `base`, used
/// after parsing the inner frame of a VXLAN carrier (the inner parse is
/// done on a sub-slice starting at `base`, so its offsets are relative to
/// that sub-slice until shifted back).
fn reoffset(inner: ParsedPacket, base: usize) -> ParsedPacket {
    ParsedPacket {
        ip_header_offset: inner.ip_header_offset + base,
        l4_offset: inner.l4_offset + base,
        payload_offset: inner.payload_offset + base,
        ..inner
    }
}
