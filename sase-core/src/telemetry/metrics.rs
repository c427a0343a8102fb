//! Aggregate observability surface (spec §5 "shared resource policy", §8
//! "observability surface"). Per-worker, per-cache-line counters live in
//! [`crate::stats`]; this module only owns the OpenTelemetry/Prometheus
//! plumbing that turns a point-in-time sum of those counters into an
//! exported metric. Serving `/metrics` over HTTP is the external
//! logging/metrics sink (spec §1) and is out of scope for this crate.

use std::sync::Arc;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

#[derive(Clone)]
pub struct Metrics {
    pub packets_total: Counter<u64>,
    pub bytes_total: Counter<u64>,

    pub drops_malformed: Counter<u64>,
    pub drops_policy_deny: Counter<u64>,
    pub drops_dlp_critical: Counter<u64>,
    pub drops_ips_drop: Counter<u64>,
    pub drops_nat_exhaust: Counter<u64>,
    pub drops_rate_limit: Counter<u64>,
    pub drops_session_exhaust: Counter<u64>,

    pub sessions_active: UpDownCounter<i64>,
    pub nat_mappings_active: UpDownCounter<i64>,

    pub ips_hits_total: Counter<u64>,
    pub dlp_hits_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: Meter) -> Self {
        Self {
            packets_total: meter
                .u64_counter("sase_packets_total")
                .with_description("Total number of packets processed")
                .build(),
            bytes_total: meter
                .u64_counter("sase_bytes_total")
                .with_description("Total number of bytes processed")
                .build(),

            drops_malformed: meter
                .u64_counter("sase_drops_malformed_total")
                .with_description("Packets dropped for failing to parse")
                .build(),
            drops_policy_deny: meter
                .u64_counter("sase_drops_policy_deny_total")
                .with_description("Packets dropped by policy deny")
                .build(),
            drops_dlp_critical: meter
                .u64_counter("sase_drops_dlp_critical_total")
                .with_description("Packets dropped by a critical DLP category")
                .build(),
            drops_ips_drop: meter
                .u64_counter("sase_drops_ips_drop_total")
                .with_description("Packets dropped by an IPS drop-action signature")
                .build(),
            drops_nat_exhaust: meter
                .u64_counter("sase_drops_nat_exhaust_total")
                .with_description("Packets dropped due to NAT pool exhaustion")
                .build(),
            drops_rate_limit: meter
                .u64_counter("sase_drops_rate_limit_total")
                .with_description("Packets dropped by the QoS rate limiter")
                .build(),
            drops_session_exhaust: meter
                .u64_counter("sase_drops_session_exhaust_total")
                .with_description("Packets dropped due to session table exhaustion")
                .build(),

            sessions_active: meter
                .i64_up_down_counter("sase_sessions_active")
                .with_description("Number of active sessions across all workers")
                .build(),
            nat_mappings_active: meter
                .i64_up_down_counter("sase_nat_mappings_active")
                .with_description("Number of active NAT mappings across all workers")
                .build(),

            ips_hits_total: meter
                .u64_counter("sase_ips_hits_total")
                .with_description("IPS signature hits, labelled by category")
                .build(),
            dlp_hits_total: meter
                .u64_counter("sase_dlp_hits_total")
                .with_description("DLP pattern hits, labelled by category")
                .build(),
        }
    }
}

/// Builds the global meter provider and returns the `Metrics` handle
/// together with the Prometheus `Registry` an external sink scrapes.
pub fn init_metrics() -> Result<(Arc<Metrics>, Registry), Box<dyn std::error::Error + Send + Sync>>
{
    let registry = Registry::default();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;

    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider);

    let meter = global::meter("sase-core");
    let metrics = Arc::new(Metrics::new(meter));

    Ok((metrics, registry))
}
