#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use clap::{Parser, Subcommand};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, Linktype, PcapBlockOwned, PcapError};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info, warn};

use sase_core::app::ClassifierTable;
use sase_core::buffer::{PacketBuffer, VecPacketBuffer, NOMINAL_BATCH_SIZE};
use sase_core::config::{self, Config};
use sase_core::control::{ControlPlane, NatPoolConfig};
use sase_core::inspect::{dlp::DlpScanner, ips::IpsScanner, ScannerConfig};
use sase_core::nat::{NatPool, NatTable};
use sase_core::policy::{new_shared as new_shared_policy, PolicyVector};
use sase_core::session::SessionTable;
use sase_core::stats::WorkerCounters;
use sase_core::telemetry::{self, Metrics};
use sase_core::tenant::{new_shared as new_shared_tenant, TenantTable};
use sase_core::tunnel::TunnelRecord;
use sase_core::worker::{Stage, WorkerConfig, WorkerState};

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenSASE data-plane pipeline")]
struct Cli {
    /// Path to the control-plane configuration TOML file.
    #[arg(short, long, value_name = "FILE", default_value = "config/dataplane.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replays a libpcap capture through the worker pool and prints a
    /// per-worker tally once the capture is exhausted. Not a production
    /// ingress path — the NIC ring/XDP framework that feeds real batches to
    /// [`WorkerState::process_batch`] lives outside this crate (spec §1).
    Replay {
        /// Path to a legacy (non pcap-ng) capture file.
        #[arg(value_name = "PCAP")]
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match config::load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = telemetry::init_tracing_with_otel(cfg.telemetry.log_filter.clone(), false, "warn".to_string()) {
        eprintln!("failed to initialize tracing: {err}");
        return ExitCode::FAILURE;
    }

    let (metrics, registry) = match telemetry::init_metrics() {
        Ok(pair) => pair,
        Err(err) => {
            error!(%err, "failed to initialize metrics");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Replay { input } => replay(&cfg, &input, metrics),
    };

    log_metrics_snapshot(&registry);
    telemetry::shutdown_tracing();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "replay failed");
            ExitCode::FAILURE
        }
    }
}

/// Logs a final text-format dump of every Prometheus metric gathered from
/// `registry` (spec §6 observability surface). Serving `/metrics` over HTTP
/// is the external scrape target's job, not this crate's (spec §1); this
/// is the closest a one-shot CLI tool gets to that without one.
fn log_metrics_snapshot(registry: &Registry) {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_ok() {
        if let Ok(text) = String::from_utf8(buf) {
            info!("{text}");
        }
    }
}

/// A worker pool built from one [`Config`], plus the [`ControlPlane`] handle
/// sharing the same tables a long-running process would keep around for
/// later reconfiguration (spec §6). `replay` only calls it once at startup.
struct Pool {
    control: ControlPlane,
    workers: Vec<WorkerState>,
}

fn build_pool(cfg: &Config, metrics: Arc<Metrics>) -> Result<Pool, Box<dyn std::error::Error>> {
    let mut tenant_table = TenantTable::new();
    for entry in &cfg.tenant_prefixes {
        tenant_table.install_prefix(entry.prefix, config::tenant_assignment_from_prefix(entry));
    }
    for entry in &cfg.tenant_vnis {
        tenant_table.install_vni(entry.vni, config::tenant_assignment_from_vni(entry));
    }
    let tenant_table = Arc::new(new_shared_tenant(tenant_table));

    let mut policy_records = Vec::with_capacity(cfg.policies.len());
    for entry in &cfg.policies {
        policy_records.push(config::policy_record_from_config(entry)?);
    }
    let policy_vector = Arc::new(new_shared_policy(PolicyVector::new(policy_records)));

    let mut classifier = ClassifierTable::new();
    for prefix in &cfg.collab_prefixes {
        classifier.install_collab_prefix(*prefix);
    }
    let classifier = Arc::new(ArcSwap::new(Arc::new(classifier)));

    let ips_scanner = Arc::new(IpsScanner::new(ScannerConfig { use_native: cfg.inspection.use_native }, vec![]));
    let dlp_scanner = Arc::new(DlpScanner::new(ScannerConfig { use_native: cfg.inspection.use_native }, vec![]));

    let mut tunnels_by_tenant = HashMap::new();
    for entry in &cfg.tunnels {
        let tunnel_type = config::parse_tunnel_type(&entry.tunnel_type)?;
        let mut record = TunnelRecord::new(tunnel_type, entry.outer_src, entry.outer_dst, entry.output_interface_id);
        record.receiver_index = entry.receiver_index;
        record.vni = entry.vni;
        tunnels_by_tenant.insert(entry.tenant_id, Arc::new(record));
    }
    let tunnels_by_tenant = Arc::new(ArcSwap::new(Arc::new(tunnels_by_tenant)));

    let control = ControlPlane::new(
        cfg.worker.count,
        tenant_table.clone(),
        policy_vector.clone(),
        tunnels_by_tenant.clone(),
        ips_scanner.clone(),
        dlp_scanner.clone(),
        classifier.clone(),
    );

    // Partition every configured tenant's NAT range into per-worker slices
    // up front (SPEC_FULL.md §3.1) before any worker is constructed.
    let mut pools_by_worker: Vec<Vec<(u32, NatPool)>> = (0..cfg.worker.count).map(|_| Vec::new()).collect();
    for pool_cfg in &cfg.nat_pools {
        let pools = control.configure_nat_pool(NatPoolConfig {
            external_addr: pool_cfg.external_addr,
            start_port: pool_cfg.start_port,
            end_port: pool_cfg.end_port,
        })?;
        for (idx, pool) in pools.into_iter().enumerate() {
            pools_by_worker[idx].push((pool_cfg.tenant_id, pool));
        }
    }

    let session_timeout = Duration::from_secs(cfg.worker.session_timeout_secs);
    let workers = pools_by_worker
        .into_iter()
        .enumerate()
        .map(|(idx, tenant_pools)| {
            let mut nat = NatTable::new();
            for (tenant_id, pool) in tenant_pools {
                nat.configure_pool(tenant_id, pool);
            }
            WorkerState::new(
                idx,
                WorkerConfig {
                    dlp_globally_enabled: cfg.worker.dlp_globally_enabled,
                    sweep_steps_per_batch: cfg.worker.sweep_steps_per_batch,
                    affinity_hint: None,
                },
                tenant_table.clone(),
                policy_vector.clone(),
                ips_scanner.clone(),
                dlp_scanner.clone(),
                classifier.clone(),
                tunnels_by_tenant.clone(),
                SessionTable::new(cfg.worker.session_capacity, session_timeout),
                nat,
                Arc::new(WorkerCounters::new()),
            )
            .with_metrics(metrics.clone())
        })
        .collect();

    Ok(Pool { control, workers })
}

/// Reads `path` as a legacy pcap capture and feeds every Ethernet frame
/// through the worker pool in [`NOMINAL_BATCH_SIZE`]-sized batches,
/// round-robin across workers by batch index.
fn replay(cfg: &Config, path: &std::path::Path, metrics: Arc<Metrics>) -> Result<(), Box<dyn std::error::Error>> {
    let pool = build_pool(cfg, metrics)?;
    let _control = pool.control; // kept alive for the replay's duration; reconfiguration is out of scope here
    let mut workers = pool.workers;

    let file = File::open(path)?;
    let mut reader = create_reader(65536, file).map_err(|e| format!("failed to open pcap reader: {e:?}"))?;

    let mut linktype = Linktype::ETHERNET;
    let mut batch: Vec<Box<dyn PacketBuffer>> = Vec::with_capacity(NOMINAL_BATCH_SIZE);
    let mut worker_cursor = 0usize;
    let mut buffer_id = 0u64;
    let mut total_packets = 0u64;
    let mut skipped_non_ethernet = 0u64;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(hdr) => linktype = hdr.network,
                    PcapBlockOwned::Legacy(b) => {
                        if linktype == Linktype::ETHERNET {
                            buffer_id += 1;
                            batch.push(Box::new(VecPacketBuffer::new(buffer_id, b.data.to_vec())));
                            total_packets += 1;
                            if batch.len() == NOMINAL_BATCH_SIZE {
                                drain_batch(&mut workers, &mut worker_cursor, &mut batch);
                            }
                        } else {
                            skipped_non_ethernet += 1;
                        }
                    }
                    PcapBlockOwned::NG(_) => {
                        warn!("pcap-ng blocks are not supported by replay, skipping");
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => reader.refill().map_err(|e| format!("{e:?}"))?,
            Err(e) => return Err(format!("error reading capture: {e:?}").into()),
        }
    }
    if !batch.is_empty() {
        drain_batch(&mut workers, &mut worker_cursor, &mut batch);
    }

    if skipped_non_ethernet > 0 {
        warn!(skipped_non_ethernet, "capture linktype is not Ethernet for some blocks; those packets were skipped");
    }

    info!(total_packets, workers = workers.len(), "replay complete");
    for worker in &workers {
        let snap = worker.counters().snapshot();
        info!(
            worker_id = worker.worker_id,
            packets = snap.packets_processed,
            bytes = snap.bytes_processed,
            sessions_created = snap.sessions_created,
            "worker summary"
        );
    }
    Ok(())
}

fn drain_batch(workers: &mut [WorkerState], cursor: &mut usize, batch: &mut Vec<Box<dyn PacketBuffer>>) {
    let idx = *cursor % workers.len();
    let worker = &mut workers[idx];
    let now = Instant::now();
    let stages = worker.process_batch(batch, now);
    worker.sweep(now);
    let dropped = stages.iter().filter(|s| matches!(s, Stage::Drop(_))).count();
    info!(worker_id = worker.worker_id, batch_len = stages.len(), dropped, "batch processed");
    *cursor += 1;
    batch.clear();
}
