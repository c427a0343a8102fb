//! Control-plane configuration (spec §1.1 "startup configuration"). A flat
//! `serde`-derived tree loaded from TOML, the same pattern the reverse-proxy
//! ancestor of this crate used for its own config file: one `Config` struct,
//! `#[serde(default)]` on anything optional, and a `load_from_path` free
//! function wrapping `toml::from_str`. [`validate_config`] then cross-checks
//! references (a policy naming a tenant that was never assigned a prefix or
//! VNI, a NAT pool or tunnel naming the same) before anything is installed
//! against a running [`crate::control::ControlPlane`].

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::fivetuple::Protocol;
use crate::metadata::QosClass;
use crate::policy::{PolicyAction, PolicyRecord, PortRange};
use crate::tenant::TenantAssignment;
use crate::tunnel::TunnelType;

fn default_session_capacity() -> usize {
    1_000_000
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_sweep_steps_per_batch() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_sweep_steps_per_batch")]
    pub sweep_steps_per_batch: usize,
    #[serde(default)]
    pub dlp_globally_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantPrefixConfig {
    pub prefix: IpNet,
    pub tenant_id: u32,
    #[serde(default)]
    pub vrf_id: u32,
    #[serde(default)]
    pub acl_bypass: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantVniConfig {
    pub vni: u32,
    pub tenant_id: u32,
    #[serde(default)]
    pub vrf_id: u32,
    #[serde(default)]
    pub acl_bypass: bool,
}

/// One line of the policy vector, in the string-keyed form a TOML file can
/// express; [`policy_record_from_config`] resolves `action`/`protocol`/
/// `qos_class` against the enums the pipeline actually matches on.
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    pub policy_id: u32,
    pub priority: u32,
    #[serde(default)]
    pub tenant_id: u32,
    #[serde(default)]
    pub src_prefix: Option<IpNet>,
    #[serde(default)]
    pub dst_prefix: Option<IpNet>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub src_port_start: u16,
    #[serde(default)]
    pub src_port_end: u16,
    #[serde(default)]
    pub dst_port_start: u16,
    #[serde(default)]
    pub dst_port_end: u16,
    pub action: String,
    #[serde(default)]
    pub qos_class: String,
    #[serde(default)]
    pub log_enabled: bool,
    #[serde(default)]
    pub rate_limit_kbps: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NatPoolConfigEntry {
    pub tenant_id: u32,
    pub external_addr: Ipv4Addr,
    pub start_port: u16,
    pub end_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfigEntry {
    pub tenant_id: u32,
    pub tunnel_type: String,
    pub outer_src: Ipv4Addr,
    pub outer_dst: Ipv4Addr,
    #[serde(default)]
    pub output_interface_id: u32,
    #[serde(default)]
    pub receiver_index: u32,
    #[serde(default)]
    pub vni: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InspectionSettings {
    #[serde(default)]
    pub use_native: bool,
    #[serde(default)]
    pub ips_signature_path: Option<String>,
    #[serde(default)]
    pub dlp_signature_path: Option<String>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub prometheus_listen: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { log_filter: default_log_filter(), prometheus_listen: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub worker: WorkerSettings,
    #[serde(default)]
    pub tenant_prefixes: Vec<TenantPrefixConfig>,
    #[serde(default)]
    pub tenant_vnis: Vec<TenantVniConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub nat_pools: Vec<NatPoolConfigEntry>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfigEntry>,
    #[serde(default)]
    pub collab_prefixes: Vec<IpNet>,
    #[serde(default)]
    pub inspection: InspectionSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Default for InspectionSettings {
    fn default() -> Self {
        Self { use_native: false, ips_signature_path: None, dlp_signature_path: None }
    }
}

/// Reads `p`, parses it as TOML, and validates the result. Returns
/// [`CoreError::Io`] for a missing/unreadable file and [`CoreError::Config`]
/// for anything malformed or inconsistent, the same two variants every other
/// control-plane entry point in this crate already returns.
pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(p)?;
    let cfg: Config = toml::from_str(&text).map_err(|e| CoreError::Config(e.to_string()))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Cross-checks references a single struct's `Deserialize` impl can't catch
/// on its own: a policy, NAT pool, or tunnel naming a tenant that was never
/// assigned a source prefix or VNI, and the string-typed enum fields every
/// section carries.
pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.worker.count == 0 {
        return Err(CoreError::Config("worker.count must be at least 1".into()));
    }

    let known_tenants: HashSet<u32> = cfg
        .tenant_prefixes
        .iter()
        .map(|t| t.tenant_id)
        .chain(cfg.tenant_vnis.iter().map(|t| t.tenant_id))
        .collect();

    for policy in &cfg.policies {
        if policy.tenant_id != 0 && !known_tenants.contains(&policy.tenant_id) {
            return Err(CoreError::Config(format!(
                "policy {} references unknown tenant {}",
                policy.policy_id, policy.tenant_id
            )));
        }
        if policy.policy_id == 0 {
            return Err(CoreError::Config("policy_id 0 is reserved".into()));
        }
        parse_policy_action(&policy.action)?;
        parse_protocol(policy.protocol.as_deref())?;
        if !policy.qos_class.is_empty() {
            parse_qos_class(&policy.qos_class)?;
        }
    }

    for pool in &cfg.nat_pools {
        if pool.tenant_id != 0 && !known_tenants.contains(&pool.tenant_id) {
            return Err(CoreError::Config(format!("nat pool references unknown tenant {}", pool.tenant_id)));
        }
        if pool.start_port > pool.end_port {
            return Err(CoreError::Config("nat pool start_port must not exceed end_port".into()));
        }
    }

    for tunnel in &cfg.tunnels {
        if tunnel.tenant_id != 0 && !known_tenants.contains(&tunnel.tenant_id) {
            return Err(CoreError::Config(format!("tunnel references unknown tenant {}", tunnel.tenant_id)));
        }
        parse_tunnel_type(&tunnel.tunnel_type)?;
    }

    Ok(())
}

pub fn parse_policy_action(s: &str) -> Result<PolicyAction> {
    match s {
        "allow" => Ok(PolicyAction::Allow),
        "deny" => Ok(PolicyAction::Deny),
        "log" => Ok(PolicyAction::Log),
        "rate_limit" => Ok(PolicyAction::RateLimit),
        "redirect" => Ok(PolicyAction::Redirect),
        "encrypt" => Ok(PolicyAction::Encrypt),
        "inspect_dlp" => Ok(PolicyAction::InspectDlp),
        other => Err(CoreError::Config(format!("unknown policy action '{other}'"))),
    }
}

pub fn parse_qos_class(s: &str) -> Result<QosClass> {
    match s {
        "realtime" => Ok(QosClass::Realtime),
        "business" => Ok(QosClass::Business),
        "default" | "" => Ok(QosClass::Default),
        "bulk" => Ok(QosClass::Bulk),
        "scavenger" => Ok(QosClass::Scavenger),
        other => Err(CoreError::Config(format!("unknown qos class '{other}'"))),
    }
}

pub fn parse_protocol(s: Option<&str>) -> Result<Option<Protocol>> {
    match s {
        None => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("tcp") => Ok(Some(Protocol::Tcp)),
        Some(s) if s.eq_ignore_ascii_case("udp") => Ok(Some(Protocol::Udp)),
        Some(other) => Err(CoreError::Config(format!("unknown protocol '{other}'"))),
    }
}

pub fn parse_tunnel_type(s: &str) -> Result<TunnelType> {
    match s {
        "none" => Ok(TunnelType::None),
        "noise_tunnel" => Ok(TunnelType::NoiseTunnel),
        "vxlan" => Ok(TunnelType::Vxlan),
        "gre" => Ok(TunnelType::Gre),
        "geneve" => Ok(TunnelType::Geneve),
        other => Err(CoreError::Config(format!("unknown tunnel type '{other}'"))),
    }
}

/// Resolves one TOML policy entry into the [`PolicyRecord`]
/// [`crate::policy::PolicyVector::new`] expects. Callers are expected to
/// have already run [`validate_config`], so the `unwrap`-free `?` paths here
/// are unreachable in practice but still handled explicitly rather than
/// assumed.
pub fn policy_record_from_config(cfg: &PolicyConfig) -> Result<PolicyRecord> {
    Ok(PolicyRecord {
        policy_id: cfg.policy_id,
        priority: cfg.priority,
        tenant_id: cfg.tenant_id,
        src_prefix: cfg.src_prefix,
        dst_prefix: cfg.dst_prefix,
        protocol: parse_protocol(cfg.protocol.as_deref())?,
        src_port: PortRange { start: cfg.src_port_start, end: cfg.src_port_end },
        dst_port: PortRange { start: cfg.dst_port_start, end: cfg.dst_port_end },
        action: parse_policy_action(&cfg.action)?,
        qos_class: parse_qos_class(&cfg.qos_class)?,
        log_enabled: cfg.log_enabled,
        rate_limit_kbps: cfg.rate_limit_kbps,
    })
}

pub fn tenant_assignment_from_prefix(cfg: &TenantPrefixConfig) -> TenantAssignment {
    TenantAssignment { tenant_id: cfg.tenant_id, vrf_id: cfg.vrf_id, acl_bypass: cfg.acl_bypass }
}

pub fn tenant_assignment_from_vni(cfg: &TenantVniConfig) -> TenantAssignment {
    TenantAssignment { tenant_id: cfg.tenant_id, vrf_id: cfg.vrf_id, acl_bypass: cfg.acl_bypass }
}
