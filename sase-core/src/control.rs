//! Control-plane operations (spec §6 "Control plane operations"). Every
//! operation here is synchronous: it takes effect no later than the next
//! batch boundary on every worker, by swapping an `ArcSwap` pointer or
//! pushing a per-worker command that the worker applies between batches.
//! Nothing here runs on the packet fast path.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::app::ClassifierTable;
use crate::error::{CoreError, Result};
use crate::inspect::{dlp::DlpScanner, ips::IpsScanner, Signature};
use crate::metadata::QosClass;
use crate::nat::NatPool;
use crate::policy::{PolicyRecord, PolicyVector, SharedPolicyVector};
use crate::tenant::{SharedTenantTable, TenantAssignment, TenantTable};
use crate::tunnel::TunnelRecord;

/// NAT pool configuration for one tenant, expressed as the full range the
/// control plane owns; [`ControlPlane::configure_nat_pool`] partitions it
/// into one contiguous sub-range per worker (SPEC_FULL.md §3.1) so no
/// worker ever needs another's `next_port` cursor.
#[derive(Debug, Clone, Copy)]
pub struct NatPoolConfig {
    pub external_addr: Ipv4Addr,
    pub start_port: u16,
    pub end_port: u16,
}

/// Everything the control plane needs a handle to in order to reconfigure
/// a running worker pool. Shared tables are `Arc`s so installing a new
/// version is a single atomic swap every worker picks up at its next batch
/// boundary; NAT pools and rate limits are per-worker and pushed through
/// [`WorkerControlHandle`].
pub struct ControlPlane {
    worker_count: usize,
    tenant_table: Arc<SharedTenantTable>,
    policy_vector: Arc<SharedPolicyVector>,
    tunnels_by_tenant: Arc<ArcSwap<HashMap<u32, Arc<TunnelRecord>>>>,
    ips_scanner: Arc<IpsScanner>,
    dlp_scanner: Arc<DlpScanner>,
    app_classifier: Arc<ArcSwap<ClassifierTable>>,
}

impl ControlPlane {
    pub fn new(
        worker_count: usize,
        tenant_table: Arc<SharedTenantTable>,
        policy_vector: Arc<SharedPolicyVector>,
        tunnels_by_tenant: Arc<ArcSwap<HashMap<u32, Arc<TunnelRecord>>>>,
        ips_scanner: Arc<IpsScanner>,
        dlp_scanner: Arc<DlpScanner>,
        app_classifier: Arc<ArcSwap<ClassifierTable>>,
    ) -> Self {
        Self {
            worker_count,
            tenant_table,
            policy_vector,
            tunnels_by_tenant,
            ips_scanner,
            dlp_scanner,
            app_classifier,
        }
    }

    pub fn tenant_table(&self) -> &Arc<SharedTenantTable> {
        &self.tenant_table
    }

    pub fn policy_vector(&self) -> &Arc<SharedPolicyVector> {
        &self.policy_vector
    }

    /// Installs (or replaces) a tenant's source-prefix assignment (spec §6
    /// "install/remove tenant"). Read-modify-write against the current
    /// snapshot, then a single atomic swap.
    pub fn install_tenant_prefix(&self, prefix: IpNet, assignment: TenantAssignment) {
        let mut table = (*self.tenant_table.load_full()).clone();
        table.install_prefix(prefix, assignment);
        self.tenant_table.store(Arc::new(table));
    }

    pub fn remove_tenant_prefix(&self, prefix: IpNet) {
        let mut table = (*self.tenant_table.load_full()).clone();
        table.remove_prefix(prefix);
        self.tenant_table.store(Arc::new(table));
    }

    /// Installs (or removes) a VNI-to-tenant mapping (spec §6 "install/
    /// remove VNI mapping").
    pub fn install_vni_mapping(&self, vni: u32, assignment: TenantAssignment) -> Result<()> {
        if vni >= 1 << 24 {
            return Err(CoreError::Config("VNI must fit in 24 bits".into()));
        }
        let mut table = (*self.tenant_table.load_full()).clone();
        table.install_vni(vni, assignment);
        self.tenant_table.store(Arc::new(table));
        Ok(())
    }

    pub fn remove_vni_mapping(&self, vni: u32) {
        let mut table = (*self.tenant_table.load_full()).clone();
        table.remove_vni(vni);
        self.tenant_table.store(Arc::new(table));
    }

    /// Installs a full replacement policy vector (spec §6 "install/replace
    /// policy vector"). The vector is rebuilt and swapped as a unit so
    /// workers never observe a half-updated ordering.
    pub fn replace_policy_vector(&self, records: Vec<PolicyRecord>) -> Result<()> {
        for record in &records {
            if record.policy_id == 0 {
                return Err(CoreError::Config("policy_id 0 is reserved".into()));
            }
        }
        self.policy_vector.store(Arc::new(PolicyVector::new(records)));
        Ok(())
    }

    /// Partitions `config`'s port range into `self.worker_count` contiguous
    /// sub-ranges and returns one [`NatPool`] per worker index (SPEC_FULL.md
    /// §3.1). A range narrower than the worker count hands the leftover
    /// workers an empty (`start > end`) slice, which always reports
    /// [`crate::nat::NatError::NoPortAvailable`] — the documented
    /// degrade-gracefully behavior, not a bug.
    pub fn configure_nat_pool(&self, config: NatPoolConfig) -> Result<Vec<NatPool>> {
        if config.start_port > config.end_port {
            return Err(CoreError::Config("NAT pool start_port must not exceed end_port".into()));
        }
        let total = config.end_port as u32 - config.start_port as u32 + 1;
        let share = total / self.worker_count as u32;
        let remainder = total % self.worker_count as u32;

        let mut pools = Vec::with_capacity(self.worker_count);
        let mut cursor = config.start_port as u32;
        for worker_idx in 0..self.worker_count {
            let this_share = share + u32::from((worker_idx as u32) < remainder);
            if this_share == 0 {
                pools.push(NatPool::new(config.external_addr.into(), 1, 0));
                continue;
            }
            let start = cursor as u16;
            let end = (cursor + this_share - 1) as u16;
            pools.push(NatPool::new(config.external_addr.into(), start, end));
            cursor += this_share;
        }
        Ok(pools)
    }

    /// Builds a tunnel record and installs it for `tenant_id` (spec §6
    /// "create/update tunnel"). Passing `None` removes the mapping, falling
    /// through to `none` encapsulation for that tenant (spec §4.9).
    pub fn set_tunnel(&self, tenant_id: u32, tunnel: Option<TunnelRecord>) {
        let current = self.tunnels_by_tenant.load();
        let mut next: HashMap<u32, Arc<TunnelRecord>> = (**current).clone();
        match tunnel {
            Some(record) => {
                next.insert(tenant_id, Arc::new(record));
            }
            None => {
                next.remove(&tenant_id);
            }
        }
        self.tunnels_by_tenant.store(Arc::new(next));
    }

    /// Reloads IPS signatures (spec §6 control operations over §4.4).
    pub fn reload_ips_signatures(&self, signatures: Vec<Signature>) {
        self.ips_scanner.reload(signatures);
    }

    /// Reloads DLP signatures (spec §6 control operations over §4.5).
    pub fn reload_dlp_signatures(&self, signatures: Vec<Signature>) {
        self.dlp_scanner.reload(signatures);
    }

    /// Installs a curated collaboration-service destination prefix used by
    /// the application classifier (spec §4.6).
    pub fn install_collab_prefix(&self, prefix: IpNet) {
        let mut table = (*self.app_classifier.load_full()).clone();
        table.install_collab_prefix(prefix);
        self.app_classifier.store(Arc::new(table));
    }
}

/// Per-worker side of rate-limit control (spec §6 "set rate limit (tenant_id,
/// qos_class, Mbps)"). Unlike the shared tables above, each worker's
/// [`crate::qos::ShaperTable`] is private state, so a rate-limit change is
/// applied directly against a worker's own table rather than through an
/// atomic swap; callers typically hold one handle per worker and broadcast
/// the same call to all of them.
pub struct WorkerControlHandle<'a> {
    shaper: &'a mut crate::qos::ShaperTable,
}

impl<'a> WorkerControlHandle<'a> {
    pub fn new(shaper: &'a mut crate::qos::ShaperTable) -> Self {
        Self { shaper }
    }

    pub fn set_rate_limit(&mut self, tenant_id: u32, class: QosClass, rate_bps: u64, now: Instant) {
        self.shaper.configure(tenant_id, class, rate_bps, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::ScannerConfig;
    use crate::policy::{new_shared as new_shared_policy, PolicyAction, PortRange};
    use crate::tenant::new_shared as new_shared_tenant;

    fn control_plane(worker_count: usize) -> ControlPlane {
        ControlPlane::new(
            worker_count,
            Arc::new(new_shared_tenant(TenantTable::new())),
            Arc::new(new_shared_policy(PolicyVector::new(vec![]))),
            Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
            Arc::new(IpsScanner::new(ScannerConfig { use_native: false }, vec![])),
            Arc::new(DlpScanner::new(ScannerConfig { use_native: false }, vec![])),
            Arc::new(ArcSwap::new(Arc::new(ClassifierTable::new()))),
        )
    }

    #[test]
    fn nat_pool_partitions_evenly_across_workers() {
        let cp = control_plane(4);
        let pools = cp
            .configure_nat_pool(NatPoolConfig { external_addr: "198.51.100.4".parse().unwrap(), start_port: 10000, end_port: 10999 })
            .unwrap();
        assert_eq!(pools.len(), 4);
        for pool in &pools {
            assert!(!pool.is_empty());
        }
        assert_eq!(pools[0].start, 10000);
        assert_eq!(pools[3].end, 10999);
    }

    #[test]
    fn nat_pool_narrower_than_worker_count_degrades_gracefully() {
        let cp = control_plane(8);
        let pools = cp
            .configure_nat_pool(NatPoolConfig { external_addr: "198.51.100.4".parse().unwrap(), start_port: 10000, end_port: 10002 })
            .unwrap();
        assert_eq!(pools.len(), 8);
        let empty_count = pools.iter().filter(|p| p.is_empty()).count();
        assert_eq!(empty_count, 5);
    }

    #[test]
    fn install_tenant_prefix_is_visible_through_shared_handle() {
        let cp = control_plane(1);
        cp.install_tenant_prefix(
            "10.1.0.0/16".parse().unwrap(),
            TenantAssignment { tenant_id: 7, vrf_id: 0, acl_bypass: false },
        );
        let assignment = cp.tenant_table().load().classify_by_source("10.1.0.5".parse().unwrap());
        assert_eq!(assignment.tenant_id, 7);
    }

    #[test]
    fn replace_policy_vector_rejects_reserved_policy_id_zero() {
        let cp = control_plane(1);
        let bad = PolicyRecord {
            policy_id: 0,
            priority: 0,
            tenant_id: 0,
            src_prefix: None,
            dst_prefix: None,
            protocol: None,
            src_port: PortRange::ANY,
            dst_port: PortRange::ANY,
            action: PolicyAction::Allow,
            qos_class: QosClass::Default,
            log_enabled: false,
            rate_limit_kbps: 0,
        };
        assert!(cp.replace_policy_vector(vec![bad]).is_err());
    }

    #[test]
    fn set_tunnel_none_removes_existing_mapping() {
        let cp = control_plane(1);
        cp.set_tunnel(7, Some(TunnelRecord::new(crate::tunnel::TunnelType::Vxlan, "198.51.100.1".parse().unwrap(), "198.51.100.2".parse().unwrap(), 1)));
        assert!(cp.tunnels_by_tenant.load().contains_key(&7));
        cp.set_tunnel(7, None);
        assert!(!cp.tunnels_by_tenant.load().contains_key(&7));
    }
}
