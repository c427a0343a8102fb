//! Tenant classification (spec §4.1, §3 "Tenant lookup table"). Shared,
//! read-only between control-plane updates, and swapped atomically the
//! same way [`crate::policy`] swaps its policy vector.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;

/// What a source-prefix or VNI lookup resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantAssignment {
    pub tenant_id: u32,
    pub vrf_id: u32,
    /// Set only for VNI-sourced assignments (spec §4.1: "a VNI flagged
    /// `acl_bypass` skips the downstream ACL").
    pub acl_bypass: bool,
}

impl Default for TenantAssignment {
    /// The default tenant (0) used when no mapping is found (spec §4.1).
    fn default() -> Self {
        TenantAssignment {
            tenant_id: 0,
            vrf_id: 0,
            acl_bypass: false,
        }
    }
}

#[derive(Clone)]
struct PrefixEntry {
    prefix: IpNet,
    assignment: TenantAssignment,
}

/// Longest-prefix-match source-address table plus the parallel VNI table
/// for VXLAN carrier frames (spec §3 "Tenant lookup table"). Implemented
/// as a sorted vector scanned longest-prefix-first: the spec explicitly
/// allows a four-way set-associative hash acceleration as long as the
/// observable result — longest prefix wins — is unchanged, and a
/// few-hundred-tenant table scans in well under the per-packet budget
/// without one.
#[derive(Clone)]
pub struct TenantTable {
    by_prefix: Vec<PrefixEntry>,
    by_vni: HashMap<u32, TenantAssignment>,
}

impl TenantTable {
    pub fn new() -> Self {
        Self {
            by_prefix: Vec::new(),
            by_vni: HashMap::new(),
        }
    }

    pub fn install_prefix(&mut self, prefix: IpNet, assignment: TenantAssignment) {
        self.by_prefix.retain(|e| e.prefix != prefix);
        self.by_prefix.push(PrefixEntry { prefix, assignment });
        self.by_prefix
            .sort_by(|a, b| b.prefix.prefix_len().cmp(&a.prefix.prefix_len()));
    }

    pub fn remove_prefix(&mut self, prefix: IpNet) {
        self.by_prefix.retain(|e| e.prefix != prefix);
    }

    pub fn install_vni(&mut self, vni: u32, assignment: TenantAssignment) {
        self.by_vni.insert(vni, assignment);
    }

    pub fn remove_vni(&mut self, vni: u32) {
        self.by_vni.remove(&vni);
    }

    /// Longest-prefix match on `addr`; falls back to the default tenant
    /// (spec §4.1: "if no mapping is found the default tenant (0) is
    /// used").
    pub fn classify_by_source(&self, addr: IpAddr) -> TenantAssignment {
        self.by_prefix
            .iter()
            .find(|e| e.prefix.contains(&addr))
            .map(|e| e.assignment)
            .unwrap_or_default()
    }

    /// VNI-indexed lookup for VXLAN carrier frames (UDP/4789).
    pub fn classify_by_vni(&self, vni: u32) -> TenantAssignment {
        self.by_vni.get(&vni).copied().unwrap_or_default()
    }
}

impl Default for TenantTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle workers hold: a read of the current table is an
/// `ArcSwap::load`, cheap enough to do once per batch (spec §5: "a
/// worker reads the current version at the start of each batch").
pub type SharedTenantTable = ArcSwap<TenantTable>;

pub fn new_shared(table: TenantTable) -> SharedTenantTable {
    ArcSwap::new(Arc::new(table))
}
