//! Policy matching (spec §4.3, §3 "Policy record"). The policy vector is
//! shared read-only between atomic swaps, same pattern as
//! [`crate::tenant::SharedTenantTable`].

use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::fivetuple::{FiveTuple, Protocol};
use crate::metadata::QosClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Deny,
    Log,
    RateLimit,
    Redirect,
    Encrypt,
    InspectDlp,
}

/// An inclusive port range; `0..=0` on both ends is the "empty, matches
/// any" sentinel spec §3 describes as "predicates with zero/empty values
/// match any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange { start: 0, end: 0 };

    fn matches(&self, port: u16) -> bool {
        if self.start == 0 && self.end == 0 {
            return true;
        }
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub policy_id: u32,
    pub priority: u32,
    /// 0 = global, matches any tenant (spec §3).
    pub tenant_id: u32,
    pub src_prefix: Option<IpNet>,
    pub dst_prefix: Option<IpNet>,
    /// 0 = any protocol.
    pub protocol: Option<Protocol>,
    pub src_port: PortRange,
    pub dst_port: PortRange,
    pub action: PolicyAction,
    pub qos_class: QosClass,
    pub log_enabled: bool,
    pub rate_limit_kbps: u32,
}

impl PolicyRecord {
    fn matches(&self, tuple: &FiveTuple, tenant_id: u32) -> bool {
        if self.tenant_id != 0 && self.tenant_id != tenant_id {
            return false;
        }
        if let Some(prefix) = self.src_prefix {
            if !prefix.contains(&tuple.src_addr) {
                return false;
            }
        }
        if let Some(prefix) = self.dst_prefix {
            if !prefix.contains(&tuple.dst_addr) {
                return false;
            }
        }
        if let Some(protocol) = self.protocol {
            if protocol != tuple.protocol {
                return false;
            }
        }
        self.src_port.matches(tuple.src_port) && self.dst_port.matches(tuple.dst_port)
    }
}

/// The result of a match: the winning policy's `action` and `qos_class`,
/// resolved to concrete values the caller doesn't need to re-derive.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub policy_id: u32,
    pub action: PolicyAction,
    pub qos_class: QosClass,
    pub log_enabled: bool,
    pub rate_limit_kbps: u32,
}

/// An ordered, immutable policy vector. Built once by the control plane
/// and installed by atomic swap; `match_tuple` is the fast-path linear
/// priority scan spec §4.3 describes (implementations may accelerate it
/// with a radix tree, but the observable result — lowest-priority,
/// then-first-inserted match wins — must be identical, so that's what
/// this does directly).
#[derive(Debug, Clone, Default)]
pub struct PolicyVector {
    // Sorted by (priority, insertion order) ascending at install time so
    // the first match in iteration order is always the winner.
    policies: Vec<PolicyRecord>,
}

impl PolicyVector {
    pub fn new(mut policies: Vec<PolicyRecord>) -> Self {
        policies.sort_by_key(|p| p.priority);
        Self { policies }
    }

    pub fn match_tuple(&self, tuple: &FiveTuple, tenant_id: u32) -> Option<MatchResult> {
        self.policies
            .iter()
            .find(|p| p.matches(tuple, tenant_id))
            .map(|p| MatchResult {
                policy_id: p.policy_id,
                action: p.action,
                qos_class: p.qos_class,
                log_enabled: p.log_enabled,
                rate_limit_kbps: p.rate_limit_kbps,
            })
    }
}

pub type SharedPolicyVector = ArcSwap<PolicyVector>;

pub fn new_shared(vector: PolicyVector) -> SharedPolicyVector {
    ArcSwap::new(Arc::new(vector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: 33000,
            dst_port: 443,
            protocol: Protocol::Tcp,
        }
    }

    fn base_policy(id: u32, priority: u32, action: PolicyAction) -> PolicyRecord {
        PolicyRecord {
            policy_id: id,
            priority,
            tenant_id: 0,
            src_prefix: None,
            dst_prefix: None,
            protocol: None,
            src_port: PortRange::ANY,
            dst_port: PortRange::ANY,
            action,
            qos_class: QosClass::Default,
            log_enabled: false,
            rate_limit_kbps: 0,
        }
    }

    #[test]
    fn lowest_priority_number_wins() {
        let vector = PolicyVector::new(vec![
            base_policy(1, 100, PolicyAction::Allow),
            base_policy(2, 10, PolicyAction::Deny),
        ]);
        let result = vector.match_tuple(&tuple(), 7).unwrap();
        assert_eq!(result.policy_id, 2);
        assert_eq!(result.action, PolicyAction::Deny);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let vector = PolicyVector::new(vec![
            base_policy(1, 10, PolicyAction::Allow),
            base_policy(2, 10, PolicyAction::Deny),
        ]);
        let result = vector.match_tuple(&tuple(), 7).unwrap();
        assert_eq!(result.policy_id, 1);
    }

    #[test]
    fn deny_matching_destination_prefix_wins_over_global_allow() {
        let mut deny = base_policy(2, 5, PolicyAction::Deny);
        deny.dst_prefix = Some("203.0.113.10/32".parse().unwrap());
        let vector = PolicyVector::new(vec![base_policy(1, 100, PolicyAction::Allow), deny]);
        let result = vector.match_tuple(&tuple(), 7).unwrap();
        assert_eq!(result.action, PolicyAction::Deny);
    }

    #[test]
    fn tenant_scoped_policy_does_not_match_other_tenants() {
        let mut scoped = base_policy(1, 1, PolicyAction::Deny);
        scoped.tenant_id = 99;
        let vector = PolicyVector::new(vec![scoped]);
        assert!(vector.match_tuple(&tuple(), 7).is_none());
    }

    #[test]
    fn empty_vector_yields_no_match() {
        let vector = PolicyVector::new(vec![]);
        assert!(vector.match_tuple(&tuple(), 7).is_none());
    }
}
