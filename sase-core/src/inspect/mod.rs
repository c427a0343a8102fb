//! DLP/IPS payload scanning (spec §4.4, §4.5, §9 Design Note 9 "capability
//! abstraction"). Both scanners share one substrate: compile a pattern set
//! once, then run a single-pass scan per packet that returns at most one
//! [`Hit`] — the highest-severity match wins.
//!
//! Two backends implement [`Matcher`]: [`pattern_set::PatternSetMatcher`],
//! an `aho-corasick` multi-pattern engine, and [`fallback::FallbackMatcher`],
//! the spec-mandated minimum that must work with no compiled pattern set at
//! all. [`ScannerConfig::use_native`] picks between them.

pub mod dlp;
pub mod fallback;
pub mod ips;
pub mod pattern_set;

/// A single match surfaced by a scan, already resolved to the action the
/// caller should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub signature_id: u32,
    pub category: Category,
    pub action: Action,
}

/// IPS and DLP categories share one type so a [`Hit`] doesn't need to know
/// which scanner produced it; `inspect::ips` and `inspect::dlp` each only
/// construct their own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    // IPS (spec §4.4)
    Malware,
    Exploit,
    Botnet,
    Cve,
    Policy,
    // DLP (spec §4.5)
    CreditCard,
    Ssn,
    Iban,
    Email,
    Phone,
    Keyword,
    Custom,
}

/// What to do with a packet that matched. Ordered lowest-to-highest
/// severity; `Ord` is derived so `max` picks the strictest action, per the
/// "highest-severity action wins" rule in spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    Alert,
    Reject,
    Drop,
}

/// A compiled or fallback payload scanner. `compile` is a control-plane
/// operation (run once when signatures are loaded or reloaded); `scan` runs
/// on the fast path for every packet that reaches the stage.
pub trait Matcher: Send + Sync {
    fn scan(&self, payload: &[u8]) -> Option<Hit>;
}

/// One entry in a compiled pattern set (spec §4.4/§4.5).
#[derive(Debug, Clone)]
pub struct Signature {
    pub id: u32,
    pub category: Category,
    pub action: Action,
    pub pattern: SignaturePattern,
}

/// How a signature's bytes are interpreted during compilation.
#[derive(Debug, Clone)]
pub enum SignaturePattern {
    /// Matched byte-for-byte.
    Exact(Vec<u8>),
    /// Matched ASCII case-insensitively (signature bytes are pre-lowered).
    CaseInsensitive(Vec<u8>),
}

/// Selects which [`Matcher`] backend a scanner instance uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScannerConfig {
    pub use_native: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ordering_prefers_drop_over_reject_over_alert() {
        assert!(Action::Drop > Action::Reject);
        assert!(Action::Reject > Action::Alert);
        assert_eq!(Action::Drop.max(Action::Alert), Action::Drop);
    }
}
