//! DLP scanning stage (spec §4.5). Same substrate as [`crate::inspect::ips`]
//! — see that module for the reload/atomic-swap rationale.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::fallback::FallbackDlpMatcher;
use super::{Category, Hit, Matcher, ScannerConfig, Signature};

/// Payload scan depth (spec §4.5: "scan depth bounded (4096 bytes)").
pub const MAX_SCAN_DEPTH: usize = 4096;

/// Categories that terminate the flow outright; everything else is
/// logged and the packet continues (spec §4.5: "credit-card and SSN
/// matches yield DROP; other categories yield LOG+continue").
pub fn is_critical(category: Category) -> bool {
    matches!(category, Category::CreditCard | Category::Ssn)
}

pub struct DlpScanner {
    matcher: ArcSwap<Box<dyn Matcher>>,
}

impl DlpScanner {
    pub fn new(config: ScannerConfig, signatures: Vec<Signature>) -> Self {
        let matcher: Box<dyn Matcher> = if config.use_native {
            Box::new(super::pattern_set::PatternSetMatcher::compile(signatures))
        } else {
            Box::new(FallbackDlpMatcher)
        };
        Self {
            matcher: ArcSwap::new(Arc::new(matcher)),
        }
    }

    pub fn reload(&self, signatures: Vec<Signature>) {
        let matcher: Box<dyn Matcher> = Box::new(super::pattern_set::PatternSetMatcher::compile(signatures));
        self.matcher.store(Arc::new(matcher));
    }

    /// Returns a hit together with whether it's critical, so callers don't
    /// have to re-derive that from the category.
    pub fn scan(&self, payload: &[u8]) -> Option<(Hit, bool)> {
        let bounded = &payload[..payload.len().min(MAX_SCAN_DEPTH)];
        self.matcher.load().scan(bounded).map(|hit| {
            let critical = is_critical(hit.category);
            (hit, critical)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_card_hit_is_critical() {
        let scanner = DlpScanner::new(ScannerConfig { use_native: false }, vec![]);
        let (hit, critical) = scanner.scan(b"4111 1111 1111 1111").unwrap();
        assert_eq!(hit.category, Category::CreditCard);
        assert!(critical);
    }

    #[test]
    fn ssn_hit_is_critical() {
        let scanner = DlpScanner::new(ScannerConfig { use_native: false }, vec![]);
        let (hit, critical) = scanner.scan(b"ssn 123-45-6789").unwrap();
        assert_eq!(hit.category, Category::Ssn);
        assert!(critical);
    }

    #[test]
    fn clean_payload_yields_no_hit() {
        let scanner = DlpScanner::new(ScannerConfig { use_native: false }, vec![]);
        assert!(scanner.scan(b"hello world, nothing sensitive here").is_none());
    }
}
