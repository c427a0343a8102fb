//! Native multi-pattern [`Matcher`] backend, compiled once per reload and
//! shared read-mostly across workers behind `arc_swap::ArcSwap` (same
//! pattern as [`crate::policy`]'s policy vector — see spec §4.4 "compiled
//! multi-pattern set").

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use super::{Action, Hit, Matcher, Signature, SignaturePattern};

/// A compiled signature set. One instance serves either IPS or DLP; the
/// two scanners never share a compiled set even though they share this
/// type.
pub struct PatternSetMatcher {
    automaton: AhoCorasick,
    signatures: Vec<Signature>,
}

impl PatternSetMatcher {
    /// Compiles `signatures` into a single Aho-Corasick automaton. Case
    /// sensitivity is per-pattern: `SignaturePattern::CaseInsensitive`
    /// entries are lowered here and the scan lowers the payload window,
    /// so the automaton itself can stay a single ASCII-case-sensitive
    /// build (`aho-corasick` supports a blanket ASCII-case-insensitive
    /// mode, but the spec mixes exact and case-insensitive signatures in
    /// one set, so each pattern's bytes are pre-normalized instead).
    pub fn compile(signatures: Vec<Signature>) -> Self {
        let patterns: Vec<&[u8]> = signatures
            .iter()
            .map(|s| match &s.pattern {
                SignaturePattern::Exact(bytes) => bytes.as_slice(),
                SignaturePattern::CaseInsensitive(bytes) => bytes.as_slice(),
            })
            .collect();

        let automaton = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostFirst)
            .build(patterns)
            .expect("signature pattern set must compile");

        Self { automaton, signatures }
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl Matcher for PatternSetMatcher {
    fn scan(&self, payload: &[u8]) -> Option<Hit> {
        let mut best: Option<Hit> = None;
        let mut terminated_early = false;

        for needs_lower in [false, true] {
            if terminated_early {
                break;
            }
            let haystack: std::borrow::Cow<[u8]> = if needs_lower {
                std::borrow::Cow::Owned(payload.to_ascii_lowercase())
            } else {
                std::borrow::Cow::Borrowed(payload)
            };

            for m in self.automaton.find_iter(haystack.as_ref()) {
                let sig = &self.signatures[m.pattern().as_usize()];
                let is_ci = matches!(sig.pattern, SignaturePattern::CaseInsensitive(_));
                if is_ci != needs_lower {
                    continue;
                }
                let hit = Hit {
                    signature_id: sig.id,
                    category: sig.category,
                    action: sig.action,
                };
                best = Some(match best {
                    Some(existing) if existing.action >= hit.action => existing,
                    _ => hit,
                });
                if matches!(sig.action, Action::Drop) {
                    terminated_early = true;
                    break;
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::Category;

    fn sig(id: u32, category: Category, action: Action, pattern: &str, ci: bool) -> Signature {
        Signature {
            id,
            category,
            action,
            pattern: if ci {
                SignaturePattern::CaseInsensitive(pattern.to_ascii_lowercase().into_bytes())
            } else {
                SignaturePattern::Exact(pattern.as_bytes().to_vec())
            },
        }
    }

    #[test]
    fn drop_terminates_scan_early_even_with_later_matches() {
        let set = PatternSetMatcher::compile(vec![
            sig(1, Category::Malware, Action::Alert, "eicar", true),
            sig(2, Category::Cve, Action::Drop, "${jndi:", false),
        ]);
        let hit = set.scan(b"eicar ${jndi:ldap://x}").unwrap();
        assert_eq!(hit.signature_id, 2);
        assert_eq!(hit.action, Action::Drop);
    }

    #[test]
    fn highest_severity_action_wins_when_no_drop_present() {
        let set = PatternSetMatcher::compile(vec![
            sig(1, Category::Botnet, Action::Alert, "beacon", false),
            sig(2, Category::Exploit, Action::Reject, "union", true),
        ]);
        let hit = set.scan(b"beacon UNION select 1").unwrap();
        assert_eq!(hit.signature_id, 2);
        assert_eq!(hit.action, Action::Reject);
    }

    #[test]
    fn no_match_returns_none() {
        let set = PatternSetMatcher::compile(vec![sig(1, Category::Malware, Action::Drop, "evil", false)]);
        assert!(set.scan(b"nothing to see here").is_none());
    }
}
