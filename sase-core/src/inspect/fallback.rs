//! The fall-back [`Matcher`] — the spec-mandated minimum a scanner must
//! detect with no compiled pattern set at all (spec §4.4, §4.5). Grounded
//! byte-for-byte in `dlp_simple_scan` and the CVE-4001 Log4j signature in
//! `node_security_inspect.c`.

use super::{Action, Category, Hit, Matcher};

/// Minimum IPS detection: Log4j-style `${jndi:` and SQL `UNION`, both
/// matched ASCII case-insensitively (spec §4.4).
pub struct FallbackIpsMatcher;

impl Matcher for FallbackIpsMatcher {
    fn scan(&self, payload: &[u8]) -> Option<Hit> {
        if contains_ascii_ci(payload, b"${jndi:") {
            return Some(Hit {
                signature_id: 4001,
                category: Category::Cve,
                action: Action::Drop,
            });
        }
        if contains_ascii_ci(payload, b"union") {
            return Some(Hit {
                signature_id: 4002,
                category: Category::Exploit,
                action: Action::Alert,
            });
        }
        None
    }
}

/// Minimum DLP detection: a 13-19 run of digits (dashes and spaces don't
/// break the run, any other byte does) for credit-card numbers, and the
/// `\d{3}-\d{2}-\d{4}` shape for SSNs. Credit-card and SSN both carry a
/// `Drop` action per spec §4.5 ("credit-card and SSN matches yield DROP").
pub struct FallbackDlpMatcher;

impl Matcher for FallbackDlpMatcher {
    fn scan(&self, payload: &[u8]) -> Option<Hit> {
        if scan_ssn_shape(payload) {
            return Some(Hit {
                signature_id: 1,
                category: Category::Ssn,
                action: Action::Drop,
            });
        }
        if scan_digit_run(payload) {
            return Some(Hit {
                signature_id: 2,
                category: Category::CreditCard,
                action: Action::Drop,
            });
        }
        None
    }
}

/// ASCII case-insensitive substring search; `needle` must already be
/// lowercase.
fn contains_ascii_ci(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Mirrors `dlp_simple_scan`'s digit-run loop: a run of ASCII digits keeps
/// counting through interleaved `' '`/`'-'` bytes, and resets on anything
/// else. A 13-19 digit run at any point in the scan is a hit.
fn scan_digit_run(payload: &[u8]) -> bool {
    let mut consecutive_digits = 0u32;
    for &b in payload {
        if b.is_ascii_digit() {
            consecutive_digits += 1;
            if (13..=19).contains(&consecutive_digits) {
                return true;
            }
        } else if b != b' ' && b != b'-' {
            consecutive_digits = 0;
        }
    }
    false
}

/// `\d{3}-\d{2}-\d{4}`, checked at every offset.
fn scan_ssn_shape(payload: &[u8]) -> bool {
    if payload.len() < 11 {
        return false;
    }
    for window in payload.windows(11) {
        let digit = |i: usize| window[i].is_ascii_digit();
        if digit(0)
            && digit(1)
            && digit(2)
            && window[3] == b'-'
            && digit(4)
            && digit(5)
            && window[6] == b'-'
            && digit(7)
            && digit(8)
            && digit(9)
            && digit(10)
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ips_fallback_detects_jndi_case_insensitively() {
        let hit = FallbackIpsMatcher.scan(b"exploit attempt: ${JNDI:ldap://x/y}").unwrap();
        assert_eq!(hit.signature_id, 4001);
        assert_eq!(hit.category, Category::Cve);
        assert_eq!(hit.action, Action::Drop);
    }

    #[test]
    fn ips_fallback_detects_union_case_insensitively() {
        let hit = FallbackIpsMatcher.scan(b"1 UnIoN select * from users").unwrap();
        assert_eq!(hit.category, Category::Exploit);
    }

    #[test]
    fn ips_fallback_ignores_clean_payload() {
        assert!(FallbackIpsMatcher.scan(b"GET /index.html HTTP/1.1").is_none());
    }

    #[test]
    fn dlp_fallback_detects_16_digit_card_with_spaces() {
        let hit = FallbackDlpMatcher.scan(b"card: 4111 1111 1111 1111 exp").unwrap();
        assert_eq!(hit.category, Category::CreditCard);
    }

    #[test]
    fn dlp_fallback_ignores_short_digit_runs() {
        assert!(FallbackDlpMatcher.scan(b"order id 123456").is_none());
    }

    #[test]
    fn dlp_fallback_detects_ssn_shape() {
        let hit = FallbackDlpMatcher.scan(b"ssn on file: 123-45-6789 thanks").unwrap();
        assert_eq!(hit.category, Category::Ssn);
        assert_eq!(hit.action, Action::Drop);
    }

    #[test]
    fn dlp_fallback_ssn_takes_priority_over_digit_run() {
        // A bare SSN shape is only 9 digits, short of the 13-digit credit
        // card floor, so the SSN branch must fire on its own.
        let hit = FallbackDlpMatcher.scan(b"123-45-6789").unwrap();
        assert_eq!(hit.category, Category::Ssn);
    }
}
