//! The 5-tuple flow key (spec §3 "Session record", glossary "5-tuple").

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use ahash::AHasher;

/// IP protocol number, restricted to the two the pipeline understands
/// end-to-end. Anything else is carried as `Other` so malformed/unknown
/// protocols don't panic the parser, but never matches a NAT-eligible or
/// QoS policy predicate that names TCP or UDP specifically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    pub fn from_ip_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    pub fn ip_number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => n,
        }
    }
}

/// The flow key used to index the session and NAT hash tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FiveTuple {
    /// The key a reverse-direction packet presents: source and destination
    /// swapped (spec §9 "reverse-direction session identification" — both
    /// the forward and reverse entries are created at session creation).
    pub fn reversed(&self) -> Self {
        FiveTuple {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Fast non-cryptographic hash seeded at startup (spec §4.2), used to
    /// index the per-worker session and NAT hash tables. `ahash` is seeded
    /// per-process by default, which satisfies the "seeded at startup"
    /// requirement without a dedicated RNG dependency.
    pub fn hash_u64(&self) -> u64 {
        let mut hasher = AHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_swaps_both_addresses_and_ports() {
        let t = FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: 33000,
            dst_port: 443,
            protocol: Protocol::Tcp,
        };
        let r = t.reversed();
        assert_eq!(r.src_addr, t.dst_addr);
        assert_eq!(r.dst_addr, t.src_addr);
        assert_eq!(r.src_port, t.dst_port);
        assert_eq!(r.dst_port, t.src_port);
        assert_eq!(r.reversed(), t);
    }

    #[test]
    fn hash_is_stable_for_equal_tuples() {
        let a = FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: 33000,
            dst_port: 443,
            protocol: Protocol::Tcp,
        };
        let b = a;
        assert_eq!(a.hash_u64(), b.hash_u64());
    }
}
