//! Application classifier (spec §4.6). Primary classification is a
//! fixed well-known-port table; TLS/QUIC get targeted DPI on top of that
//! when the port alone is ambiguous (443 carries plain TLS, QUIC, or
//! neither depending on transport and first bytes).

use std::net::IpAddr;

use ipnet::IpNet;

use crate::fivetuple::{FiveTuple, Protocol};
use crate::metadata::QosClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AppId {
    Unknown = 0,
    Http = 1,
    Dns = 2,
    Ssh = 3,
    Smtp = 4,
    TlsGeneric = 5,
    Quic = 6,
    TlsCollab = 7,
}

impl AppId {
    pub fn code(self) -> u16 {
        self as u16
    }
}

struct PortEntry {
    port: u16,
    protocol: Protocol,
    app_id: AppId,
    qos_class: QosClass,
}

/// Fixed well-known-port table (spec §4.6). Port 443 is deliberately
/// absent: it's ambiguous between plain TLS (TCP) and QUIC (UDP) and is
/// resolved by DPI instead.
const PORT_TABLE: &[PortEntry] = &[
    PortEntry { port: 80, protocol: Protocol::Tcp, app_id: AppId::Http, qos_class: QosClass::Default },
    PortEntry { port: 53, protocol: Protocol::Udp, app_id: AppId::Dns, qos_class: QosClass::Business },
    PortEntry { port: 53, protocol: Protocol::Tcp, app_id: AppId::Dns, qos_class: QosClass::Business },
    PortEntry { port: 22, protocol: Protocol::Tcp, app_id: AppId::Ssh, qos_class: QosClass::Business },
    PortEntry { port: 25, protocol: Protocol::Tcp, app_id: AppId::Smtp, qos_class: QosClass::Bulk },
];

const TLS_PORT: u16 = 443;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;

/// QUIC version numbers that identify the first four payload bytes (after
/// the long-header form bit) as QUIC rather than some other UDP/443
/// traffic (spec §4.6).
const QUIC_V1: u32 = 0x0000_0001;
const QUIC_V2: u32 = 0x6b33_43cf;

fn is_quic_draft_version(v: u32) -> bool {
    (0xff00_0000..=0xff00_00ff).contains(&v)
}

/// Curated destination-address prefixes for major collaboration services,
/// installed by the control plane (spec §4.6: "curated prefix ranges").
/// Empty by default; an implementer's control plane populates it from an
/// out-of-band list maintained outside this crate.
#[derive(Default, Clone)]
pub struct ClassifierTable {
    collab_prefixes: Vec<IpNet>,
}

impl ClassifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_collab_prefix(&mut self, prefix: IpNet) {
        if !self.collab_prefixes.contains(&prefix) {
            self.collab_prefixes.push(prefix);
        }
    }

    fn is_collab_destination(&self, addr: IpAddr) -> bool {
        self.collab_prefixes.iter().any(|p| p.contains(&addr))
    }

    /// Classifies one packet, returning the app id and QoS class a policy
    /// match hasn't already overridden. `payload` is the L4 payload, which
    /// may be empty.
    pub fn classify(&self, tuple: &FiveTuple, payload: &[u8]) -> (AppId, QosClass) {
        if let Some(entry) =
            PORT_TABLE.iter().find(|e| e.port == tuple.dst_port && e.protocol == tuple.protocol)
        {
            return (entry.app_id, entry.qos_class);
        }

        if tuple.dst_port == TLS_PORT && tuple.protocol == Protocol::Udp {
            if let Some(app) = classify_quic(payload) {
                return (app, QosClass::Realtime);
            }
        }

        if tuple.dst_port == TLS_PORT && tuple.protocol == Protocol::Tcp {
            if payload.first() == Some(&TLS_HANDSHAKE_CONTENT_TYPE) {
                return if self.is_collab_destination(tuple.dst_addr) {
                    (AppId::TlsCollab, QosClass::Business)
                } else {
                    (AppId::TlsGeneric, QosClass::Default)
                };
            }
        }

        (AppId::Unknown, QosClass::Default)
    }
}

fn classify_quic(payload: &[u8]) -> Option<AppId> {
    if payload.len() < 5 {
        return None;
    }
    if payload[0] & 0x80 == 0 {
        return None; // short header: no version present, not classifiable here
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    if version == QUIC_V1 || version == QUIC_V2 || is_quic_draft_version(version) {
        Some(AppId::Quic)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(dst_port: u16, protocol: Protocol) -> FiveTuple {
        FiveTuple {
            src_addr: "10.1.0.5".parse().unwrap(),
            dst_addr: "203.0.113.10".parse().unwrap(),
            src_port: 33000,
            dst_port,
            protocol,
        }
    }

    #[test]
    fn well_known_port_classifies_without_payload_inspection() {
        let table = ClassifierTable::new();
        let (app, qos) = table.classify(&tuple(80, Protocol::Tcp), &[]);
        assert_eq!(app, AppId::Http);
        assert_eq!(qos, QosClass::Default);
    }

    #[test]
    fn quic_v1_over_udp_443_is_detected() {
        let table = ClassifierTable::new();
        let mut payload = vec![0x80];
        payload.extend_from_slice(&QUIC_V1.to_be_bytes());
        let (app, _) = table.classify(&tuple(443, Protocol::Udp), &payload);
        assert_eq!(app, AppId::Quic);
    }

    #[test]
    fn short_header_quic_udp_443_is_unknown() {
        let table = ClassifierTable::new();
        let payload = vec![0x40, 0, 0, 0, 0];
        let (app, _) = table.classify(&tuple(443, Protocol::Udp), &payload);
        assert_eq!(app, AppId::Unknown);
    }

    #[test]
    fn tls_handshake_over_tcp_443_is_generic_without_curated_match() {
        let table = ClassifierTable::new();
        let payload = vec![0x16, 0x03, 0x01];
        let (app, qos) = table.classify(&tuple(443, Protocol::Tcp), &payload);
        assert_eq!(app, AppId::TlsGeneric);
        assert_eq!(qos, QosClass::Default);
    }

    #[test]
    fn tls_handshake_to_curated_prefix_is_classified_as_collab() {
        let mut table = ClassifierTable::new();
        table.install_collab_prefix("203.0.113.0/24".parse().unwrap());
        let payload = vec![0x16, 0x03, 0x01];
        let (app, qos) = table.classify(&tuple(443, Protocol::Tcp), &payload);
        assert_eq!(app, AppId::TlsCollab);
        assert_eq!(qos, QosClass::Business);
    }

    #[test]
    fn unknown_port_yields_app_unknown_and_default_qos() {
        let table = ClassifierTable::new();
        let (app, qos) = table.classify(&tuple(9999, Protocol::Tcp), &[]);
        assert_eq!(app, AppId::Unknown);
        assert_eq!(qos, QosClass::Default);
    }
}
