//! Ethernet/IPv4/IPv6/UDP/TCP/VXLAN parsing and in-place header rewriting
//! (spec §4.1 "VXLAN... VNI extracted", §4.7 "checksum is recomputed
//! (incremental update required)", §4.8, §6 "Wire formats (bit-exact)").
//!
//! A hand-rolled fixed-offset parser rather than a general parsing crate:
//! the pipeline only ever needs a handful of fields (5-tuple, ToS/traffic
//! class, VNI) per packet and the per-packet budget is a few hundred
//! nanoseconds (spec §1), so a dependency-free byte-offset walk is the
//! right tool, the same tradeoff [`crate::wire`] makes for checksums.
//! IPv6 extension headers are not walked — only the fixed 40-byte base
//! header is parsed, sufficient for the 5-tuple this pipeline keys on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::fivetuple::{FiveTuple, Protocol};
use crate::metadata::QosClass;
use crate::qos;
use crate::wire;

pub const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
/// VXLAN's registered UDP destination port (spec §2, §4.1, RFC 7348).
pub const VXLAN_UDP_PORT: u16 = 4789;
const VXLAN_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    Unsupported,
}

/// A VXLAN carrier frame's decapsulated VNI, plus where the inner Ethernet
/// frame begins (spec §4.1: "the outer headers (ip+udp+vxlan) are stripped
/// before forwarding").
#[derive(Debug, Clone, Copy)]
pub struct VxlanCarrier {
    pub vni: u32,
    pub inner_eth_offset: usize,
}

/// The fields the pipeline needs out of one parse pass. Offsets are into
/// the original buffer; nothing here is copied.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket {
    pub ip_version: IpVersion,
    pub ip_header_offset: usize,
    pub ip_header_len: usize,
    pub l4_offset: usize,
    pub l4_header_len: usize,
    pub payload_offset: usize,
    pub five_tuple: FiveTuple,
    pub vxlan: Option<VxlanCarrier>,
    /// Raw TCP flags byte (offset 13 of the TCP header), `None` for
    /// non-TCP traffic. Used to detect FIN/RST for the session-closing
    /// transition (spec §4.2).
    pub tcp_flags: Option<u8>,
}

/// TCP FIN flag (RFC 9293 §3.1).
pub const TCP_FLAG_FIN: u8 = 0x01;
/// TCP RST flag (RFC 9293 §3.1).
pub const TCP_FLAG_RST: u8 = 0x04;

impl ParsedPacket {
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        data.get(self.payload_offset..).unwrap_or(&[])
    }
}

/// Parses Ethernet + IPv4-or-IPv6 + TCP/UDP starting at offset 0. On a
/// VXLAN carrier frame (UDP/4789), [`ParsedPacket::vxlan`] is set but the
/// returned 5-tuple still describes the *outer* frame; callers that want
/// the inner tenant traffic re-parse from `vxlan.inner_eth_offset` (spec
/// §4.1: VNI drives tenant classification, the inner frame drives every
/// later stage).
pub fn parse_ethernet_frame(data: &[u8]) -> Result<ParsedPacket, ParseError> {
    if data.len() < ETH_HEADER_LEN {
        return Err(ParseError::Truncated);
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(data, ETH_HEADER_LEN),
        ETHERTYPE_IPV6 => parse_ipv6(data, ETH_HEADER_LEN),
        _ => Err(ParseError::Unsupported),
    }
}

fn parse_ipv4(data: &[u8], offset: usize) -> Result<ParsedPacket, ParseError> {
    if data.len() < offset + 20 {
        return Err(ParseError::Truncated);
    }
    let version_ihl = data[offset];
    if version_ihl >> 4 != 4 {
        return Err(ParseError::Unsupported);
    }
    let ihl = (version_ihl & 0x0F) as usize * 4;
    if ihl < 20 || data.len() < offset + ihl {
        return Err(ParseError::Truncated);
    }
    let protocol_num = data[offset + 9];
    let src = Ipv4Addr::new(data[offset + 12], data[offset + 13], data[offset + 14], data[offset + 15]);
    let dst = Ipv4Addr::new(data[offset + 16], data[offset + 17], data[offset + 18], data[offset + 19]);

    let l4_offset = offset + ihl;
    finish_parse(data, IpVersion::V4, offset, ihl, l4_offset, protocol_num, IpAddr::V4(src), IpAddr::V4(dst))
}

fn parse_ipv6(data: &[u8], offset: usize) -> Result<ParsedPacket, ParseError> {
    if data.len() < offset + IPV6_HEADER_LEN {
        return Err(ParseError::Truncated);
    }
    let next_header = data[offset + 6];
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&data[offset + 8..offset + 24]).unwrap());
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&data[offset + 24..offset + 40]).unwrap());

    let l4_offset = offset + IPV6_HEADER_LEN;
    finish_parse(
        data,
        IpVersion::V6,
        offset,
        IPV6_HEADER_LEN,
        l4_offset,
        next_header,
        IpAddr::V6(src),
        IpAddr::V6(dst),
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_parse(
    data: &[u8],
    ip_version: IpVersion,
    ip_header_offset: usize,
    ip_header_len: usize,
    l4_offset: usize,
    protocol_num: u8,
    src_addr: IpAddr,
    dst_addr: IpAddr,
) -> Result<ParsedPacket, ParseError> {
    let protocol = Protocol::from_ip_number(protocol_num);

    let (src_port, dst_port, l4_header_len, tcp_flags) = match protocol {
        Protocol::Tcp => {
            if data.len() < l4_offset + 20 {
                return Err(ParseError::Truncated);
            }
            let sport = u16::from_be_bytes([data[l4_offset], data[l4_offset + 1]]);
            let dport = u16::from_be_bytes([data[l4_offset + 2], data[l4_offset + 3]]);
            let data_offset = (data[l4_offset + 12] >> 4) as usize * 4;
            if data_offset < 20 || data.len() < l4_offset + data_offset {
                return Err(ParseError::Truncated);
            }
            (sport, dport, data_offset, Some(data[l4_offset + 13]))
        }
        Protocol::Udp => {
            if data.len() < l4_offset + 8 {
                return Err(ParseError::Truncated);
            }
            let sport = u16::from_be_bytes([data[l4_offset], data[l4_offset + 1]]);
            let dport = u16::from_be_bytes([data[l4_offset + 2], data[l4_offset + 3]]);
            (sport, dport, 8, None)
        }
        Protocol::Other(_) => (0, 0, 0, None),
    };

    let payload_offset = l4_offset + l4_header_len;

    let vxlan = if protocol == Protocol::Udp && dst_port == VXLAN_UDP_PORT {
        parse_vxlan(data, payload_offset)
    } else {
        None
    };

    Ok(ParsedPacket {
        ip_version,
        ip_header_offset,
        ip_header_len,
        l4_offset,
        l4_header_len,
        payload_offset,
        five_tuple: FiveTuple { src_addr, dst_addr, src_port, dst_port, protocol },
        vxlan,
        tcp_flags,
    })
}

/// Parses the 8-byte VXLAN header (RFC 7348 §5): a flags byte with the
/// I-flag (`0x08`), a reserved byte, the 24-bit VNI, and a final reserved
/// byte.
fn parse_vxlan(data: &[u8], offset: usize) -> Option<VxlanCarrier> {
    if data.len() < offset + VXLAN_HEADER_LEN {
        return None;
    }
    let flags = data[offset];
    if flags & 0x08 == 0 {
        return None; // I-flag unset: no valid VNI present.
    }
    let vni = u32::from_be_bytes([0, data[offset + 4], data[offset + 5], data[offset + 6]]);
    Some(VxlanCarrier { vni, inner_eth_offset: offset + VXLAN_HEADER_LEN })
}

/// Rewrites an IPv4 packet's source address and L4 source port in place
/// for NAT44 (spec §4.7). IPv6 is out of scope for NAT (spec §9 Open
/// Question: "the present spec mandates IPv4 NAT only").
pub fn rewrite_ipv4_nat_source(data: &mut [u8], parsed: &ParsedPacket, new_addr: Ipv4Addr, new_port: u16) {
    debug_assert_eq!(parsed.ip_version, IpVersion::V4);
    let ip_off = parsed.ip_header_offset;

    let old_addr = u32::from_be_bytes(data[ip_off + 12..ip_off + 16].try_into().unwrap());
    let new_addr_u32 = u32::from_be_bytes(new_addr.octets());
    data[ip_off + 12..ip_off + 16].copy_from_slice(&new_addr.octets());

    let ip_csum_off = ip_off + 10;
    let old_ip_csum = u16::from_be_bytes([data[ip_csum_off], data[ip_csum_off + 1]]);
    let new_ip_csum = wire::incremental_update_u32(old_ip_csum, old_addr, new_addr_u32);
    data[ip_csum_off..ip_csum_off + 2].copy_from_slice(&new_ip_csum.to_be_bytes());

    let l4_off = parsed.l4_offset;
    let old_port = u16::from_be_bytes([data[l4_off], data[l4_off + 1]]);
    data[l4_off..l4_off + 2].copy_from_slice(&new_port.to_be_bytes());

    match parsed.five_tuple.protocol {
        Protocol::Udp => {
            let csum_off = l4_off + 6;
            data[csum_off] = 0;
            data[csum_off + 1] = 0;
        }
        Protocol::Tcp => {
            let csum_off = l4_off + 16;
            let old_csum = u16::from_be_bytes([data[csum_off], data[csum_off + 1]]);
            let c1 = wire::incremental_update_u32(old_csum, old_addr, new_addr_u32);
            let c2 = wire::incremental_update(c1, old_port, new_port);
            data[csum_off..csum_off + 2].copy_from_slice(&c2.to_be_bytes());
        }
        Protocol::Other(_) => {}
    }
}

/// Rewrites an IPv4 packet's destination address and L4 destination port
/// in place, reversing a NAT44 translation for return-direction traffic
/// (spec §4.7: "return-direction packets are matched on the external
/// 3-tuple and reversed").
pub fn rewrite_ipv4_nat_destination(data: &mut [u8], parsed: &ParsedPacket, new_addr: Ipv4Addr, new_port: u16) {
    debug_assert_eq!(parsed.ip_version, IpVersion::V4);
    let ip_off = parsed.ip_header_offset;

    let old_addr = u32::from_be_bytes(data[ip_off + 16..ip_off + 20].try_into().unwrap());
    let new_addr_u32 = u32::from_be_bytes(new_addr.octets());
    data[ip_off + 16..ip_off + 20].copy_from_slice(&new_addr.octets());

    let ip_csum_off = ip_off + 10;
    let old_ip_csum = u16::from_be_bytes([data[ip_csum_off], data[ip_csum_off + 1]]);
    let new_ip_csum = wire::incremental_update_u32(old_ip_csum, old_addr, new_addr_u32);
    data[ip_csum_off..ip_csum_off + 2].copy_from_slice(&new_ip_csum.to_be_bytes());

    let l4_off = parsed.l4_offset;
    let old_port = u16::from_be_bytes([data[l4_off + 2], data[l4_off + 3]]);
    data[l4_off + 2..l4_off + 4].copy_from_slice(&new_port.to_be_bytes());

    match parsed.five_tuple.protocol {
        Protocol::Udp => {
            let csum_off = l4_off + 6;
            data[csum_off] = 0;
            data[csum_off + 1] = 0;
        }
        Protocol::Tcp => {
            let csum_off = l4_off + 16;
            let old_csum = u16::from_be_bytes([data[csum_off], data[csum_off + 1]]);
            let c1 = wire::incremental_update_u32(old_csum, old_addr, new_addr_u32);
            let c2 = wire::incremental_update(c1, old_port, new_port);
            data[csum_off..csum_off + 2].copy_from_slice(&c2.to_be_bytes());
        }
        Protocol::Other(_) => {}
    }
}

/// Rewrites an IPv4 packet's ToS byte's DSCP bits for `class`, preserving
/// ECN, and updates the IP header checksum incrementally (spec §4.8).
pub fn mark_dscp_ipv4(data: &mut [u8], parsed: &ParsedPacket, class: QosClass) {
    debug_assert_eq!(parsed.ip_version, IpVersion::V4);
    let ip_off = parsed.ip_header_offset;
    let version_ihl = data[ip_off];
    let old_tos = data[ip_off + 1];
    let new_tos = qos::mark_dscp(old_tos, class);
    data[ip_off + 1] = new_tos;

    let csum_off = ip_off + 10;
    let old_csum = u16::from_be_bytes([data[csum_off], data[csum_off + 1]]);
    let old_word = u16::from_be_bytes([version_ihl, old_tos]);
    let new_word = u16::from_be_bytes([version_ihl, new_tos]);
    let new_csum = wire::incremental_update(old_csum, old_word, new_word);
    data[csum_off..csum_off + 2].copy_from_slice(&new_csum.to_be_bytes());
}

/// Rewrites an IPv6 packet's traffic-class bits for `class`, preserving
/// ECN (spec §4.8's DSCP byte is IPv4's ToS upper six bits / IPv6's
/// traffic class — the same field by another name). The traffic class
/// spans the low nibble of byte 0 and the high nibble of byte 1 of the
/// base header; IPv6 has no header checksum to recompute.
pub fn mark_dscp_ipv6(data: &mut [u8], parsed: &ParsedPacket, class: QosClass) {
    debug_assert_eq!(parsed.ip_version, IpVersion::V6);
    let ip_off = parsed.ip_header_offset;
    let old_tc = ((data[ip_off] & 0x0F) << 4) | (data[ip_off + 1] >> 4);
    let new_tc = qos::mark_dscp(old_tc, class);
    data[ip_off] = (data[ip_off] & 0xF0) | (new_tc >> 4);
    data[ip_off + 1] = (data[ip_off + 1] & 0x0F) | (new_tc << 4);
}
