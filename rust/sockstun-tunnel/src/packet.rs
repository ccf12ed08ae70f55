//! Packet parsing and building using smoltcp wire types
//!
//! Parsing produces a borrowed view over the buffer read from the tun device.
//! Building produces owned IPv4/IPv6 TCP or UDP packets with all checksums
//! filled in.

use crate::error::{Result, TunnelError};
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const DEFAULT_MSS_V4: u16 = 536;
pub const DEFAULT_MSS_V6: u16 = 1220;

const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// Parsed view of one packet read from the tun device.
#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    pub transport: TransportInfo,
    /// Transport payload (TCP segment data or UDP datagram body)
    pub payload: &'a [u8],
    /// Length of the IP packet as declared by its header
    pub total_len: usize,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp,
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
}

impl ParsedPacket<'_> {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpInfo> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, TransportInfo::Tcp(t) if t.flags.syn && !t.flags.ack)
    }
}

/// Parse an IP packet
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>> {
    if data.is_empty() {
        return Err(TunnelError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = data[0] >> 4;
    match version {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        _ => Err(TunnelError::InvalidIpVersion(version)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(TunnelError::PacketTooShort {
            expected: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| TunnelError::malformed(format!("IPv4: {}", e)))?;
    if !pkt.verify_checksum() {
        return Err(TunnelError::malformed("IPv4: bad header checksum"));
    }
    if pkt.more_frags() || pkt.frag_offset() != 0 {
        return Err(TunnelError::Unsupported("IPv4 fragment".into()));
    }

    let header_len = pkt.header_len() as usize;
    let total_len = pkt.total_len() as usize;
    let protocol = pkt.next_header();
    let l4 = &data[header_len..total_len];
    let (transport, payload) = parse_transport(protocol, l4)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv4,
        src_addr: IpAddr::V4(pkt.src_addr()),
        dst_addr: IpAddr::V4(pkt.dst_addr()),
        protocol,
        transport,
        payload,
        total_len,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket<'_>> {
    if data.len() < IPV6_HEADER_LEN {
        return Err(TunnelError::PacketTooShort {
            expected: IPV6_HEADER_LEN,
            actual: data.len(),
        });
    }

    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| TunnelError::malformed(format!("IPv6: {}", e)))?;

    let protocol = pkt.next_header();
    if matches!(
        protocol,
        IpProtocol::HopByHop | IpProtocol::Ipv6Route | IpProtocol::Ipv6Frag | IpProtocol::Ipv6Opts
    ) {
        return Err(TunnelError::Unsupported(format!(
            "IPv6 extension header {}",
            protocol
        )));
    }

    let total_len = IPV6_HEADER_LEN + pkt.payload_len() as usize;
    let l4 = &data[IPV6_HEADER_LEN..total_len];
    let (transport, payload) = parse_transport(protocol, l4)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv6,
        src_addr: IpAddr::V6(pkt.src_addr()),
        dst_addr: IpAddr::V6(pkt.dst_addr()),
        protocol,
        transport,
        payload,
        total_len,
    })
}

fn parse_transport(protocol: IpProtocol, data: &[u8]) -> Result<(TransportInfo, &[u8])> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(data),
        IpProtocol::Udp => parse_udp(data),
        IpProtocol::Icmp | IpProtocol::Icmpv6 => Ok((TransportInfo::Icmp, data)),
        other => Ok((TransportInfo::Other(other.into()), data)),
    }
}

fn parse_tcp(data: &[u8]) -> Result<(TransportInfo, &[u8])> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| TunnelError::malformed(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let mss = scan_mss(&data[TCP_HEADER_LEN..header_len]);

    let info = TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
    };
    Ok((TransportInfo::Tcp(info), &data[header_len..]))
}

fn scan_mss(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            kind => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 || i + len > opts.len() {
                    return None;
                }
                if kind == 2 && len == 4 {
                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                i += len;
            }
        }
    }
    None
}

fn parse_udp(data: &[u8]) -> Result<(TransportInfo, &[u8])> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| TunnelError::malformed(format!("UDP: {}", e)))?;

    let len = pkt.len() as usize;
    let info = UdpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
    };
    Ok((TransportInfo::Udp(info), &data[UDP_HEADER_LEN..len]))
}

/// Largest TCP payload that fits in one packet of the given MTU.
pub fn mss_for_mtu(ipv6: bool, mtu: u32) -> u16 {
    let overhead = if ipv6 {
        IPV6_HEADER_LEN + TCP_HEADER_LEN
    } else {
        IPV4_HEADER_LEN + TCP_HEADER_LEN
    } as u32;
    mtu.saturating_sub(overhead).min(u16::MAX as u32) as u16
}

/// Header fields for a TCP segment to be written to the tun device.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Advertised on SYN segments only
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Build an IPv4 or IPv6 TCP packet
pub fn build_tcp(segment: &TcpSegment<'_>) -> Result<Vec<u8>> {
    let opts_len = if segment.flags.syn && segment.mss.is_some() { 4 } else { 0 };
    let tcp_len = TCP_HEADER_LEN + opts_len + segment.payload.len();

    let (mut pkt, start) = ip_header(segment.src.ip(), segment.dst.ip(), IpProtocol::Tcp, tcp_len)?;

    {
        let tcp = &mut pkt[start..];
        tcp[0..2].copy_from_slice(&segment.src.port().to_be_bytes());
        tcp[2..4].copy_from_slice(&segment.dst.port().to_be_bytes());
        tcp[4..8].copy_from_slice(&segment.seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&segment.ack.to_be_bytes());
        tcp[12] = (((TCP_HEADER_LEN + opts_len) / 4) as u8) << 4;
        tcp[13] = segment.flags.to_byte();
        tcp[14..16].copy_from_slice(&segment.window.to_be_bytes());

        if let (true, Some(mss)) = (opts_len > 0, segment.mss) {
            tcp[20] = 2;
            tcp[21] = 4;
            tcp[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        tcp[TCP_HEADER_LEN + opts_len..].copy_from_slice(segment.payload);
    }

    let cksum = transport_checksum(segment.src.ip(), segment.dst.ip(), IpProtocol::Tcp, &pkt[start..]);
    pkt[start + 16..start + 18].copy_from_slice(&cksum.to_be_bytes());
    Ok(pkt)
}

/// Build an IPv4 or IPv6 UDP packet
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(TunnelError::malformed(format!("UDP payload of {} bytes", payload.len())));
    }

    let (mut pkt, start) = ip_header(src.ip(), dst.ip(), IpProtocol::Udp, udp_len)?;
    {
        let udp = &mut pkt[start..];
        udp[0..2].copy_from_slice(&src.port().to_be_bytes());
        udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[UDP_HEADER_LEN..].copy_from_slice(payload);
    }

    let cksum = match transport_checksum(src.ip(), dst.ip(), IpProtocol::Udp, &pkt[start..]) {
        0 => 0xFFFF,
        c => c,
    };
    pkt[start + 6..start + 8].copy_from_slice(&cksum.to_be_bytes());
    Ok(pkt)
}

/// Allocate a packet and fill in its IP header; returns the buffer and the
/// offset of the transport header.
fn ip_header(src: IpAddr, dst: IpAddr, protocol: IpProtocol, l4_len: usize) -> Result<(Vec<u8>, usize)> {
    static IP_ID: AtomicU16 = AtomicU16::new(1);

    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = IPV4_HEADER_LEN + l4_len;
            if total_len > u16::MAX as usize {
                return Err(TunnelError::malformed(format!("IPv4 packet of {} bytes", total_len)));
            }
            let mut pkt = vec![0u8; total_len];
            pkt[0] = 0x45;
            pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
            pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
            // don't fragment
            pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
            pkt[8] = DEFAULT_TTL;
            pkt[9] = protocol.into();
            pkt[12..16].copy_from_slice(&s.octets());
            pkt[16..20].copy_from_slice(&d.octets());
            let cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
            pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
            Ok((pkt, IPV4_HEADER_LEN))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if l4_len > u16::MAX as usize {
                return Err(TunnelError::malformed(format!("IPv6 payload of {} bytes", l4_len)));
            }
            let mut pkt = vec![0u8; IPV6_HEADER_LEN + l4_len];
            pkt[0] = 0x60;
            pkt[4..6].copy_from_slice(&(l4_len as u16).to_be_bytes());
            pkt[6] = protocol.into();
            pkt[7] = DEFAULT_TTL;
            pkt[8..24].copy_from_slice(&s.octets());
            pkt[24..40].copy_from_slice(&d.octets());
            Ok((pkt, IPV6_HEADER_LEN))
        }
        _ => Err(TunnelError::malformed(format!(
            "mixed address families {} -> {}",
            src, dst
        ))),
    }
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: IpProtocol, data: &[u8]) -> u16 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum_words(sum_words(0, &s.octets()), &d.octets()),
        (IpAddr::V6(s), IpAddr::V6(d)) => sum_words(sum_words(0, &s.octets()), &d.octets()),
        _ => 0,
    };
    sum = sum.wrapping_add(u8::from(protocol) as u32);
    sum = sum.wrapping_add(data.len() as u32);
    fold(sum_words(sum, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), port)
    }

    fn syn(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
        build_tcp(&TcpSegment {
            src,
            dst,
            seq: 1000,
            ack: 0,
            flags: TcpFlags::syn_only(),
            window: 65535,
            mss: Some(1460),
            payload: &[],
        })
        .unwrap()
    }

    #[test]
    fn test_parse_ipv4_syn() {
        let src = v4([10, 0, 0, 2], 5000);
        let dst = v4([93, 184, 216, 34], 80);
        let pkt = syn(src, dst);

        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.version, IpVersion::Ipv4);
        assert_eq!(parsed.src_socket(), Some(src));
        assert_eq!(parsed.dst_socket(), Some(dst));
        assert!(parsed.is_tcp_syn());
        let tcp = parsed.tcp().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.mss, Some(1460));
        assert!(parsed.payload.is_empty());
        assert_eq!(parsed.total_len, pkt.len());
    }

    #[test]
    fn test_ipv4_checksums_valid() {
        let src = v4([10, 0, 0, 2], 5000);
        let dst = v4([1, 1, 1, 1], 443);
        let pkt = build_tcp(&TcpSegment {
            src,
            dst,
            seq: 7,
            ack: 9,
            flags: TcpFlags::psh_ack(),
            window: 1024,
            mss: None,
            payload: b"hello",
        })
        .unwrap();

        // Header checksum over a valid header folds to zero
        assert_eq!(checksum(&pkt[..IPV4_HEADER_LEN]), 0);
        assert_eq!(
            transport_checksum(src.ip(), dst.ip(), IpProtocol::Tcp, &pkt[IPV4_HEADER_LEN..]),
            0
        );
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let src = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)), 40000);
        let dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0, 0, 0, 0, 0, 0x8888)), 53);
        let pkt = build_udp(src, dst, b"query").unwrap();

        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.version, IpVersion::Ipv6);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_socket(), Some(src));
        assert_eq!(parsed.dst_socket(), Some(dst));
        assert_eq!(parsed.payload, b"query");

        let udp = &pkt[IPV6_HEADER_LEN..];
        assert_eq!(transport_checksum(src.ip(), dst.ip(), IpProtocol::Udp, udp), 0);
    }

    #[test]
    fn test_ignores_trailing_bytes() {
        let mut pkt = build_udp(v4([10, 0, 0, 2], 1234), v4([8, 8, 8, 8], 53), b"abc").unwrap();
        pkt.extend_from_slice(&[0xAA; 6]);
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.payload, b"abc");
    }

    #[test]
    fn test_reject_truncated() {
        let pkt = syn(v4([10, 0, 0, 2], 5000), v4([1, 2, 3, 4], 80));
        for len in [0, 1, 19, 20, 30, pkt.len() - 1] {
            let err = parse_packet(&pkt[..len]).unwrap_err();
            assert!(err.is_malformed(), "len {} gave {:?}", len, err);
        }
    }

    #[test]
    fn test_reject_bad_version() {
        let mut pkt = syn(v4([10, 0, 0, 2], 5000), v4([1, 2, 3, 4], 80));
        pkt[0] = 0x55;
        assert!(matches!(parse_packet(&pkt), Err(TunnelError::InvalidIpVersion(5))));
    }

    #[test]
    fn test_reject_inconsistent_length() {
        let mut pkt = build_udp(v4([10, 0, 0, 2], 1234), v4([8, 8, 8, 8], 53), b"abc").unwrap();
        // UDP length larger than the IP payload
        pkt[IPV4_HEADER_LEN + 4..IPV4_HEADER_LEN + 6].copy_from_slice(&64u16.to_be_bytes());
        assert!(parse_packet(&pkt).unwrap_err().is_malformed());
    }

    #[test]
    fn test_reject_fragment() {
        let mut pkt = build_udp(v4([10, 0, 0, 2], 1234), v4([8, 8, 8, 8], 53), b"abc").unwrap();
        // more-fragments set, recompute header checksum
        pkt[6] = 0x20;
        pkt[10] = 0;
        pkt[11] = 0;
        let cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
        pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
        assert!(matches!(parse_packet(&pkt), Err(TunnelError::Unsupported(_))));
    }

    #[test]
    fn test_reject_mixed_families() {
        let src = v4([10, 0, 0, 2], 1);
        let dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 2);
        assert!(build_udp(src, dst, b"x").is_err());
    }

    #[test]
    fn test_scan_mss_bounds() {
        assert_eq!(scan_mss(&[2, 4, 0x05, 0xb4]), Some(1460));
        assert_eq!(scan_mss(&[1, 1, 2, 4, 0x02, 0x18]), Some(536));
        assert_eq!(scan_mss(&[3, 0, 2, 4, 0x05, 0xb4]), None);
        assert_eq!(scan_mss(&[2, 4, 0x05]), None);
        assert_eq!(scan_mss(&[]), None);
    }

    #[test]
    fn test_mss_for_mtu() {
        assert_eq!(mss_for_mtu(false, 1500), 1460);
        assert_eq!(mss_for_mtu(true, 1500), 1440);
        assert_eq!(mss_for_mtu(false, 8500), 8460);
    }
}
