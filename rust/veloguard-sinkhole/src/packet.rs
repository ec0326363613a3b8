//! Inbound IP packet decoding
//!
//! Every read goes through [`ByteCursor`], so a truncated or lying header
//! produces an error instead of an out-of-bounds access.

use crate::checksum;
use crate::error::{Result, SinkholeError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPPROTO_HOPOPTS: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IGMP: u8 = 2;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ROUTING: u8 = 43;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_ESP: u8 = 50;
pub const IPPROTO_AH: u8 = 51;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_NONE: u8 = 59;
pub const IPPROTO_DSTOPTS: u8 = 60;
pub const IPPROTO_MH: u8 = 135;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

/// Largest window-scale shift allowed by RFC 7323.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Protocols that are passed through silently without being reported as anomalies.
pub fn is_expected_protocol(protocol: u8) -> bool {
    matches!(
        protocol,
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMP | IPPROTO_ICMPV6 | IPPROTO_HOPOPTS | IPPROTO_IGMP | IPPROTO_ESP
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => IPV4_HEADER_LEN,
            IpVersion::V6 => IPV6_HEADER_LEN,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst_only() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }

    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        if self.urg {
            flags |= 0x20;
        }
        flags
    }
}

/// Compact flag string in the packet-log format, e.g. `"SA"` for SYN+ACK.
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, c) in [
            (self.syn, 'S'),
            (self.ack, 'A'),
            (self.psh, 'P'),
            (self.fin, 'F'),
            (self.rst, 'R'),
            (self.urg, 'U'),
        ] {
            if set {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, options included.
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sport: u16,
    pub dport: u16,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub id: u16,
    pub seq: u16,
}

impl IcmpHeader {
    pub fn is_echo_request(&self, version: IpVersion) -> bool {
        match version {
            IpVersion::V4 => self.icmp_type == 8,
            IpVersion::V6 => self.icmp_type == 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
    Other,
}

/// A decoded view over an inbound IP packet.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    pub version: IpVersion,
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub transport: Transport,
    /// Whole IP packet, trimmed to the length announced in its header.
    pub data: &'a [u8],
    pub transport_offset: usize,
    pub payload_offset: usize,
}

impl<'a> Packet<'a> {
    pub fn sport(&self) -> u16 {
        match self.transport {
            Transport::Tcp(t) => t.sport,
            Transport::Udp(u) => u.sport,
            Transport::Icmp(i) => i.id,
            Transport::Other => 0,
        }
    }

    pub fn dport(&self) -> u16 {
        match self.transport {
            Transport::Tcp(t) => t.dport,
            Transport::Udp(u) => u.dport,
            Transport::Icmp(i) => i.id,
            Transport::Other => 0,
        }
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(t) => Some(t),
            _ => None,
        }
    }

    /// A connection-opening SYN (SYN set, ACK clear).
    pub fn is_syn(&self) -> bool {
        self.tcp().map(|t| t.flags.syn && !t.flags.ack).unwrap_or(false)
    }

    pub fn flags_string(&self) -> String {
        match &self.transport {
            Transport::Tcp(t) => t.flags.to_string(),
            _ => String::new(),
        }
    }

    /// Transport header and payload.
    pub fn transport_bytes(&self) -> &'a [u8] {
        &self.data[self.transport_offset..]
    }

    /// Bytes after the transport header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.payload_offset..]
    }
}

/// Bounds-checked big-endian reader.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(SinkholeError::PacketTooShort {
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let hi = self.u16()? as u32;
        let lo = self.u16()? as u32;
        Ok((hi << 16) | lo)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }
}

/// Decode a raw IP packet read from the tun device.
pub fn decode(data: &[u8], verify_checksum: bool) -> Result<Packet<'_>> {
    let first = *data.first().ok_or(SinkholeError::PacketTooShort { expected: 1, actual: 0 })?;
    match first >> 4 {
        4 => decode_ipv4(data, verify_checksum),
        6 => decode_ipv6(data),
        v => Err(SinkholeError::InvalidIpVersion(v)),
    }
}

fn decode_ipv4(data: &[u8], verify_checksum: bool) -> Result<Packet<'_>> {
    let mut cur = ByteCursor::new(data);
    let ver_ihl = cur.u8()?;
    cur.need(IPV4_HEADER_LEN - 1)?;
    let ihl = ((ver_ihl & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || ihl > data.len() {
        return Err(SinkholeError::MalformedPacket(format!("IPv4 header length {}", ihl)));
    }
    cur.skip(1)?;
    let total_len = cur.u16()? as usize;
    if total_len != data.len() {
        return Err(SinkholeError::MalformedPacket(format!(
            "IPv4 total length {} != {}",
            total_len,
            data.len()
        )));
    }
    cur.skip(2)?;
    let frag = cur.u16()?;
    let offset = frag & 0x1FFF;
    if frag & 0x2000 != 0 || offset != 0 {
        return Err(SinkholeError::Fragmented { offset });
    }
    cur.skip(1)?;
    let protocol = cur.u8()?;
    cur.skip(2)?;
    let src = Ipv4Addr::from(cur.u32()?);
    let dst = Ipv4Addr::from(cur.u32()?);

    if verify_checksum && checksum::checksum(&data[..ihl]) != 0 {
        return Err(SinkholeError::MalformedPacket("IPv4 header checksum".into()));
    }

    finish(IpVersion::V4, protocol, src.into(), dst.into(), data, ihl)
}

fn decode_ipv6(data: &[u8]) -> Result<Packet<'_>> {
    let mut cur = ByteCursor::new(data);
    cur.need(IPV6_HEADER_LEN)?;
    cur.skip(4)?;
    let plen = cur.u16()? as usize;
    let first_next = cur.u8()?;
    cur.skip(1)?;
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(cur.bytes(16)?).map_err(bad_addr)?);
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(cur.bytes(16)?).map_err(bad_addr)?);

    if IPV6_HEADER_LEN + plen > data.len() {
        return Err(SinkholeError::MalformedPacket(format!(
            "IPv6 payload length {} exceeds {}",
            plen,
            data.len() - IPV6_HEADER_LEN
        )));
    }
    let data = &data[..IPV6_HEADER_LEN + plen];

    let (protocol, offset) = walk_extension_headers(data, first_next)?;
    finish(IpVersion::V6, protocol, src.into(), dst.into(), data, offset)
}

fn bad_addr<E>(_: E) -> SinkholeError {
    SinkholeError::MalformedPacket("address".into())
}

/// Follow the IPv6 extension header chain to the upper-layer protocol.
///
/// When the chain does not end in TCP, UDP or ICMP the first next-header
/// value is reported with the payload directly after the fixed header.
fn walk_extension_headers(data: &[u8], first_next: u8) -> Result<(u8, usize)> {
    let mut next = first_next;
    let mut off = IPV6_HEADER_LEN;
    loop {
        let len = match next {
            IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS | IPPROTO_MH => {
                let mut c = ByteCursor::at(data, off + 1);
                (c.u8()? as usize + 1) * 8
            }
            IPPROTO_FRAGMENT => 8,
            IPPROTO_AH => {
                let mut c = ByteCursor::at(data, off + 1);
                (c.u8()? as usize + 2) * 4
            }
            _ => break,
        };
        let mut c = ByteCursor::at(data, off);
        let following = c.u8()?;
        if off + len > data.len() {
            return Err(SinkholeError::MalformedPacket(format!(
                "IPv6 extension header {} overruns packet",
                next
            )));
        }
        next = following;
        off += len;
    }

    match next {
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMP | IPPROTO_ICMPV6 => Ok((next, off)),
        _ => Ok((first_next, IPV6_HEADER_LEN)),
    }
}

fn finish<'a>(
    version: IpVersion,
    protocol: u8,
    src: IpAddr,
    dst: IpAddr,
    data: &'a [u8],
    transport_offset: usize,
) -> Result<Packet<'a>> {
    let mut cur = ByteCursor::at(data, transport_offset);
    let (transport, payload_offset) = match protocol {
        IPPROTO_TCP => {
            let tcp = decode_tcp(&mut cur)?;
            (Transport::Tcp(tcp), transport_offset + tcp.header_len)
        }
        IPPROTO_UDP => {
            cur.need(UDP_HEADER_LEN)?;
            let sport = cur.u16()?;
            let dport = cur.u16()?;
            let length = cur.u16()?;
            if (length as usize) < UDP_HEADER_LEN {
                return Err(SinkholeError::MalformedPacket(format!("UDP length {}", length)));
            }
            (
                Transport::Udp(UdpHeader { sport, dport, length }),
                transport_offset + UDP_HEADER_LEN,
            )
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            cur.need(ICMP_HEADER_LEN)?;
            let icmp = IcmpHeader {
                icmp_type: cur.u8()?,
                code: cur.u8()?,
                checksum: cur.u16()?,
                id: cur.u16()?,
                seq: cur.u16()?,
            };
            (Transport::Icmp(icmp), transport_offset + ICMP_HEADER_LEN)
        }
        _ => (Transport::Other, transport_offset),
    };

    Ok(Packet {
        version,
        protocol,
        src,
        dst,
        transport,
        data,
        transport_offset,
        payload_offset,
    })
}

fn decode_tcp(cur: &mut ByteCursor<'_>) -> Result<TcpHeader> {
    let start = cur.position();
    cur.need(TCP_HEADER_LEN)?;
    let sport = cur.u16()?;
    let dport = cur.u16()?;
    let seq = cur.u32()?;
    let ack = cur.u32()?;
    let header_len = ((cur.u8()? >> 4) as usize) * 4;
    let flags = TcpFlags::from_byte(cur.u8()?);
    let window = cur.u16()?;
    cur.skip(4)?;

    if header_len < TCP_HEADER_LEN || start + header_len > start + TCP_HEADER_LEN + cur.remaining() {
        return Err(SinkholeError::MalformedPacket(format!("TCP data offset {}", header_len)));
    }
    let options = decode_tcp_options(cur.bytes(header_len - TCP_HEADER_LEN)?);

    Ok(TcpHeader {
        sport,
        dport,
        seq,
        ack,
        header_len,
        flags,
        window,
        options,
    })
}

/// Parse the MSS and window-scale options. Unknown options are skipped by
/// their length byte; a length below two ends parsing.
pub fn decode_tcp_options(raw: &[u8]) -> TcpOptions {
    let mut opts = TcpOptions::default();
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            0 => break,
            1 => {
                i += 1;
                continue;
            }
            kind => {
                let Some(&len) = raw.get(i + 1) else { break };
                let len = len as usize;
                if len < 2 || i + len > raw.len() {
                    break;
                }
                match (kind, len) {
                    (2, 4) => opts.mss = Some(u16::from_be_bytes([raw[i + 2], raw[i + 3]])),
                    (3, 3) => opts.window_scale = Some(raw[i + 2].min(MAX_WINDOW_SCALE)),
                    _ => {}
                }
                i += len;
            }
        }
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, TcpSegment};

    fn v4(a: [u8; 4]) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(a))
    }

    fn sample_syn() -> Vec<u8> {
        let seg = TcpSegment {
            sport: 40000,
            dport: 443,
            seq: 1000,
            ack: 0,
            flags: TcpFlags { syn: true, ..Default::default() },
            window: 65535,
            options: TcpOptions { mss: Some(1460), window_scale: Some(7) },
            payload: &[],
        };
        wire::build_tcp(v4([10, 0, 0, 2]), v4([93, 184, 216, 34]), &seg).to_vec()
    }

    #[test]
    fn decodes_ipv4_tcp_syn() {
        let raw = sample_syn();
        let pkt = decode(&raw, true).unwrap();
        assert_eq!(pkt.version, IpVersion::V4);
        assert_eq!(pkt.protocol, IPPROTO_TCP);
        assert_eq!(pkt.sport(), 40000);
        assert_eq!(pkt.dport(), 443);
        assert!(pkt.is_syn());
        assert_eq!(pkt.flags_string(), "S");
        let tcp = pkt.tcp().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.options.mss, Some(1460));
        assert_eq!(tcp.options.window_scale, Some(7));
        assert!(pkt.payload().is_empty());
    }

    #[test]
    fn rejects_bad_version_and_length() {
        let mut raw = sample_syn();
        raw[0] = 0x55;
        assert!(matches!(decode(&raw, true), Err(SinkholeError::InvalidIpVersion(5))));

        let mut raw = sample_syn();
        raw.push(0);
        assert!(matches!(decode(&raw, true), Err(SinkholeError::MalformedPacket(_))));
    }

    #[test]
    fn rejects_fragments() {
        let mut raw = sample_syn();
        raw[6] |= 0x20;
        assert!(matches!(decode(&raw, false), Err(SinkholeError::Fragmented { offset: 0 })));
    }

    #[test]
    fn header_checksum_checked_only_when_asked() {
        let mut raw = sample_syn();
        raw[8] = 1;
        assert!(decode(&raw, true).is_err());
        assert!(decode(&raw, false).is_ok());
    }

    #[test]
    fn ipv6_walks_extension_headers() {
        let src: IpAddr = "fd00::2".parse().unwrap();
        let dst: IpAddr = "2001:db8::1".parse().unwrap();
        let plain = wire::build_udp(src, dst, 5353, 53, b"hello");
        let udp = &plain[IPV6_HEADER_LEN..];

        // Hop-by-hop (8 bytes) then destination options (16 bytes).
        let mut ext = vec![IPPROTO_DSTOPTS, 0, 1, 4, 0, 0, 0, 0];
        ext.extend_from_slice(&[IPPROTO_UDP, 1, 1, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut raw = plain[..IPV6_HEADER_LEN].to_vec();
        raw[6] = IPPROTO_HOPOPTS;
        let plen = (ext.len() + udp.len()) as u16;
        raw[4..6].copy_from_slice(&plen.to_be_bytes());
        raw.extend_from_slice(&ext);
        raw.extend_from_slice(udp);

        let pkt = decode(&raw, true).unwrap();
        assert_eq!(pkt.protocol, IPPROTO_UDP);
        assert_eq!(pkt.transport_offset, IPV6_HEADER_LEN + 24);
        assert_eq!(pkt.dport(), 53);
        assert_eq!(pkt.payload(), b"hello");
    }

    #[test]
    fn ipv6_esp_falls_back_to_first_header() {
        let src: IpAddr = "fd00::2".parse().unwrap();
        let dst: IpAddr = "fd00::1".parse().unwrap();
        let mut raw = wire::build_udp(src, dst, 1, 2, &[0u8; 8]).to_vec();
        raw[6] = IPPROTO_ESP;
        let pkt = decode(&raw, true).unwrap();
        assert_eq!(pkt.protocol, IPPROTO_ESP);
        assert_eq!(pkt.transport, Transport::Other);
        assert!(is_expected_protocol(pkt.protocol));
    }

    #[test]
    fn ipv6_payload_length_must_fit() {
        let src: IpAddr = "fd00::2".parse().unwrap();
        let mut raw = wire::build_udp(src, src, 1, 2, b"x").to_vec();
        raw[4..6].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(decode(&raw, true), Err(SinkholeError::MalformedPacket(_))));
    }

    #[test]
    fn tcp_options_stop_on_short_length() {
        let opts = decode_tcp_options(&[1, 1, 3, 3, 20, 8, 1, 2, 4, 5, 0xb4]);
        assert_eq!(opts.window_scale, Some(MAX_WINDOW_SCALE));
        assert_eq!(opts.mss, None);

        let opts = decode_tcp_options(&[2, 4, 0x05, 0xb4, 0, 3, 3, 2]);
        assert_eq!(opts.mss, Some(1460));
        assert_eq!(opts.window_scale, None);
    }

    #[test]
    fn truncated_transport_is_too_short() {
        let raw = sample_syn();
        let mut short = raw[..30].to_vec();
        short[2..4].copy_from_slice(&30u16.to_be_bytes());
        let c = checksum::checksum(&{
            let mut h = short[..20].to_vec();
            h[10] = 0;
            h[11] = 0;
            h
        });
        short[10..12].copy_from_slice(&c.to_be_bytes());
        assert!(matches!(decode(&short, true), Err(SinkholeError::PacketTooShort { .. })));
    }

    #[test]
    fn flags_display_order() {
        let f = TcpFlags {
            fin: true,
            ack: true,
            psh: true,
            ..Default::default()
        };
        assert_eq!(f.to_string(), "APF");
        assert_eq!(TcpFlags::from_byte(f.to_byte()), f);
    }

    #[test]
    fn flag_constructors_match_wire_bits() {
        assert_eq!(TcpFlags::syn_ack().to_byte(), 0x12);
        assert_eq!(TcpFlags::ack_only().to_byte(), 0x10);
        assert_eq!(TcpFlags::fin_ack().to_byte(), 0x11);
        assert_eq!(TcpFlags::rst_ack().to_byte(), 0x14);
        assert_eq!(TcpFlags::rst_only().to_byte(), 0x04);
        assert_eq!(TcpFlags::psh_ack().to_byte(), 0x18);
        assert_eq!(TcpFlags::from_byte(0x3F).to_byte(), 0x3F);
    }
}
