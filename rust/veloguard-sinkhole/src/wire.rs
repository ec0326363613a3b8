//! Outbound packet building
//!
//! Packets written back to the tun device always travel from the remote
//! side to the local side; callers pass addresses already swapped.

use crate::checksum;
use crate::packet::{
    TcpFlags, TcpOptions, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN,
};
use bytes::{BufMut, BytesMut};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};

pub const DEFAULT_TTL: u8 = 64;

static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Fields of an outbound TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
    pub payload: &'a [u8],
}

fn header_len(addr: &IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => IPV4_HEADER_LEN,
        IpAddr::V6(_) => IPV6_HEADER_LEN,
    }
}

fn put_ip_header(buf: &mut BytesMut, src: IpAddr, dst: IpAddr, protocol: u8, payload_len: usize) {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let start = buf.len();
            let total = (IPV4_HEADER_LEN + payload_len) as u16;
            buf.put_u8(0x45);
            buf.put_u8(0);
            buf.put_u16(total);
            buf.put_u16(IP_ID.fetch_add(1, Ordering::Relaxed));
            buf.put_u16(0x4000);
            buf.put_u8(DEFAULT_TTL);
            buf.put_u8(protocol);
            buf.put_u16(0);
            buf.put_slice(&s.octets());
            buf.put_slice(&d.octets());
            let c = checksum::checksum(&buf[start..start + IPV4_HEADER_LEN]);
            buf[start + 10..start + 12].copy_from_slice(&c.to_be_bytes());
        }
        _ => {
            buf.put_u32(0x6000_0000);
            buf.put_u16(payload_len as u16);
            buf.put_u8(protocol);
            buf.put_u8(DEFAULT_TTL);
            buf.put_slice(&v6_octets(src));
            buf.put_slice(&v6_octets(dst));
        }
    }
}

fn v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V6(a) => a.octets(),
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
    }
}

/// Encode MSS and window scale, padded to a 32-bit boundary with EOL.
pub fn encode_tcp_options(options: &TcpOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    if let Some(mss) = options.mss {
        out.extend_from_slice(&[2, 4]);
        out.extend_from_slice(&mss.to_be_bytes());
    }
    if let Some(ws) = options.window_scale {
        out.extend_from_slice(&[3, 3, ws]);
    }
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

/// Build a full IP packet carrying one TCP segment.
pub fn build_tcp(src: IpAddr, dst: IpAddr, seg: &TcpSegment<'_>) -> BytesMut {
    let options = encode_tcp_options(&seg.options);
    let tcp_len = TCP_HEADER_LEN + options.len() + seg.payload.len();
    let ip_len = header_len(&src);
    let mut buf = BytesMut::with_capacity(ip_len + tcp_len);

    put_ip_header(&mut buf, src, dst, IPPROTO_TCP, tcp_len);

    let start = buf.len();
    buf.put_u16(seg.sport);
    buf.put_u16(seg.dport);
    buf.put_u32(seg.seq);
    buf.put_u32(if seg.flags.ack { seg.ack } else { 0 });
    buf.put_u8((((TCP_HEADER_LEN + options.len()) / 4) as u8) << 4);
    buf.put_u8(seg.flags.to_byte());
    buf.put_u16(seg.window);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(&options);
    buf.put_slice(seg.payload);

    let c = checksum::transport_checksum(src, dst, IPPROTO_TCP, &buf[start..]);
    buf[start + 16..start + 18].copy_from_slice(&c.to_be_bytes());
    buf
}

/// Build a full IP packet carrying one UDP datagram.
pub fn build_udp(src: IpAddr, dst: IpAddr, sport: u16, dport: u16, payload: &[u8]) -> BytesMut {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(header_len(&src) + udp_len);

    put_ip_header(&mut buf, src, dst, IPPROTO_UDP, udp_len);

    let start = buf.len();
    buf.put_u16(sport);
    buf.put_u16(dport);
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);

    let c = match checksum::transport_checksum(src, dst, IPPROTO_UDP, &buf[start..]) {
        0 => 0xFFFF,
        c => c,
    };
    buf[start + 6..start + 8].copy_from_slice(&c.to_be_bytes());
    buf
}

/// Wrap an already-checksummed ICMP or ICMPv6 message in an IP header.
pub fn build_icmp(src: IpAddr, dst: IpAddr, message: &[u8]) -> BytesMut {
    let protocol = match src {
        IpAddr::V4(_) => IPPROTO_ICMP,
        IpAddr::V6(_) => IPPROTO_ICMPV6,
    };
    let mut buf = BytesMut::with_capacity(header_len(&src) + message.len());
    put_ip_header(&mut buf, src, dst, protocol, message.len());
    buf.put_slice(message);
    buf
}

/// Recompute the checksum of an ICMP message in place.
///
/// ICMPv6 includes the pseudo-header; ICMPv4 covers the message only.
pub fn fix_icmp_checksum(src: IpAddr, dst: IpAddr, message: &mut [u8]) {
    if message.len() < 4 {
        return;
    }
    message[2] = 0;
    message[3] = 0;
    let c = match src {
        IpAddr::V4(_) => checksum::checksum(message),
        IpAddr::V6(_) => checksum::transport_checksum(src, dst, IPPROTO_ICMPV6, message),
    };
    message[2..4].copy_from_slice(&c.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode, Transport};

    #[test]
    fn syn_ack_carries_mss_and_window_scale() {
        let src: IpAddr = "93.184.216.34".parse().unwrap();
        let dst: IpAddr = "10.0.0.2".parse().unwrap();
        let seg = TcpSegment {
            sport: 443,
            dport: 40000,
            seq: 7,
            ack: 1001,
            flags: TcpFlags::syn_ack(),
            window: 1024,
            options: TcpOptions { mss: Some(9960), window_scale: Some(7) },
            payload: &[],
        };
        let raw = build_tcp(src, dst, &seg);
        assert_eq!(raw.len(), IPV4_HEADER_LEN + TCP_HEADER_LEN + 8);
        assert_eq!(checksum::checksum(&raw[..IPV4_HEADER_LEN]), 0);
        assert_eq!(
            checksum::transport_checksum(src, dst, IPPROTO_TCP, &raw[IPV4_HEADER_LEN..]),
            0
        );

        let pkt = decode(&raw, true).unwrap();
        let tcp = pkt.tcp().unwrap();
        assert_eq!(tcp.ack, 1001);
        assert_eq!(tcp.options.mss, Some(9960));
        assert_eq!(tcp.options.window_scale, Some(7));
    }

    #[test]
    fn ack_field_zero_without_ack_flag() {
        let a: IpAddr = "fd00::1".parse().unwrap();
        let b: IpAddr = "fd00::2".parse().unwrap();
        let seg = TcpSegment {
            sport: 1,
            dport: 2,
            seq: 5,
            ack: 99,
            flags: TcpFlags::rst_only(),
            window: 0,
            options: TcpOptions::default(),
            payload: &[],
        };
        let raw = build_tcp(a, b, &seg);
        let pkt = decode(&raw, true).unwrap();
        assert_eq!(pkt.tcp().unwrap().ack, 0);
        assert_eq!(checksum::transport_checksum(a, b, IPPROTO_TCP, pkt.transport_bytes()), 0);
    }

    #[test]
    fn udp_v6_checksum_verifies() {
        let a: IpAddr = "fd00::1".parse().unwrap();
        let b: IpAddr = "fd00::2".parse().unwrap();
        let raw = build_udp(a, b, 53, 5353, b"answer");
        let pkt = decode(&raw, true).unwrap();
        assert!(matches!(pkt.transport, Transport::Udp(_)));
        assert_eq!(checksum::transport_checksum(a, b, IPPROTO_UDP, pkt.transport_bytes()), 0);
    }

    #[test]
    fn icmpv6_checksum_uses_pseudo_header() {
        let a: IpAddr = "fd00::1".parse().unwrap();
        let b: IpAddr = "fd00::2".parse().unwrap();
        let mut msg = vec![129, 0, 0, 0, 0x12, 0x34, 0, 1, b'p', b'i', b'n', b'g'];
        fix_icmp_checksum(a, b, &mut msg);
        assert_eq!(checksum::transport_checksum(a, b, IPPROTO_ICMPV6, &msg), 0);

        let raw = build_icmp(a, b, &msg);
        assert_eq!(raw[6], IPPROTO_ICMPV6);
        assert_eq!(&raw[IPV6_HEADER_LEN..], &msg[..]);
    }

    #[test]
    fn ip_ids_increase() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let first = build_udp(a, a, 1, 2, &[]);
        let second = build_udp(a, a, 1, 2, &[]);
        let id = |p: &BytesMut| u16::from_be_bytes([p[4], p[5]]);
        assert_ne!(id(&first), id(&second));
    }
}
