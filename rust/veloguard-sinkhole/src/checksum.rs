//! Internet one's-complement checksum (RFC 1071)

use std::net::IpAddr;

/// Accumulate 16-bit big-endian words of `data` onto `initial`.
///
/// An odd trailing byte is padded with zero. The result is unfolded, so
/// several buffers can be summed before calling [`fold`].
pub fn sum(initial: u32, data: &[u8]) -> u32 {
    let mut acc = initial as u64;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }
    while acc >> 32 != 0 {
        acc = (acc & 0xFFFF_FFFF) + (acc >> 32);
    }
    acc as u32
}

/// Fold carries into the low 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Complement of the folded sum, ready to store in a header.
pub fn finish(sum: u32) -> u16 {
    !fold(sum)
}

/// Checksum of a contiguous buffer.
pub fn checksum(data: &[u8]) -> u16 {
    finish(sum(0, data))
}

/// Pseudo-header sum for TCP, UDP and ICMPv6.
///
/// IPv4: src, dst, zero, protocol, 16-bit length.
/// IPv6: src, dst, 32-bit length, next header.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut acc = sum(0, &s.octets());
            acc = sum(acc, &d.octets());
            acc += protocol as u32;
            acc + (length as u32 & 0xFFFF)
        }
        _ => {
            let mut acc = sum(0, &to_v6_octets(src));
            acc = sum(acc, &to_v6_octets(dst));
            acc = sum(acc, &(length as u32).to_be_bytes());
            acc + protocol as u32
        }
    }
}

/// Transport checksum over pseudo-header plus segment.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    finish(sum(pseudo_header_sum(src, dst, protocol, segment.len()), segment))
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V6(a) => a.octets(),
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
    }
}
