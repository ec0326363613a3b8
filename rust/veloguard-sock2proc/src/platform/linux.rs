use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{Sock2ProcError, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};

/// Kernel table listing sockets of `protocol` for the address family of `addr`.
pub fn table_path(protocol: u8, addr: &IpAddr) -> Result<&'static str, Sock2ProcError> {
    let v4 = addr.is_ipv4();
    match (protocol, v4) {
        (PROTO_ICMP, true) => Ok("/proc/net/icmp"),
        (PROTO_ICMPV6, false) => Ok("/proc/net/icmp6"),
        (PROTO_TCP, true) => Ok("/proc/net/tcp"),
        (PROTO_TCP, false) => Ok("/proc/net/tcp6"),
        (PROTO_UDP, true) => Ok("/proc/net/udp"),
        (PROTO_UDP, false) => Ok("/proc/net/udp6"),
        _ => Err(Sock2ProcError::UnsupportedProtocol(protocol, if v4 { 4 } else { 6 })),
    }
}

/// IPv4 addresses are printed as one host-order word.
fn hex_to_ipv4(hex: &str) -> Result<Ipv4Addr, Sock2ProcError> {
    if hex.len() != 8 {
        return Err(Sock2ProcError::InvalidEntry(hex.to_string()));
    }
    let word = u32::from_str_radix(hex, 16).map_err(|_| Sock2ProcError::InvalidEntry(hex.to_string()))?;
    Ok(Ipv4Addr::from(word.to_le_bytes()))
}

/// IPv6 addresses are printed as four host-order words.
fn hex_to_ipv6(hex: &str) -> Result<Ipv6Addr, Sock2ProcError> {
    if hex.len() != 32 {
        return Err(Sock2ProcError::InvalidEntry(hex.to_string()));
    }
    let mut bytes = [0u8; 16];
    for w in 0..4 {
        let chunk = &hex[w * 8..w * 8 + 8];
        let word =
            u32::from_str_radix(chunk, 16).map_err(|_| Sock2ProcError::InvalidEntry(hex.to_string()))?;
        bytes[w * 4..w * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Ok(Ipv6Addr::from(bytes))
}

fn hex_to_port(hex: &str) -> Result<u16, Sock2ProcError> {
    u16::from_str_radix(hex, 16).map_err(|_| Sock2ProcError::InvalidEntry(hex.to_string()))
}

/// Local address, port and uid of one table line.
fn parse_entry(line: &str, ipv6: bool) -> Result<(IpAddr, u16, u32), Sock2ProcError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(Sock2ProcError::InvalidEntry(line.to_string()));
    }

    let (addr_hex, port_hex) = parts[1]
        .split_once(':')
        .ok_or_else(|| Sock2ProcError::InvalidEntry(line.to_string()))?;
    let port = hex_to_port(port_hex)?;
    let addr = if ipv6 {
        IpAddr::V6(hex_to_ipv6(addr_hex)?)
    } else {
        IpAddr::V4(hex_to_ipv4(addr_hex)?)
    };
    let uid = parts[7]
        .parse::<u32>()
        .map_err(|_| Sock2ProcError::InvalidEntry(line.to_string()))?;
    Ok((addr, port, uid))
}

/// Search the text of a socket table. The header line is skipped.
pub fn find_uid_in_table(content: &str, addr: IpAddr, port: u16) -> Option<u32> {
    let ipv6 = addr.is_ipv6();
    let mut found = None;
    for line in content.lines().skip(1) {
        match parse_entry(line, ipv6) {
            Ok((a, p, uid)) if p == port => {
                found = Some(uid);
                if a == addr {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("skipping socket table line: {}", e),
        }
    }
    found
}

pub fn find_socket_uid(protocol: u8, addr: IpAddr, port: u16) -> Result<u32, Sock2ProcError> {
    let path = table_path(protocol, &addr)?;
    let content = fs::read_to_string(path).map_err(|e| Sock2ProcError::SystemError(e.to_string()))?;
    find_uid_in_table(&content, addr, port).ok_or(Sock2ProcError::SocketNotFound)
}
