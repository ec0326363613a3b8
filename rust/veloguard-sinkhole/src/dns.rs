//! DNS query and response inspection for domain blocking

use crate::error::{Result, SinkholeError};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

pub const DNS_HEADER_LEN: usize = 12;
pub const DNS_QNAME_MAX: usize = 255;
pub const DNS_QCLASS_IN: u16 = 1;
pub const DNS_QTYPE_A: u16 = 1;
pub const DNS_QTYPE_AAAA: u16 = 28;
pub const DNS_RCODE_NXDOMAIN: u8 = 3;
pub const DNS_RCODE_REFUSED: u8 = 5;

const MAX_LABELS: usize = 128;

/// How a blocked query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockResponse {
    /// Name error, no answers.
    #[default]
    NxDomain,
    /// Refused, no answers.
    Refused,
    /// One answer pointing at the loopback address.
    Sinkhole,
}

impl BlockResponse {
    /// Rcode used when a response has to be scrubbed after the fact.
    pub fn rcode(self) -> u8 {
        match self {
            BlockResponse::Refused => DNS_RCODE_REFUSED,
            BlockResponse::NxDomain | BlockResponse::Sinkhole => DNS_RCODE_NXDOMAIN,
        }
    }
}

/// First question of a standard query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Only IN A and IN AAAA lookups are subject to blocking.
    pub fn is_address_lookup(&self) -> bool {
        self.qclass == DNS_QCLASS_IN && (self.qtype == DNS_QTYPE_A || self.qtype == DNS_QTYPE_AAAA)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub addr: IpAddr,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub qname: String,
    pub rcode: u8,
    pub answers: Vec<DnsAnswer>,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    id: u16,
    qr: bool,
    opcode: u8,
    rcode: u8,
    qdcount: u16,
    ancount: u16,
}

fn be16(data: &[u8], off: usize) -> Result<u16> {
    match data.get(off..off + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(dns_err("truncated")),
    }
}

fn be32(data: &[u8], off: usize) -> Result<u32> {
    Ok(((be16(data, off)? as u32) << 16) | be16(data, off + 2)? as u32)
}

fn dns_err(msg: &str) -> SinkholeError {
    SinkholeError::MalformedPacket(format!("DNS {}", msg))
}

fn header(data: &[u8]) -> Result<Header> {
    if data.len() < DNS_HEADER_LEN {
        return Err(SinkholeError::PacketTooShort {
            expected: DNS_HEADER_LEN,
            actual: data.len(),
        });
    }
    Ok(Header {
        id: be16(data, 0)?,
        qr: data[2] & 0x80 != 0,
        opcode: (data[2] >> 3) & 0x0F,
        rcode: data[3] & 0x0F,
        qdcount: be16(data, 4)?,
        ancount: be16(data, 6)?,
    })
}

/// Read a possibly compressed name starting at `off`.
///
/// Returns the dotted name and the offset just past it in the original
/// stream (two bytes after the first compression pointer, if any).
pub fn get_qname(data: &[u8], off: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut ptr = off;
    let mut next = None;

    for _ in 0..MAX_LABELS {
        let len = *data.get(ptr).ok_or_else(|| dns_err("name truncated"))?;
        match len & 0xC0 {
            0xC0 => {
                let lo = *data.get(ptr + 1).ok_or_else(|| dns_err("pointer truncated"))?;
                let target = (((len & 0x3F) as usize) << 8) | lo as usize;
                if target >= data.len() {
                    return Err(dns_err("pointer out of range"));
                }
                if next.is_none() {
                    next = Some(ptr + 2);
                }
                ptr = target;
            }
            0x00 if len == 0 => {
                if name.is_empty() {
                    return Err(dns_err("empty name"));
                }
                return Ok((name, next.unwrap_or(ptr + 1)));
            }
            0x00 => {
                let len = len as usize;
                let label = data
                    .get(ptr + 1..ptr + 1 + len)
                    .ok_or_else(|| dns_err("label truncated"))?;
                if name.len() + len + 1 > DNS_QNAME_MAX {
                    return Err(dns_err("name too long"));
                }
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                ptr += len + 1;
            }
            _ => return Err(dns_err("reserved label type")),
        }
    }
    Err(dns_err("too many labels"))
}

/// Parse a standard query whose only question ends the datagram.
pub fn parse_query(data: &[u8]) -> Option<DnsQuery> {
    let h = header(data).ok()?;
    if h.qr || h.opcode != 0 || h.qdcount == 0 {
        return None;
    }
    let (name, off) = get_qname(data, DNS_HEADER_LEN).ok()?;
    if off + 4 != data.len() {
        return None;
    }
    Some(DnsQuery {
        id: h.id,
        name,
        qtype: be16(data, off).ok()?,
        qclass: be16(data, off + 2).ok()?,
    })
}

/// Name of the first question of a standard response and the offset just
/// past the question section. Answer records are not looked at.
pub fn response_question(data: &[u8]) -> Option<(String, usize)> {
    let h = header(data).ok()?;
    if !h.qr || h.opcode != 0 || h.qdcount == 0 {
        return None;
    }

    let mut off = DNS_HEADER_LEN;
    let mut qname = None;
    for _ in 0..h.qdcount {
        let (name, end) = get_qname(data, off).ok()?;
        if end + 4 > data.len() {
            return None;
        }
        qname.get_or_insert(name);
        off = end + 4;
    }
    Some((qname?, off))
}

/// Parse a response and collect its A and AAAA answers.
///
/// Answers are read in order until one is malformed; the ones before it
/// are kept.
pub fn parse_response(data: &[u8]) -> Option<DnsResponse> {
    let h = header(data).ok()?;
    if h.ancount == 0 {
        return None;
    }
    let (qname, mut off) = response_question(data)?;

    let mut answers = Vec::new();
    for _ in 0..h.ancount {
        let Some((answer, next)) = parse_answer(data, off) else {
            debug!("DNS {} answer at {} malformed", qname, off);
            break;
        };
        answers.extend(answer);
        off = next;
    }

    Some(DnsResponse {
        qname,
        rcode: h.rcode,
        answers,
    })
}

/// One resource record at `off`. The answer is `None` for records other
/// than IN A / IN AAAA.
fn parse_answer(data: &[u8], off: usize) -> Option<(Option<DnsAnswer>, usize)> {
    let (name, end) = get_qname(data, off).ok()?;
    if end + 10 > data.len() {
        return None;
    }
    let qtype = be16(data, end).ok()?;
    let qclass = be16(data, end + 2).ok()?;
    let ttl = be32(data, end + 4).ok()?;
    let rdlength = be16(data, end + 8).ok()? as usize;
    let rdata_off = end + 10;
    let rdata = data.get(rdata_off..rdata_off + rdlength)?;

    let addr = match (qclass, qtype, rdlength) {
        (DNS_QCLASS_IN, DNS_QTYPE_A, 4) => {
            <[u8; 4]>::try_from(rdata).ok().map(|o| IpAddr::V4(Ipv4Addr::from(o)))
        }
        (DNS_QCLASS_IN, DNS_QTYPE_AAAA, 16) => {
            <[u8; 16]>::try_from(rdata).ok().map(|o| IpAddr::V6(Ipv6Addr::from(o)))
        }
        _ => None,
    };
    Some((addr.map(|addr| DnsAnswer { name, addr, ttl }), rdata_off + rdlength))
}

/// Synthesize the reply to a blocked query from the query bytes.
pub fn build_blocked_response(query: &[u8], q: &DnsQuery, mode: BlockResponse, ttl: u32) -> Vec<u8> {
    let mut r = query.to_vec();
    // qr=1, opcode 0, aa/tc/rd cleared
    r[2] = 0x80;
    // ra/z/ad/cd cleared, rcode set
    r[3] = match mode {
        BlockResponse::NxDomain => DNS_RCODE_NXDOMAIN,
        BlockResponse::Refused => DNS_RCODE_REFUSED,
        BlockResponse::Sinkhole => 0,
    };
    r[6..12].fill(0);

    if mode == BlockResponse::Sinkhole {
        r[6..8].copy_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&0xC00Cu16.to_be_bytes());
        r.extend_from_slice(&q.qtype.to_be_bytes());
        r.extend_from_slice(&q.qclass.to_be_bytes());
        r.extend_from_slice(&ttl.to_be_bytes());
        if q.qtype == DNS_QTYPE_AAAA {
            r.extend_from_slice(&16u16.to_be_bytes());
            r.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        } else {
            r.extend_from_slice(&4u16.to_be_bytes());
            r.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
        }
    }
    r
}

/// Strip the answers from a response for a blocked name.
///
/// The message is cut after the question section, all record counts
/// except qdcount are zeroed and the rcode is replaced.
pub fn scrub_response(data: &[u8], rcode: u8) -> Option<Vec<u8>> {
    let (_, off) = response_question(data)?;
    let mut out = data[..off].to_vec();
    out[3] = (out[3] & 0xF0) | (rcode & 0x0F);
    out[6..12].fill(0);
    Some(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn encode_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            if !label.is_empty() {
                buf.push(label.len() as u8);
                buf.extend_from_slice(label.as_bytes());
            }
        }
        buf.push(0);
    }

    pub(crate) fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&id.to_be_bytes());
        r.extend_from_slice(&0x0100u16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        encode_name(&mut r, name);
        r.extend_from_slice(&qtype.to_be_bytes());
        r.extend_from_slice(&DNS_QCLASS_IN.to_be_bytes());
        r
    }

    pub(crate) fn response(id: u16, name: &str, addrs: &[Ipv4Addr]) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&id.to_be_bytes());
        r.extend_from_slice(&0x8180u16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&(addrs.len() as u16).to_be_bytes());
        r.extend_from_slice(&[0, 0, 0, 0]);
        encode_name(&mut r, name);
        r.extend_from_slice(&DNS_QTYPE_A.to_be_bytes());
        r.extend_from_slice(&DNS_QCLASS_IN.to_be_bytes());
        for a in addrs {
            r.extend_from_slice(&0xC00Cu16.to_be_bytes());
            r.extend_from_slice(&DNS_QTYPE_A.to_be_bytes());
            r.extend_from_slice(&DNS_QCLASS_IN.to_be_bytes());
            r.extend_from_slice(&300u32.to_be_bytes());
            r.extend_from_slice(&4u16.to_be_bytes());
            r.extend_from_slice(&a.octets());
        }
        r
    }

    #[test]
    fn parses_standard_query() {
        let q = query(0x1234, "ads.example.com", DNS_QTYPE_A);
        let parsed = parse_query(&q).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.name, "ads.example.com");
        assert!(parsed.is_address_lookup());
    }

    #[test]
    fn query_must_end_at_question() {
        let mut q = query(1, "example.com", DNS_QTYPE_A);
        q.push(0);
        assert!(parse_query(&q).is_none());

        let mut r = query(1, "example.com", DNS_QTYPE_A);
        r[2] |= 0x80;
        assert!(parse_query(&r).is_none());
    }

    #[test]
    fn qname_rejects_loops_and_reserved_labels() {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(&[0xC0, 12]);
        assert!(get_qname(&data, 12).is_err());

        let mut data = vec![0u8; 12];
        data.extend_from_slice(&[0x40, 1, 0]);
        assert!(get_qname(&data, 12).is_err());

        let mut data = vec![0u8; 12];
        data.extend_from_slice(&[0xC0, 200]);
        assert!(get_qname(&data, 12).is_err());
    }

    #[test]
    fn qname_follows_pointer_and_reports_end() {
        let mut data = vec![0u8; 12];
        encode_name(&mut data, "example.com");
        let ptr_at = data.len();
        data.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 12]);
        let (name, end) = get_qname(&data, ptr_at).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(end, data.len());
    }

    #[test]
    fn qname_length_is_bounded() {
        let mut data = vec![0u8; 12];
        for _ in 0..5 {
            data.push(63);
            data.extend_from_slice(&[b'a'; 63]);
        }
        data.push(0);
        assert!(get_qname(&data, 12).is_err());
    }

    #[test]
    fn blocked_nxdomain_response() {
        let raw = query(7, "tracker.example", DNS_QTYPE_AAAA);
        let q = parse_query(&raw).unwrap();
        let r = build_blocked_response(&raw, &q, BlockResponse::NxDomain, 600);
        assert_eq!(r.len(), raw.len());
        assert_eq!(&r[0..2], &7u16.to_be_bytes());
        assert_eq!(r[2], 0x80);
        assert_eq!(r[3] & 0x0F, DNS_RCODE_NXDOMAIN);
        assert_eq!(be16(&r, 4).unwrap(), 1);
        assert_eq!(be16(&r, 6).unwrap(), 0);
    }

    #[test]
    fn blocked_sinkhole_response_answers_loopback() {
        let raw = query(9, "ads.example", DNS_QTYPE_A);
        let q = parse_query(&raw).unwrap();
        let r = build_blocked_response(&raw, &q, BlockResponse::Sinkhole, 600);
        let parsed = parse_response(&r).unwrap();
        assert_eq!(parsed.rcode, 0);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(parsed.answers[0].ttl, 600);
    }

    #[test]
    fn response_answers_are_collected() {
        let raw = response(3, "example.com", &[Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)]);
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.qname, "example.com");
        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.answers[1].addr, IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(parsed.answers[0].name, "example.com");

    }

    #[test]
    fn malformed_trailing_answer_keeps_earlier_ones() {
        let raw = response(3, "example.com", &[Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)]);
        let cut = &raw[..raw.len() - 2];
        let parsed = parse_response(cut).unwrap();
        assert_eq!(parsed.qname, "example.com");
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].addr, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));

        let (qname, off) = response_question(cut).unwrap();
        assert_eq!(qname, "example.com");
        assert_eq!(off, DNS_HEADER_LEN + "example.com".len() + 2 + 4);
    }

    #[test]
    fn scrub_truncates_after_question() {
        let raw = response(3, "ads.example", &[Ipv4Addr::new(1, 2, 3, 4)]);
        let scrubbed = scrub_response(&raw, DNS_RCODE_NXDOMAIN).unwrap();
        assert_eq!(scrubbed.len(), DNS_HEADER_LEN + "ads.example".len() + 2 + 4);
        assert_eq!(scrubbed[3] & 0x0F, DNS_RCODE_NXDOMAIN);
        assert_eq!(be16(&scrubbed, 6).unwrap(), 0);
        assert!(parse_response(&scrubbed).is_none());
    }
}
