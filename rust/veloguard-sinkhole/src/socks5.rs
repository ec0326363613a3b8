//! SOCKS5 client handshake (RFC 1928, RFC 1929)
//!
//! The client is sans-IO: the engine sends whatever [`Socks5Client::request`]
//! returns when the socket is writable and feeds each reply it reads to
//! [`Socks5Client::on_reply`].

use crate::error::{Result, SinkholeError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    Hello,
    Auth,
    Connect,
    UdpAssociate,
    Connected,
    UdpAssociated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Command {
    Connect,
    UdpAssociate,
}

#[derive(Debug, Clone)]
pub struct Socks5Client {
    state: Socks5State,
    command: Socks5Command,
    credentials: Option<(String, String)>,
    target: SocketAddr,
    awaiting_reply: bool,
    bound: Option<SocketAddr>,
}

fn reply_error(code: u8) -> SinkholeError {
    let reason = match code {
        0x01 => "General SOCKS server failure",
        0x02 => "Connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown error",
    };
    SinkholeError::Socks5Rejected { code, reason }
}

impl Socks5Client {
    pub fn new(command: Socks5Command, target: SocketAddr, credentials: Option<(String, String)>) -> Self {
        Self {
            state: Socks5State::Hello,
            command,
            credentials,
            target,
            awaiting_reply: false,
            bound: None,
        }
    }

    pub fn connect(target: SocketAddr, credentials: Option<(String, String)>) -> Self {
        Self::new(Socks5Command::Connect, target, credentials)
    }

    /// `target` is the address the client will send datagrams from, usually unspecified.
    pub fn udp_associate(target: SocketAddr, credentials: Option<(String, String)>) -> Self {
        Self::new(Socks5Command::UdpAssociate, target, credentials)
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, Socks5State::Connected | Socks5State::UdpAssociated)
    }

    /// Relay address reported by the server.
    pub fn bound(&self) -> Option<SocketAddr> {
        self.bound
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Next message to send, if one is due. Marks the client as waiting for a reply.
    pub fn request(&mut self) -> Option<Vec<u8>> {
        if self.awaiting_reply || self.is_done() {
            return None;
        }
        let msg = match self.state {
            Socks5State::Hello => match self.credentials {
                Some(_) => vec![VERSION, 2, METHOD_NONE, METHOD_USERPASS],
                None => vec![VERSION, 1, METHOD_NONE],
            },
            Socks5State::Auth => {
                let (user, pass) = self.credentials.as_ref()?;
                let mut m = Vec::with_capacity(3 + user.len() + pass.len());
                m.push(AUTH_VERSION);
                m.push(user.len() as u8);
                m.extend_from_slice(user.as_bytes());
                m.push(pass.len() as u8);
                m.extend_from_slice(pass.as_bytes());
                m
            }
            Socks5State::Connect | Socks5State::UdpAssociate => {
                let cmd = if self.state == Socks5State::Connect { CMD_CONNECT } else { CMD_UDP_ASSOCIATE };
                let mut m = vec![VERSION, cmd, 0];
                encode_address(&mut m, self.target);
                m
            }
            Socks5State::Connected | Socks5State::UdpAssociated => return None,
        };
        self.awaiting_reply = true;
        Some(msg)
    }

    fn command_state(&self) -> Socks5State {
        match self.command {
            Socks5Command::Connect => Socks5State::Connect,
            Socks5Command::UdpAssociate => Socks5State::UdpAssociate,
        }
    }

    /// Advance on a complete reply.
    pub fn on_reply(&mut self, reply: &[u8]) -> Result<Socks5State> {
        if !self.awaiting_reply {
            return Err(SinkholeError::Socks5("unexpected data".into()));
        }
        self.awaiting_reply = false;
        match self.state {
            Socks5State::Hello => match reply {
                [VERSION, METHOD_NONE] => self.state = self.command_state(),
                [VERSION, METHOD_USERPASS] if self.credentials.is_some() => self.state = Socks5State::Auth,
                _ => return Err(SinkholeError::Socks5(format!("hello reply {:02x?}", reply))),
            },
            Socks5State::Auth => match reply {
                [AUTH_VERSION | VERSION, 0] => self.state = self.command_state(),
                _ => return Err(SinkholeError::Socks5("authentication failed".into())),
            },
            Socks5State::Connect | Socks5State::UdpAssociate => {
                if reply.len() >= 2 && reply[0] == VERSION && reply[1] != 0 {
                    return Err(reply_error(reply[1]));
                }
                let bound = match (reply.len(), reply.get(3)) {
                    (10, Some(&ATYP_IPV4)) | (22, Some(&ATYP_IPV6)) if reply[0] == VERSION => {
                        decode_address(&reply[3..])?.0
                    }
                    _ => return Err(SinkholeError::Socks5(format!("{} byte command reply", reply.len()))),
                };
                self.bound = Some(bound);
                self.state = if self.state == Socks5State::Connect {
                    Socks5State::Connected
                } else {
                    Socks5State::UdpAssociated
                };
            }
            Socks5State::Connected | Socks5State::UdpAssociated => {
                return Err(SinkholeError::Socks5("reply after completion".into()));
            }
        }
        Ok(self.state)
    }
}

fn encode_address(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Decode `atyp addr port`, returning the address and bytes consumed.
fn decode_address(data: &[u8]) -> Result<(SocketAddr, usize)> {
    let short = || SinkholeError::Socks5("address truncated".into());
    let (ip, len) = match data.first() {
        Some(&ATYP_IPV4) => {
            let b = data.get(1..5).ok_or_else(short)?;
            (IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])), 5)
        }
        Some(&ATYP_IPV6) => {
            let b: [u8; 16] = data.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
            (IpAddr::V6(Ipv6Addr::from(b)), 17)
        }
        Some(t) => return Err(SinkholeError::Socks5(format!("address type {}", t))),
        None => return Err(short()),
    };
    let p = data.get(len..len + 2).ok_or_else(short)?;
    Ok((SocketAddr::new(ip, u16::from_be_bytes([p[0], p[1]])), len + 2))
}

/// Frame a datagram for the UDP relay: `RSV RSV FRAG atyp addr port data`.
pub fn encode_udp_datagram(dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22 + payload.len());
    out.extend_from_slice(&[0, 0, 0]);
    encode_address(&mut out, dst);
    out.extend_from_slice(payload);
    out
}

/// Strip the relay header. Fragmented datagrams are rejected.
pub fn decode_udp_datagram(data: &[u8]) -> Result<(SocketAddr, &[u8])> {
    if data.len() < 4 {
        return Err(SinkholeError::Socks5("datagram too short".into()));
    }
    if data[2] != 0 {
        return Err(SinkholeError::Socks5("fragmented datagram".into()));
    }
    let (src, used) = decode_address(&data[3..])?;
    Ok((src, &data[3 + used..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SocketAddr {
        "93.184.216.34:443".parse().unwrap()
    }

    #[test]
    fn connect_without_auth() {
        let mut c = Socks5Client::connect(target(), None);
        assert_eq!(c.request().unwrap(), vec![5, 1, 0]);
        assert!(c.request().is_none());
        assert_eq!(c.on_reply(&[5, 0]).unwrap(), Socks5State::Connect);

        let req = c.request().unwrap();
        assert_eq!(req, vec![5, 1, 0, 1, 93, 184, 216, 34, 0x01, 0xbb]);
        let state = c.on_reply(&[5, 0, 0, 1, 10, 0, 0, 1, 0x1f, 0x90]).unwrap();
        assert_eq!(state, Socks5State::Connected);
        assert_eq!(c.bound(), Some("10.0.0.1:8080".parse().unwrap()));
        assert!(c.is_done());
        assert!(c.request().is_none());
    }

    #[test]
    fn username_password_path() {
        let mut c = Socks5Client::connect(target(), Some(("bob".into(), "pw".into())));
        assert_eq!(c.request().unwrap(), vec![5, 2, 0, 2]);
        assert_eq!(c.on_reply(&[5, 2]).unwrap(), Socks5State::Auth);
        assert_eq!(c.request().unwrap(), vec![1, 3, b'b', b'o', b'b', 2, b'p', b'w']);
        assert_eq!(c.on_reply(&[1, 0]).unwrap(), Socks5State::Connect);
    }

    #[test]
    fn auth_method_without_credentials_aborts() {
        let mut c = Socks5Client::connect(target(), None);
        c.request();
        assert!(c.on_reply(&[5, 2]).is_err());

        let mut c = Socks5Client::connect(target(), None);
        c.request();
        assert!(c.on_reply(&[5, 0, 0]).is_err());
    }

    #[test]
    fn rejected_connect_maps_reason() {
        let mut c = Socks5Client::connect(target(), None);
        c.request();
        c.on_reply(&[5, 0]).unwrap();
        c.request();
        match c.on_reply(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]) {
            Err(SinkholeError::Socks5Rejected { code, reason }) => {
                assert_eq!(code, 5);
                assert_eq!(reason, "Connection refused");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn command_reply_length_must_match_address_type() {
        let mut c = Socks5Client::connect("[2001:db8::1]:80".parse().unwrap(), None);
        c.request();
        c.on_reply(&[5, 0]).unwrap();
        let req = c.request().unwrap();
        assert_eq!(req.len(), 3 + 1 + 16 + 2);
        assert!(c.on_reply(&[5, 0, 0, 4, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn udp_associate_and_framing() {
        let mut c = Socks5Client::udp_associate("0.0.0.0:0".parse().unwrap(), None);
        c.request();
        c.on_reply(&[5, 0]).unwrap();
        assert_eq!(c.request().unwrap()[1], 3);
        let mut reply = vec![5, 0, 0, 4];
        reply.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        reply.extend_from_slice(&1080u16.to_be_bytes());
        assert_eq!(c.on_reply(&reply).unwrap(), Socks5State::UdpAssociated);
        assert_eq!(c.bound(), Some("[::1]:1080".parse().unwrap()));

        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let framed = encode_udp_datagram(dst, b"query");
        assert_eq!(&framed[..4], &[0, 0, 0, 1]);
        let (src, payload) = decode_udp_datagram(&framed).unwrap();
        assert_eq!(src, dst);
        assert_eq!(payload, b"query");

        let mut frag = framed.clone();
        frag[2] = 1;
        assert!(decode_udp_datagram(&frag).is_err());
    }
}
