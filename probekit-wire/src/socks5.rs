use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use probekit_common::{Failure, FailureKind};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYPE_IPV4: u8 = 1;
const ATYPE_DOMAIN: u8 = 3;
const ATYPE_IPV6: u8 = 4;

/// Client-side errors for the SOCKS5 handshake.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad socks version: {0}")]
    BadVersion(u8),
    #[error("no acceptable authentication method: {0}")]
    NoAcceptableAuth(u8),
    #[error("request rejected by proxy: reply {0}")]
    Reply(u8),
    #[error("bad reserved field: {0}")]
    BadReservedField(u8),
    #[error("bad address type: {0}")]
    BadAtype(u8),
    #[error("domain name too long: {0} bytes")]
    AddressTooLong(usize),
    #[error("port out of range: {0}")]
    InvalidPort(i64),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(_) => FailureKind::Network,
            Error::BadVersion(_) => FailureKind::BadSocksVersion,
            Error::NoAcceptableAuth(_) => FailureKind::NoAvailableSocksAuthentication,
            Error::Reply(_) => FailureKind::Socks,
            Error::BadReservedField(_) => FailureKind::BadSocksReservedField,
            Error::BadAtype(_) => FailureKind::BadSocksAtypeValue,
            Error::AddressTooLong(_) => FailureKind::SocksAddressTooLong,
            Error::InvalidPort(_) => FailureKind::SocksInvalidPort,
        };
        Failure::with_reason(kind, err.to_string())
    }
}

/// Messages exchanged with the proxy, from the client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Greeting offering NO_AUTH only.
    AuthRequest,
    /// The proxy's method selection.
    AuthReply { method: u8 },
    /// CONNECT to `host:port` with ATYPE=DOMAINNAME.
    ConnectRequest { host: String, port: i64 },
    /// The proxy's CONNECT reply; the bound address is diagnostic only.
    ConnectReply { bound: BoundAddress },
}

/// The server-bound address carried by the CONNECT reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(Bytes, u16),
}

#[derive(Debug, Clone, Copy, Default)]
enum State {
    #[default]
    AuthReply,
    ConnectReply,
}

/// Client-side handshake codec. Decodes the two proxy replies in order;
/// short reads yield `None` until enough bytes arrive.
#[derive(Debug, Default)]
pub struct Codec {
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            State::AuthReply => {
                if src.len() < 2 {
                    return Ok(None);
                }
                let version = src.get_u8();
                let method = src.get_u8();
                tracing::trace!(version, method, "socks5 auth reply");
                if version != VERSION {
                    return Err(Error::BadVersion(version));
                }
                if method != METHOD_NO_AUTH {
                    return Err(Error::NoAcceptableAuth(method));
                }
                self.state = State::ConnectReply;
                Ok(Some(Message::AuthReply { method }))
            }
            State::ConnectReply => {
                if src.len() < 5 {
                    return Ok(None);
                }
                let version = src[0];
                let reply = src[1];
                let reserved = src[2];
                let atype = src[3];
                if version != VERSION {
                    return Err(Error::BadVersion(version));
                }
                if reply != 0 {
                    return Err(Error::Reply(reply));
                }
                if reserved != 0 {
                    return Err(Error::BadReservedField(reserved));
                }
                // Version, reply, reserved and atype, plus the variable
                // address tail and the two-byte port.
                let addr_len = match atype {
                    ATYPE_IPV4 => 4,
                    ATYPE_DOMAIN => 1 + src[4] as usize,
                    ATYPE_IPV6 => 16,
                    _ => return Err(Error::BadAtype(atype)),
                };
                let total = 4 + addr_len + 2;
                if src.len() < total {
                    return Ok(None);
                }
                src.advance(4);
                let bound = match atype {
                    ATYPE_IPV4 => {
                        let mut octets = [0u8; 4];
                        src.copy_to_slice(&mut octets);
                        BoundAddress::Ipv4(Ipv4Addr::from(octets), src.get_u16())
                    }
                    ATYPE_IPV6 => {
                        let mut octets = [0u8; 16];
                        src.copy_to_slice(&mut octets);
                        BoundAddress::Ipv6(Ipv6Addr::from(octets), src.get_u16())
                    }
                    _ => {
                        let len = src.get_u8() as usize;
                        let domain = src.split_to(len).freeze();
                        BoundAddress::Domain(domain, src.get_u16())
                    }
                };
                tracing::trace!(?bound, "socks5 connect reply");
                Ok(Some(Message::ConnectReply { bound }))
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::AuthRequest => {
                dst.reserve(3);
                dst.put_u8(VERSION);
                dst.put_u8(1); // one method offered
                dst.put_u8(METHOD_NO_AUTH);
                Ok(())
            }
            Message::ConnectRequest { host, port } => {
                if host.len() > 255 {
                    return Err(Error::AddressTooLong(host.len()));
                }
                if !(0..=65535).contains(&port) {
                    return Err(Error::InvalidPort(port));
                }
                dst.reserve(4 + 1 + host.len() + 2);
                dst.put_u8(VERSION);
                dst.put_u8(CMD_CONNECT);
                dst.put_u8(0); // reserved
                dst.put_u8(ATYPE_DOMAIN);
                dst.put_u8(host.len() as u8);
                dst.put_slice(host.as_bytes());
                dst.put_u16(port as u16);
                Ok(())
            }
            Message::AuthReply { .. } | Message::ConnectReply { .. } => Err(Error::Io(
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "reply messages are inbound"),
            )),
        }
    }
}
