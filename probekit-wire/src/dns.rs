use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use probekit_common::{Failure, FailureKind};
use thiserror::Error;

/// DNS wire-format errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Format(&'static str),
    #[error("name not encodable: {0}")]
    BadName(String),
    #[error("query type {0:?} has no wire representation")]
    PseudoType(QueryType),
    #[error("server failure: rcode {0}")]
    ServerFailure(u8),
    #[error("no such domain")]
    NxDomain,
    #[error("query refused: rcode {0}")]
    Refused(u8),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Format(_) | Error::BadName(_) | Error::PseudoType(_) => FailureKind::Format,
            Error::ServerFailure(_) => FailureKind::ServerFailed,
            Error::NxDomain => FailureKind::HostOrServiceNotProvidedOrNotKnown,
            Error::Refused(_) => FailureKind::DnsGeneric,
        };
        Failure::with_reason(kind, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryClass {
    In,
    Ch,
    Hs,
}

impl QueryClass {
    pub fn wire_code(self) -> u16 {
        match self {
            QueryClass::In => 1,
            QueryClass::Ch => 3,
            QueryClass::Hs => 4,
        }
    }

    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(QueryClass::In),
            3 => Some(QueryClass::Ch),
            4 => Some(QueryClass::Hs),
            _ => None,
        }
    }
}

/// Record types understood by the resolver. `ReverseA` and `ReverseAaaa`
/// are query-level conveniences: the resolver rewrites them into PTR
/// lookups of the reversed name before anything reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Cname,
    Ns,
    Ptr,
    Mx,
    Txt,
    Soa,
    ReverseA,
    ReverseAaaa,
}

impl QueryType {
    pub fn wire_code(self) -> Option<u16> {
        match self {
            QueryType::A => Some(1),
            QueryType::Ns => Some(2),
            QueryType::Cname => Some(5),
            QueryType::Soa => Some(6),
            QueryType::Ptr => Some(12),
            QueryType::Mx => Some(15),
            QueryType::Txt => Some(16),
            QueryType::Aaaa => Some(28),
            QueryType::ReverseA | QueryType::ReverseAaaa => None,
        }
    }

    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(QueryType::A),
            2 => Some(QueryType::Ns),
            5 => Some(QueryType::Cname),
            6 => Some(QueryType::Soa),
            12 => Some(QueryType::Ptr),
            15 => Some(QueryType::Mx),
            16 => Some(QueryType::Txt),
            28 => Some(QueryType::Aaaa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub qclass: QueryClass,
    pub qtype: QueryType,
    pub name: String,
}

/// One resource record from a response. Exactly one of the payload fields
/// is set, depending on the record type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub qclass: Option<QueryClass>,
    pub qtype: Option<QueryType>,
    pub ttl: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// Target name for CNAME/NS/PTR/MX/SOA records.
    pub hostname: Option<String>,
    /// Text payload for TXT records.
    pub text: Option<String>,
}

/// A resolver result: the queries asked and the answers received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub queries: Vec<Query>,
    pub answers: Vec<Answer>,
}

/// Encodes a recursive query for `query` with the given transaction id.
pub fn encode_query(id: u16, query: &Query) -> Result<Bytes, Error> {
    let qtype = query.qtype.wire_code().ok_or(Error::PseudoType(query.qtype))?;
    let mut out = BytesMut::with_capacity(17 + query.name.len());
    out.put_u16(id);
    out.put_u16(0x0100); // flags: RD
    out.put_u16(1); // QDCOUNT
    out.put_u16(0); // ANCOUNT
    out.put_u16(0); // NSCOUNT
    out.put_u16(0); // ARCOUNT
    encode_name(&query.name, &mut out)?;
    out.put_u16(qtype);
    out.put_u16(query.qclass.wire_code());
    Ok(out.freeze())
}

fn encode_name(name: &str, out: &mut BytesMut) -> Result<(), Error> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut total = 0usize;
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(Error::BadName(name.to_string()));
            }
            total += label.len() + 1;
            out.put_u8(label.len() as u8);
            out.put_slice(label.as_bytes());
        }
    }
    if total > 254 {
        return Err(Error::BadName(name.to_string()));
    }
    out.put_u8(0);
    Ok(())
}

/// A decoded response datagram, before transaction-id matching.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub id: u16,
    pub rcode: u8,
    pub message: Message,
}

/// Decodes a response datagram. RCODE failures are surfaced as errors so
/// callers only see answers from successful responses.
pub fn decode_response(datagram: &[u8]) -> Result<RawResponse, Error> {
    let mut buf = datagram;
    if buf.remaining() < 12 {
        return Err(Error::Format("truncated header"));
    }
    let id = buf.get_u16();
    let flags = buf.get_u16();
    if flags & 0x8000 == 0 {
        return Err(Error::Format("not a response"));
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = buf.get_u16();
    let ancount = buf.get_u16();
    let _nscount = buf.get_u16();
    let _arcount = buf.get_u16();

    let mut offset = 12usize;
    let mut message = Message::default();

    for _ in 0..qdcount {
        let (name, next) = decode_name(datagram, offset)?;
        offset = next;
        let mut rest = tail(datagram, offset, 4)?;
        let qtype = rest.get_u16();
        let qclass = rest.get_u16();
        offset += 4;
        if let (Some(qtype), Some(qclass)) =
            (QueryType::from_wire(qtype), QueryClass::from_wire(qclass))
        {
            message.queries.push(Query { qclass, qtype, name });
        }
    }

    match rcode {
        0 => {}
        2 => return Err(Error::ServerFailure(rcode)),
        3 => return Err(Error::NxDomain),
        _ => return Err(Error::Refused(rcode)),
    }

    for _ in 0..ancount {
        let (name, next) = decode_name(datagram, offset)?;
        offset = next;
        let mut rest = tail(datagram, offset, 10)?;
        let qtype = rest.get_u16();
        let qclass = rest.get_u16();
        let ttl = rest.get_u32();
        let rdlength = rest.get_u16() as usize;
        offset += 10;
        let rdata_start = offset;
        if datagram.len() < rdata_start + rdlength {
            return Err(Error::Format("truncated rdata"));
        }
        offset += rdlength;

        let qtype = match QueryType::from_wire(qtype) {
            Some(qtype) => qtype,
            None => continue, // unknown record types are skipped
        };
        let mut answer = Answer {
            name,
            qclass: QueryClass::from_wire(qclass),
            qtype: Some(qtype),
            ttl,
            ..Answer::default()
        };
        let rdata = &datagram[rdata_start..rdata_start + rdlength];
        match qtype {
            QueryType::A => {
                if rdlength != 4 {
                    return Err(Error::Format("bad A rdata length"));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(rdata);
                answer.ipv4 = Some(Ipv4Addr::from(octets));
            }
            QueryType::Aaaa => {
                if rdlength != 16 {
                    return Err(Error::Format("bad AAAA rdata length"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                answer.ipv6 = Some(Ipv6Addr::from(octets));
            }
            QueryType::Cname | QueryType::Ns | QueryType::Ptr => {
                let (target, _) = decode_name(datagram, rdata_start)?;
                answer.hostname = Some(target);
            }
            QueryType::Mx => {
                if rdlength < 3 {
                    return Err(Error::Format("bad MX rdata length"));
                }
                let (target, _) = decode_name(datagram, rdata_start + 2)?;
                answer.hostname = Some(target);
            }
            QueryType::Soa => {
                let (mname, _) = decode_name(datagram, rdata_start)?;
                answer.hostname = Some(mname);
            }
            QueryType::Txt => {
                let mut text = String::new();
                let mut cursor = rdata;
                while cursor.has_remaining() {
                    let len = cursor.get_u8() as usize;
                    if cursor.remaining() < len {
                        return Err(Error::Format("bad TXT segment length"));
                    }
                    text.push_str(&String::from_utf8_lossy(&cursor[..len]));
                    cursor.advance(len);
                }
                answer.text = Some(text);
            }
            QueryType::ReverseA | QueryType::ReverseAaaa => unreachable!("no wire code"),
        }
        message.answers.push(answer);
    }

    Ok(RawResponse { id, rcode, message })
}

fn tail(datagram: &[u8], offset: usize, need: usize) -> Result<&[u8], Error> {
    if datagram.len() < offset + need {
        return Err(Error::Format("truncated record"));
    }
    Ok(&datagram[offset..])
}

/// Decodes a possibly-compressed name starting at `offset`; returns the
/// name and the offset just past its in-place encoding.
fn decode_name(datagram: &[u8], mut offset: usize) -> Result<(String, usize), Error> {
    let mut name = String::new();
    let mut jumps = 0usize;
    let mut end = None;
    loop {
        let len = *datagram.get(offset).ok_or(Error::Format("truncated name"))? as usize;
        if len & 0xc0 == 0xc0 {
            let low = *datagram.get(offset + 1).ok_or(Error::Format("truncated pointer"))?;
            if end.is_none() {
                end = Some(offset + 2);
            }
            offset = ((len & 0x3f) << 8) | low as usize;
            jumps += 1;
            if jumps > 32 {
                return Err(Error::Format("compression loop"));
            }
            continue;
        }
        if len == 0 {
            offset += 1;
            break;
        }
        let label = datagram
            .get(offset + 1..offset + 1 + len)
            .ok_or(Error::Format("truncated label"))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += 1 + len;
    }
    Ok((name, end.unwrap_or(offset)))
}
