use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use probekit_common::{Failure, FailureKind, Settings};
use probekit_wire::dns::{self, Message, QueryClass, QueryType};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::{effective_query, Resolve};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_TIMEOUT: f64 = 5.0;
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Recursive resolver speaking the DNS wire format to one nameserver
/// over UDP, with a per-try timeout and a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    nameserver: SocketAddr,
    attempts: u32,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(nameserver: SocketAddr) -> Self {
        Self {
            nameserver,
            attempts: DEFAULT_ATTEMPTS,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT),
        }
    }

    /// Reads `dns/nameserver`, `dns/attempts` and `dns/timeout`. An empty
    /// or missing nameserver falls back to the system's resolver
    /// configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, Failure> {
        let nameserver = match settings.get("dns/nameserver") {
            Some(raw) if !raw.is_empty() => parse_nameserver(raw)?,
            _ => system_nameserver()?,
        };
        let attempts = settings
            .get_parsed::<u32>("dns/attempts")?
            .unwrap_or(DEFAULT_ATTEMPTS)
            .max(1);
        let timeout = settings.get_parsed::<f64>("dns/timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            nameserver,
            attempts,
            timeout: Duration::from_secs_f64(timeout.max(0.001)),
        })
    }

    async fn query_once(&self, query: &dns::Query) -> Result<Message, Failure> {
        let bind_addr: SocketAddr = if self.nameserver.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(Failure::from)?;
        socket.connect(self.nameserver).await.map_err(Failure::from)?;

        let id: u16 = rand::thread_rng().gen();
        let wire = dns::encode_query(id, query).map_err(Failure::from)?;
        socket.send(&wire).await.map_err(Failure::from)?;

        let mut datagram = [0u8; 4096];
        loop {
            let len = socket.recv(&mut datagram).await.map_err(Failure::from)?;
            let response = dns::decode_response(&datagram[..len]).map_err(Failure::from)?;
            if response.id != id {
                tracing::debug!(got = response.id, want = id, "ignoring mismatched reply id");
                continue;
            }
            return Ok(response.message);
        }
    }
}

#[async_trait]
impl Resolve for UdpResolver {
    async fn query(
        &self,
        qclass: QueryClass,
        qtype: QueryType,
        name: &str,
    ) -> Result<Message, Failure> {
        let query = effective_query(qclass, qtype, name)?;
        for attempt in 1..=self.attempts {
            match timeout(self.timeout, self.query_once(&query)).await {
                Ok(result) => return result,
                Err(_elapsed) => {
                    tracing::debug!(attempt, name = %query.name, "dns attempt timed out");
                }
            }
        }
        Err(Failure::with_reason(
            FailureKind::DnsGeneric,
            format!("no reply after {} attempts", self.attempts),
        ))
    }
}

fn parse_nameserver(raw: &str) -> Result<SocketAddr, Failure> {
    // Accept "host", "host:port" and "[v6]:port", with port 53 implied.
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = raw.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(Failure::with_reason(
        FailureKind::Value,
        format!("dns/nameserver: invalid address {raw:?}"),
    ))
}

fn system_nameserver() -> Result<SocketAddr, Failure> {
    let conf = std::fs::read_to_string(RESOLV_CONF).map_err(|err| {
        Failure::wrap(FailureKind::Resolver, err.into())
    })?;
    for line in conf.lines() {
        let mut words = line.split_whitespace();
        if words.next() == Some("nameserver") {
            if let Some(addr) = words.next() {
                if let Ok(parsed) = parse_nameserver(addr) {
                    return Ok(parsed);
                }
            }
        }
    }
    Err(Failure::with_reason(FailureKind::Resolver, "no nameserver configured"))
}

#[cfg(test)]
mod tests {
    use probekit_wire::dns::{encode_query, Query};

    use super::*;

    /// A one-shot fake nameserver answering with the given builder.
    async fn stub_nameserver(
        reply: impl Fn(u16, &Query) -> Vec<u8> + Send + 'static,
    ) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let decoded = decode_question(&buf[..len]);
                let out = reply(id, &decoded);
                let _ = socket.send_to(&out, peer).await;
            }
        });
        addr
    }

    /// Rebuilds the question from a query datagram by re-encoding a guess;
    /// only the name matters for these tests, so parse it directly.
    fn decode_question(datagram: &[u8]) -> Query {
        let mut name = String::new();
        let mut offset = 12usize;
        loop {
            let len = datagram[offset] as usize;
            if len == 0 {
                break;
            }
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(std::str::from_utf8(&datagram[offset + 1..offset + 1 + len]).unwrap());
            offset += 1 + len;
        }
        Query { qclass: QueryClass::In, qtype: QueryType::A, name }
    }

    fn a_reply(id: u16, query: &Query, octets: [u8; 4]) -> Vec<u8> {
        let question = encode_query(id, query).unwrap();
        let mut out = question.to_vec();
        out[2] = 0x81; // QR + RD
        out[3] = 0x80; // RA
        out[7] = 1; // ANCOUNT
        out.extend_from_slice(&[0xc0, 12]);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&60u32.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&octets);
        out
    }

    #[tokio::test]
    async fn resolves_a_record_from_stub() {
        let addr = stub_nameserver(|id, query| a_reply(id, query, [93, 184, 216, 34])).await;
        let resolver = UdpResolver::new(addr);
        let message = resolver.query(QueryClass::In, QueryType::A, "x.org").await.unwrap();
        assert_eq!(message.answers.len(), 1);
        assert_eq!(message.answers[0].ipv4.unwrap().octets(), [93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn reverse_a_is_rewritten_to_ptr() {
        let addr = stub_nameserver(|id, query| {
            assert_eq!(query.name, "1.0.0.127.in-addr.arpa");
            let question =
                Query { qclass: QueryClass::In, qtype: QueryType::Ptr, name: query.name.clone() };
            let mut out = encode_query(id, &question).unwrap().to_vec();
            out[2] = 0x81;
            out[3] = 0x80;
            out[7] = 1;
            out.extend_from_slice(&[0xc0, 12]);
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&60u32.to_be_bytes());
            let target = b"\x09localhost\x00";
            out.extend_from_slice(&(target.len() as u16).to_be_bytes());
            out.extend_from_slice(target);
            out
        })
        .await;
        let resolver = UdpResolver::new(addr);
        let message = resolver
            .query(QueryClass::In, QueryType::ReverseA, "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(message.answers[0].hostname.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn all_attempts_timing_out_is_dns_generic_error() {
        // A bound socket that never answers.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let mut resolver = UdpResolver::new(addr);
        resolver.attempts = 2;
        resolver.timeout = Duration::from_millis(30);
        let err = resolver.query(QueryClass::In, QueryType::A, "x.org").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::DnsGeneric);
    }

    #[tokio::test]
    async fn malformed_reply_is_format_error() {
        let addr = stub_nameserver(|id, _query| {
            let mut out = vec![0u8; 12];
            out[..2].copy_from_slice(&id.to_be_bytes());
            out[2] = 0x80;
            out[5] = 9; // QDCOUNT that the datagram cannot satisfy
            out
        })
        .await;
        let resolver = UdpResolver::new(addr);
        let err = resolver.query(QueryClass::In, QueryType::A, "x.org").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Format);
    }

    #[test]
    fn nameserver_parsing() {
        assert_eq!(parse_nameserver("1.1.1.1").unwrap().port(), 53);
        assert_eq!(parse_nameserver("1.1.1.1:5353").unwrap().port(), 5353);
        assert!(parse_nameserver("[::1]:53").is_ok());
        assert!(parse_nameserver("not an address").is_err());
    }
}
