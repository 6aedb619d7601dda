#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! Hostname resolution for probekit: a recursive UDP backend that speaks
//! the wire format directly and a system backend that delegates to the
//! platform's getaddrinfo on a blocking task. Both answer the same
//! [`Resolve`] contract so measurement code can swap them (or a fake)
//! without changing call sites.

use async_trait::async_trait;
use probekit_common::{Failure, FailureKind, Settings};

pub mod ptr;
mod system;
mod udp;

pub use probekit_wire::dns::{Answer, Message, Query, QueryClass, QueryType};
pub use system::SystemResolver;
pub use udp::UdpResolver;

/// A hostname-to-records resolver.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn query(
        &self,
        qclass: QueryClass,
        qtype: QueryType,
        name: &str,
    ) -> Result<Message, Failure>;
}

/// Picks the resolver backend configured under `dns/engine`.
pub fn resolver_from_settings(settings: &Settings) -> Result<Box<dyn Resolve>, Failure> {
    match settings.get_or("dns/engine", "libevent") {
        "libevent" | "udp" => Ok(Box::new(UdpResolver::from_settings(settings)?)),
        "system" => Ok(Box::new(SystemResolver)),
        other => Err(Failure::with_reason(
            FailureKind::Value,
            format!("dns/engine: unknown backend {other:?}"),
        )),
    }
}

/// Rewrites the reverse pseudo-types into the PTR query they stand for.
/// The name of a reverse query is the address itself; PTR proper expects
/// an already-reversed name.
pub(crate) fn effective_query(
    qclass: QueryClass,
    qtype: QueryType,
    name: &str,
) -> Result<Query, Failure> {
    let query = match qtype {
        QueryType::ReverseA => {
            let reversed = ptr::reverse_ipv4(name).ok_or_else(|| {
                Failure::with_reason(FailureKind::Value, format!("not an IPv4 address: {name}"))
            })?;
            Query { qclass, qtype: QueryType::Ptr, name: reversed }
        }
        QueryType::ReverseAaaa => {
            let reversed = ptr::reverse_ipv6(name).ok_or_else(|| {
                Failure::with_reason(FailureKind::Value, format!("not an IPv6 address: {name}"))
            })?;
            Query { qclass, qtype: QueryType::Ptr, name: reversed }
        }
        _ => Query { qclass, qtype, name: name.to_string() },
    };
    Ok(query)
}
