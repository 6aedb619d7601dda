use async_trait::async_trait;
use probekit_common::{Failure, FailureKind};
use probekit_wire::dns::{Answer, Message, Query, QueryClass, QueryType};

use crate::Resolve;

/// Resolver backed by the platform's name-resolution call.
///
/// The blocking lookup runs on a background task and its outcome is
/// marshalled back to the caller; only IN-class A/AAAA/CNAME queries are
/// supported, and getaddrinfo failures map onto the fixed error set the
/// reports rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn query(
        &self,
        qclass: QueryClass,
        qtype: QueryType,
        name: &str,
    ) -> Result<Message, Failure> {
        if qclass != QueryClass::In {
            return Err(Failure::with_reason(
                FailureKind::UnsupportedClass,
                format!("{qclass:?}"),
            ));
        }
        let request = match qtype {
            QueryType::A => gai::Request::V4,
            QueryType::Aaaa => gai::Request::V6,
            QueryType::Cname => gai::Request::Canonical,
            _ => {
                return Err(Failure::with_reason(
                    FailureKind::UnsupportedType,
                    format!("{qtype:?}"),
                ))
            }
        };

        let owned = name.to_string();
        let resolved = tokio::task::spawn_blocking(move || gai::resolve(&owned, request))
            .await
            .map_err(|err| Failure::with_reason(FailureKind::Generic, err.to_string()))??;

        let mut message = Message::default();
        message.queries.push(Query { qclass, qtype, name: name.to_string() });
        for entry in resolved {
            let mut answer = Answer {
                name: name.to_string(),
                qclass: Some(qclass),
                qtype: Some(qtype),
                ..Answer::default()
            };
            match entry.address {
                std::net::IpAddr::V4(v4) => {
                    answer.qtype = Some(QueryType::A);
                    answer.ipv4 = Some(v4);
                }
                std::net::IpAddr::V6(v6) => {
                    answer.qtype = Some(QueryType::Aaaa);
                    answer.ipv6 = Some(v6);
                }
            }
            answer.hostname = entry.canonical;
            message.answers.push(answer);
        }
        tracing::debug!(name, answers = message.answers.len(), "system resolver done");
        Ok(message)
    }
}

#[cfg(unix)]
mod gai {
    use std::ffi::{CStr, CString};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::ptr;

    use probekit_common::{Failure, FailureKind};

    #[derive(Debug, Clone, Copy)]
    pub(super) enum Request {
        V4,
        V6,
        Canonical,
    }

    pub(super) struct Resolved {
        pub address: IpAddr,
        pub canonical: Option<String>,
    }

    pub(super) fn resolve(name: &str, request: Request) -> Result<Vec<Resolved>, Failure> {
        let c_name = CString::new(name)
            .map_err(|_| Failure::with_reason(FailureKind::Value, "name contains NUL"))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_socktype = libc::SOCK_STREAM;
        hints.ai_flags = libc::AI_ALL | libc::AI_V4MAPPED;
        hints.ai_family = match request {
            Request::V4 => libc::AF_INET,
            Request::V6 => libc::AF_INET6,
            Request::Canonical => {
                hints.ai_flags |= libc::AI_CANONNAME;
                libc::AF_UNSPEC
            }
        };

        let mut head: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(c_name.as_ptr(), ptr::null(), &hints, &mut head) };
        if rc != 0 {
            return Err(map_gai_error(rc));
        }

        let mut out = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            let info = unsafe { &*cursor };
            let address = match info.ai_family {
                libc::AF_INET => {
                    let sa = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
                    Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))))
                }
                libc::AF_INET6 => {
                    let sa = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
                    Some(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)))
                }
                _ => None,
            };
            let canonical = if info.ai_canonname.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(info.ai_canonname) }.to_string_lossy().into_owned())
            };
            if let Some(address) = address {
                out.push(Resolved { address, canonical });
            }
            cursor = info.ai_next;
        }
        unsafe { libc::freeaddrinfo(head) };
        Ok(out)
    }

    fn map_gai_error(code: i32) -> Failure {
        let kind = match code {
            libc::EAI_AGAIN => FailureKind::TemporaryFailure,
            libc::EAI_BADFLAGS => FailureKind::InvalidFlagsValue,
            libc::EAI_FAIL => FailureKind::NonRecoverableFailure,
            libc::EAI_FAMILY => FailureKind::NotSupportedAiFamily,
            libc::EAI_MEMORY => FailureKind::MemoryAllocationFailure,
            libc::EAI_NONAME => FailureKind::HostOrServiceNotProvidedOrNotKnown,
            libc::EAI_OVERFLOW => FailureKind::ArgumentBufferOverflow,
            libc::EAI_SERVICE => FailureKind::NotSupportedServname,
            libc::EAI_SOCKTYPE => FailureKind::NotSupportedAiSocktype,
            _ => FailureKind::Resolver,
        };
        let detail = unsafe { CStr::from_ptr(libc::gai_strerror(code)) };
        Failure::with_reason(kind, detail.to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
mod gai {
    use std::net::IpAddr;

    use probekit_common::{Failure, FailureKind};

    #[derive(Debug, Clone, Copy)]
    pub(super) enum Request {
        V4,
        V6,
        Canonical,
    }

    pub(super) struct Resolved {
        pub address: IpAddr,
        pub canonical: Option<String>,
    }

    pub(super) fn resolve(_name: &str, _request: Request) -> Result<Vec<Resolved>, Failure> {
        Err(Failure::with_reason(
            FailureKind::Resolver,
            "system resolver not supported on this platform",
        ))
    }
}
