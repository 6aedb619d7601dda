#![doc(issue_tracker_base_url = "https://github.com/probekit/probekit-rs/issues/")]

//! Probekit is an asynchronous network-measurement engine: a layered
//! transport stack (resolver, connect cascade, SOCKS5 and TLS upgrades,
//! incremental HTTP) topped by a measurement runner that writes
//! newline-delimited JSON reports and submits them to a collector.
//!
//! The layers live in their own crates and are re-exported here:
//!
//! - [`common`]: reactor, buffer, settings and the failure taxonomy.
//! - [`wire`]: SOCKS5, DNS and HTTP/1.x wire formats.
//! - [`dns`]: recursive UDP and system resolver backends.
//! - [`transport`]: the byte-stream transport and the connect pipeline.
//! - [`http`]: the staged request cycle.
//! - [`nettest`]: runner, report files, collector and orchestrator.

pub use probekit_common as common;
pub use probekit_dns as dns;
pub use probekit_http as http;
pub use probekit_nettest as nettest;
pub use probekit_transport as transport;
pub use probekit_wire as wire;

pub use probekit_common::{Buffer, Failure, FailureKind, Reactor, Settings};
pub use probekit_dns::{Resolve, SystemResolver, UdpResolver};
pub use probekit_http::{Headers, Response, Url};
pub use probekit_nettest::{Entry, NetTest, Runner, TestKeys};
pub use probekit_transport::{connect, Transport};
