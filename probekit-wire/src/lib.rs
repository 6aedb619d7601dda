#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! Wire formats spoken by the probekit transport and measurement layers:
//! the client side of the SOCKS5 handshake, DNS queries and responses,
//! and HTTP/1.x request serialization plus incremental response parsing.

pub mod dns;
pub mod http;
pub mod socks5;
