use std::net::SocketAddr;

use async_trait::async_trait;
use probekit::dns::{Message, QueryClass, QueryType, Resolve};
use probekit::{Failure, FailureKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Resolver stub for tests that only dial literal addresses.
pub struct NoResolver;

#[async_trait]
impl Resolve for NoResolver {
    async fn query(
        &self,
        _qclass: QueryClass,
        _qtype: QueryType,
        _name: &str,
    ) -> Result<Message, Failure> {
        Err(Failure::new(FailureKind::Mocked))
    }
}

/// Reads one HTTP request (headers plus content-length body) off the
/// stream.
pub async fn read_http_request(stream: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..pos]).to_string();
            let want: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .map(|value| value.parse().unwrap())
                .unwrap_or(0);
            if raw.len() >= pos + 4 + want {
                break;
            }
        }
    }
    String::from_utf8(raw).unwrap()
}

/// Serves canned `(status, json)` replies, one connection each.
pub async fn stub_json_server(replies: Vec<(u16, String)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for (status, body) in replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_http_request(&mut stream).await;
            let reply = format!(
                "HTTP/1.1 {status} OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
        }
    });
    addr
}
