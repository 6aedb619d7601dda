use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use probekit_common::{Failure, FailureKind, Settings};
use probekit_dns::{QueryClass, QueryType, Resolve};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::{replay::ReplayIo, socks5, tls, Io, Transport};

/// Connects to `hostname:port` according to `settings`, running the
/// stages of the pipeline in order: resolution, TCP cascade, optional
/// SOCKS5 upgrade (`net/socks5_proxy`), optional TLS upgrade (`net/ssl`).
///
/// With a proxy configured the TCP stages target the proxy and the TLS
/// session is still established with the final target after the CONNECT
/// completes.
pub async fn connect(
    hostname: &str,
    port: u16,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<Transport, Failure> {
    if let Some(proxy) = settings.get("net/socks5_proxy") {
        let (proxy_host, proxy_port) = split_proxy(proxy)?;
        tracing::debug!(%proxy_host, proxy_port, "connecting through socks5 proxy");

        let (io, peer, errors) =
            tcp_stage(&proxy_host, proxy_port, settings, resolver).await?;
        let (io, residual) = socks5::handshake(io, hostname, i64::from(port)).await?;
        let io: Box<dyn Io> = if residual.is_empty() {
            io
        } else {
            tracing::debug!(len = residual.len(), "replaying residual proxy bytes");
            Box::new(ReplayIo::new(residual, io))
        };

        // TLS is with the final target, not the proxy.
        let io = maybe_tls(io, hostname, settings).await?;
        return Ok(Transport::from_boxed(io, Some(peer), errors));
    }

    let (io, peer, errors) = tcp_stage(hostname, port, settings, resolver).await?;
    let io = maybe_tls(io, hostname, settings).await?;
    Ok(Transport::from_boxed(io, Some(peer), errors))
}

/// Resolution plus connect cascade, without the upgrade stages.
async fn tcp_stage(
    hostname: &str,
    port: u16,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(Box<dyn Io>, SocketAddr, Vec<Failure>), Failure> {
    let addresses = resolve_addresses(hostname, resolver).await?;
    let attempt_timeout = settings
        .get_parsed::<f64>("net/timeout")?
        .map(Duration::from_secs_f64);
    let (stream, peer, errors) = connect_first_of(&addresses, port, attempt_timeout).await?;
    Ok((Box::new(stream), peer, errors))
}

async fn maybe_tls(
    io: Box<dyn Io>,
    hostname: &str,
    settings: &Settings,
) -> Result<Box<dyn Io>, Failure> {
    if settings.is_truthy("net/ssl") {
        let stream = tls::upgrade(io, hostname, settings).await?;
        Ok(Box::new(stream))
    } else {
        Ok(io)
    }
}

/// Literal addresses skip the resolver; otherwise A results come first,
/// AAAA results second.
async fn resolve_addresses(
    hostname: &str,
    resolver: &dyn Resolve,
) -> Result<Vec<IpAddr>, Failure> {
    if let Ok(literal) = hostname.parse::<IpAddr>() {
        return Ok(vec![literal]);
    }

    let mut addresses = Vec::new();
    let mut failures = Vec::new();
    match resolver.query(QueryClass::In, QueryType::A, hostname).await {
        Ok(message) => {
            addresses.extend(message.answers.iter().filter_map(|a| a.ipv4.map(IpAddr::V4)))
        }
        Err(failure) => failures.push(failure),
    }
    match resolver.query(QueryClass::In, QueryType::Aaaa, hostname).await {
        Ok(message) => {
            addresses.extend(message.answers.iter().filter_map(|a| a.ipv6.map(IpAddr::V6)))
        }
        Err(failure) => failures.push(failure),
    }

    if addresses.is_empty() {
        return Err(Failure::with_children(FailureKind::DnsGeneric, failures));
    }
    Ok(addresses)
}

/// Tries each address in order; the first success wins and the failures
/// of every earlier attempt are kept for diagnostics.
async fn connect_first_of(
    addresses: &[IpAddr],
    port: u16,
    attempt_timeout: Option<Duration>,
) -> Result<(TcpStream, SocketAddr, Vec<Failure>), Failure> {
    let mut failures = Vec::new();
    for address in addresses {
        let target = SocketAddr::new(*address, port);
        let attempt = TcpStream::connect(target);
        let outcome = match attempt_timeout {
            Some(delay) => match timeout(delay, attempt).await {
                Ok(outcome) => outcome.map_err(Failure::from),
                Err(_) => Err(Failure::with_reason(FailureKind::Timeout, "connect timed out")),
            },
            None => attempt.await.map_err(Failure::from),
        };
        match outcome {
            Ok(stream) => {
                tracing::debug!(%target, failed = failures.len(), "connected");
                stream.set_nodelay(true).map_err(Failure::from)?;
                return Ok((stream, target, failures));
            }
            Err(failure) => {
                tracing::debug!(%target, failure = failure.ooni_failure(), "connect failed");
                failures.push(Failure::with_reason(
                    failure.kind(),
                    format!("{target}: {}", failure.reason()),
                ));
            }
        }
    }
    Err(Failure::with_children(FailureKind::ConnectFailed, failures))
}

fn split_proxy(proxy: &str) -> Result<(String, u16), Failure> {
    let (host, port) = proxy
        .rsplit_once(':')
        .ok_or_else(|| Failure::with_reason(FailureKind::Value, "net/socks5_proxy: no port"))?;
    let port = port.parse::<u16>().map_err(|_| {
        Failure::with_reason(FailureKind::Value, format!("net/socks5_proxy: bad port {port:?}"))
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use probekit_dns::{Answer, Message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Resolver fake returning fixed answers.
    struct StaticResolver {
        v4: Vec<std::net::Ipv4Addr>,
        v6: Vec<std::net::Ipv6Addr>,
    }

    #[async_trait]
    impl Resolve for StaticResolver {
        async fn query(
            &self,
            _qclass: QueryClass,
            qtype: QueryType,
            name: &str,
        ) -> Result<Message, Failure> {
            let mut message = Message::default();
            match qtype {
                QueryType::A => {
                    for ip in &self.v4 {
                        message.answers.push(Answer {
                            name: name.to_string(),
                            ipv4: Some(*ip),
                            ..Answer::default()
                        });
                    }
                }
                QueryType::Aaaa => {
                    for ip in &self.v6 {
                        message.answers.push(Answer {
                            name: name.to_string(),
                            ipv6: Some(*ip),
                            ..Answer::default()
                        });
                    }
                }
                _ => {}
            }
            if message.answers.is_empty() {
                return Err(Failure::new(FailureKind::DnsGeneric));
            }
            Ok(message)
        }
    }

    #[tokio::test]
    async fn cascade_skips_dead_address_and_records_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        // 192.0.2.1 (TEST-NET) does not answer; localhost does.
        let addresses = vec!["192.0.2.1".parse().unwrap(), "127.0.0.1".parse().unwrap()];
        let (stream, peer, failures) =
            connect_first_of(&addresses, port, Some(Duration::from_millis(200)))
                .await
                .unwrap();
        drop(stream);
        assert_eq!(peer, SocketAddr::new("127.0.0.1".parse().unwrap(), port));
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn all_addresses_failing_is_connect_failed_with_children() {
        let addresses: Vec<IpAddr> =
            vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()];
        let err = connect_first_of(&addresses, 81, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectFailed);
        assert_eq!(err.children().len(), 2);
    }

    #[tokio::test]
    async fn literal_addresses_skip_the_resolver() {
        let resolver = StaticResolver { v4: Vec::new(), v6: Vec::new() };
        let addresses = resolve_addresses("127.0.0.1", &resolver).await.unwrap();
        assert_eq!(addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn a_results_come_before_aaaa() {
        let resolver = StaticResolver {
            v4: vec!["127.0.0.1".parse().unwrap()],
            v6: vec!["::1".parse().unwrap()],
        };
        let addresses = resolve_addresses("x.org", &resolver).await.unwrap();
        assert_eq!(addresses[0], "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addresses[1], "::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn end_to_end_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let resolver = StaticResolver { v4: Vec::new(), v6: Vec::new() };
        let settings = Settings::new();
        let mut txp = connect("127.0.0.1", port, &settings, &resolver).await.unwrap();
        txp.write(b"ping").await.unwrap();
        txp.flush().await.unwrap();
        let echoed = txp.recv().await.unwrap();
        assert_eq!(&echoed[..], b"ping");
        txp.close().await;
    }

    #[tokio::test]
    async fn socks5_proxied_connect_end_to_end() {
        // Stub proxy that speaks just enough SOCKS5 and then echoes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            stream.write_all(&[5, 0, 0, 1, 1, 2, 3, 4, 0, 80]).await.unwrap();
            let mut data = [0u8; 4];
            stream.read_exact(&mut data).await.unwrap();
            stream.write_all(&data).await.unwrap();
        });

        let resolver = StaticResolver { v4: Vec::new(), v6: Vec::new() };
        let mut settings = Settings::new();
        settings.set("net/socks5_proxy", format!("127.0.0.1:{proxy_port}"));
        let mut txp = connect("target.example", 80, &settings, &resolver).await.unwrap();
        txp.write(b"ping").await.unwrap();
        txp.flush().await.unwrap();
        let echoed = txp.recv().await.unwrap();
        assert_eq!(&echoed[..], b"ping");
    }
}
