//! Serialization and transport behavior observed from a peer's side.

use probekit::http::{request_cycle, request_json_object};
use probekit::{connect, Headers, Settings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::helpers::{read_http_request, NoResolver};

#[tokio::test]
async fn serialized_request_arrives_verbatim() {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_http_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        request
    });

    let mut settings = Settings::new();
    settings.set("http/url", format!("http://127.0.0.1:{port}/antani?clacsonato=yes"));
    settings.set("http/method", "GET");
    settings.set("http/http_version", "HTTP/1.0");
    let headers: Headers = [("User-Agent", "Antani/1.0.0.0")].into_iter().collect();
    let response = request_cycle(&settings, &headers, b"0123456789", &NoResolver)
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);

    let request = server.await.unwrap();
    let expected = format!(
        "GET /antani?clacsonato=yes HTTP/1.0\r\n\
         User-Agent: Antani/1.0.0.0\r\n\
         Host: 127.0.0.1:{port}\r\n\
         Content-Length: 10\r\n\r\n0123456789"
    );
    assert_eq!(request, expected);
}

#[tokio::test]
async fn path_setting_overrides_the_request_line() {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_http_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        request
    });

    let mut settings = Settings::new();
    settings.set("http/url", format!("http://127.0.0.1:{port}/antani?clacsonato=yes"));
    settings.set("http/http_version", "HTTP/1.0");
    settings.set("http/path", "/antani?amicimiei");
    request_cycle(&settings, &Headers::new(), b"", &NoResolver).await.unwrap();

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /antani?amicimiei HTTP/1.0\r\n"));
}

#[tokio::test]
async fn http_request_through_socks5_proxy() {
    let _ = tracing_subscriber::fmt::try_init();

    // Stub proxy in front of a stub HTTP server, on the same socket.
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
        stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();
        let request = read_http_request(&mut stream).await;
        assert!(request.contains("Host: target.example\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let mut settings = Settings::new();
    settings.set("http/url", "http://target.example/");
    settings.set("net/socks5_proxy", format!("127.0.0.1:{proxy_port}"));
    let response = request_cycle(&settings, &Headers::new(), b"", &NoResolver)
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(&response.body[..], b"hello");
}

#[tokio::test]
async fn transport_connect_cascade_reports_diagnostics() {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let mut settings = Settings::new();
    settings.set("net/timeout", "0.2");
    // The TEST-NET address does not answer; the cascade must fall
    // through to loopback and keep the failure for diagnostics.
    let txp = {
        use async_trait::async_trait;
        use probekit::dns::{Answer, Message, QueryClass, QueryType, Resolve};
        use probekit::Failure;

        struct TwoAddrResolver;

        #[async_trait]
        impl Resolve for TwoAddrResolver {
            async fn query(
                &self,
                _qclass: QueryClass,
                qtype: QueryType,
                name: &str,
            ) -> Result<Message, Failure> {
                let mut message = Message::default();
                if qtype == QueryType::A {
                    for ip in ["192.0.2.1", "127.0.0.1"] {
                        message.answers.push(Answer {
                            name: name.to_string(),
                            ipv4: Some(ip.parse().unwrap()),
                            ..Answer::default()
                        });
                    }
                }
                Ok(message)
            }
        }

        connect("cascade.example", port, &settings, &TwoAddrResolver).await.unwrap()
    };
    assert_eq!(txp.connect_errors().len(), 1);
    assert_eq!(txp.peer_addr().unwrap().port(), port);
}

#[tokio::test]
async fn json_helper_round_trips_objects() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = crate::helpers::stub_json_server(vec![(
        200,
        r#"{"status": "ok"}"#.to_string(),
    )])
    .await;
    let (response, parsed) = request_json_object(
        "POST",
        &format!("http://{addr}/check"),
        &serde_json::json!({"ping": true}),
        &Headers::new(),
        &Settings::new(),
        &NoResolver,
    )
    .await
    .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(parsed["status"], "ok");
}
