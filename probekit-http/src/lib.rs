#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! The HTTP engine: request serialization driven by per-operation
//! settings, the staged request cycle over a [`Transport`], bounded
//! redirect following and a JSON convenience used by the collector and
//! orchestrator clients.
//!
//! The stages are individually exposed so measurement tests can take
//! control between connect, send and receive.

use probekit_common::{Buffer, Failure, FailureKind, Settings};
use probekit_dns::Resolve;
use probekit_transport::{connect, Transport};
use probekit_wire::http::{serialize_request, Event, ResponseParser};

pub use probekit_wire::http::{Headers, Response, Url};

/// Default SOCKS5 proxy for "httpo" (collector-over-Tor) URLs.
const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

/// Parses `http/url` and opens a transport to its host, arranging the
/// SOCKS5 stage for "httpo" URLs and the TLS stage for "https" ones.
pub async fn request_connect(
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<Transport, Failure> {
    let raw = settings
        .get("http/url")
        .ok_or_else(|| Failure::with_reason(FailureKind::MissingUrl, "http/url not set"))?;
    let url = Url::parse(raw).map_err(Failure::from)?;

    let mut sub = settings.clone();
    if url.schema == "httpo" {
        // tor_socks_port takes precedence because it is more specific.
        if let Some(port) = settings.get("tor_socks_port") {
            sub.set("net/socks5_proxy", format!("127.0.0.1:{port}"));
        } else if !sub.contains("net/socks5_proxy") {
            sub.set("net/socks5_proxy", DEFAULT_TOR_PROXY);
        }
    }
    if url.schema == "https" {
        sub.set("net/ssl", "yes");
    }

    tracing::debug!(host = %url.host, port = url.port, "http: connecting");
    connect(&url.host, url.port, &sub, resolver).await
}

/// Serializes the request described by `settings` and writes it out.
pub async fn request_send(
    txp: &mut Transport,
    settings: &Settings,
    headers: &Headers,
    body: &[u8],
) -> Result<(), Failure> {
    let raw = settings
        .get("http/url")
        .ok_or_else(|| Failure::with_reason(FailureKind::MissingUrl, "http/url not set"))?;
    let url = Url::parse(raw).map_err(Failure::from)?;
    let method = settings.get_or("http/method", "GET");
    let protocol = settings.get_or("http/http_version", "HTTP/1.1");
    let wire =
        serialize_request(method, &url, settings.get("http/path"), protocol, headers, body);
    txp.write(&wire).await?;
    txp.flush().await?;
    tracing::debug!(method, "http: request sent, waiting for response");
    Ok(())
}

/// Reads and parses one response, feeding the incremental parser chunk by
/// chunk. A body that ends at orderly EOF is normal completion.
pub async fn request_recv_response(txp: &mut Transport) -> Result<Response, Failure> {
    let mut parser = ResponseParser::new();
    let mut head: Option<Response> = None;
    let mut body = Buffer::new();
    let mut done = false;

    while !done {
        let events = match txp.recv().await {
            Ok(chunk) => parser.feed(&chunk).map_err(Failure::from)?,
            Err(failure) if failure.kind() == FailureKind::Eof => {
                parser.eof().map_err(Failure::from)?
            }
            Err(failure) => return Err(failure),
        };
        for event in events {
            match event {
                Event::Begin => {}
                Event::Response(response) => head = Some(response),
                Event::BodyChunk(chunk) => body.push(chunk),
                Event::End => done = true,
            }
        }
    }

    let mut response = head
        .ok_or_else(|| Failure::with_reason(FailureKind::Parser, "response never completed"))?;
    response.body = body.read_all();
    tracing::debug!(status = response.status_code, body = response.body.len(), "http: response");
    Ok(response)
}

/// One complete exchange: connect, send, receive, close.
async fn request_once(
    settings: &Settings,
    headers: &Headers,
    body: &[u8],
    resolver: &dyn Resolve,
) -> Result<Response, Failure> {
    let mut txp = request_connect(settings, resolver).await?;
    let result = async {
        request_send(&mut txp, settings, headers, body).await?;
        request_recv_response(&mut txp).await
    }
    .await;
    txp.close().await;
    result
}

/// Composes connect, send, receive and close, following up to
/// `http/max_redirects` redirects (0, the default, disables following).
pub async fn request_cycle(
    settings: &Settings,
    headers: &Headers,
    body: &[u8],
    resolver: &dyn Resolve,
) -> Result<Response, Failure> {
    let max_redirects = settings.get_parsed::<u32>("http/max_redirects")?.unwrap_or(0);
    let mut settings = settings.clone();
    let mut depth = 0u32;
    loop {
        let response = request_once(&settings, headers, body, resolver).await?;
        let redirect = ((300..400).contains(&response.status_code) && depth < max_redirects)
            .then(|| response.headers.get("Location").map(str::to_string))
            .flatten();
        match redirect {
            Some(location) => {
                let next = resolve_location(settings.get("http/url").unwrap_or(""), &location)?;
                tracing::debug!(%next, "http: following redirect");
                settings.set("http/url", next);
                // The explicit path override only applies to the first hop.
                settings.remove("http/path");
                depth += 1;
            }
            _ => return Ok(response),
        }
    }
}

/// Sends `body` as JSON and parses the JSON reply, returning both the raw
/// response and the parsed value.
pub async fn request_json_object(
    method: &str,
    url: &str,
    body: &serde_json::Value,
    headers: &Headers,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(Response, serde_json::Value), Failure> {
    let mut settings = settings.clone();
    settings.set("http/url", url);
    settings.set("http/method", method);
    let mut headers = headers.clone();
    headers.set("Content-Type", "application/json");
    let payload = serde_json::to_vec(body)?;

    let response = request_cycle(&settings, &headers, &payload, resolver).await?;
    let parsed: serde_json::Value = serde_json::from_slice(&response.body)?;
    Ok((response, parsed))
}

/// Absolute `Location` values replace the url; root-relative ones keep
/// schema, host and port.
fn resolve_location(current: &str, location: &str) -> Result<String, Failure> {
    if location.contains("://") {
        return Ok(location.to_string());
    }
    let base = Url::parse(current).map_err(Failure::from)?;
    if !location.starts_with('/') {
        return Err(Failure::with_reason(
            FailureKind::UrlParser,
            format!("unsupported relative redirect {location:?}"),
        ));
    }
    let authority = if (base.schema == "https" && base.port == 443)
        || (base.schema != "https" && base.port == 80)
    {
        base.host.clone()
    } else {
        format!("{}:{}", base.host, base.port)
    };
    Ok(format!("{}://{}{}", base.schema, authority, location))
}
