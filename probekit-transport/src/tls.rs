use std::pin::Pin;

use openssl::nid::Nid;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509Ref, X509VerifyResult};
use probekit_common::{Failure, FailureKind, Settings};
use tokio_openssl::SslStream;

use crate::Io;

/// Installs a verifying TLS session over `io`, with SNI set to
/// `hostname`. The peer certificate is checked against the configured CA
/// bundle (or the system default locations) and the hostname is validated
/// separately after the handshake completes.
pub(crate) async fn upgrade(
    io: Box<dyn Io>,
    hostname: &str,
    settings: &Settings,
) -> Result<SslStream<Box<dyn Io>>, Failure> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| Failure::with_reason(FailureKind::SslCtxNew, err.to_string()))?;
    match settings.get("net/ca_bundle_path") {
        Some("") => {
            return Err(Failure::with_reason(
                FailureKind::MissingCaBundlePath,
                "net/ca_bundle_path is empty",
            ))
        }
        Some(path) => builder.set_ca_file(path).map_err(|err| {
            Failure::with_reason(FailureKind::SslCtxLoadVerifyLocations, err.to_string())
        })?,
        // SslConnector loads the platform's default verify paths.
        None => {}
    }
    builder.set_verify(SslVerifyMode::PEER);
    let connector = builder.build();

    let mut config = connector
        .configure()
        .map_err(|err| Failure::with_reason(FailureKind::SslNew, err.to_string()))?;
    // Hostname validation happens after the handshake, below.
    config.set_verify_hostname(false);
    let ssl = config
        .into_ssl(hostname)
        .map_err(|err| Failure::with_reason(FailureKind::SslNew, err.to_string()))?;

    let mut stream = SslStream::new(ssl, io)
        .map_err(|err| Failure::with_reason(FailureKind::SslNew, err.to_string()))?;
    if let Err(err) = Pin::new(&mut stream).connect().await {
        let verify = stream.ssl().verify_result();
        if verify != X509VerifyResult::OK {
            return Err(Failure::with_reason(
                FailureKind::SslInvalidCertificate,
                verify.error_string(),
            ));
        }
        return Err(Failure::with_reason(FailureKind::SslHandshake, err.to_string()));
    }

    let certificate = stream.ssl().peer_certificate().ok_or_else(|| {
        Failure::with_reason(FailureKind::SslNoCertificate, "peer sent no certificate")
    })?;
    validate_hostname(hostname, &certificate)?;
    tracing::debug!(hostname, "tls established");
    Ok(stream)
}

/// Matches `hostname` against the certificate's subject alternative names
/// (falling back to the common name), with single-label wildcards.
fn validate_hostname(hostname: &str, certificate: &X509Ref) -> Result<(), Failure> {
    if let Some(names) = certificate.subject_alt_names() {
        for name in names.iter() {
            if let Some(dns) = name.dnsname() {
                if dns_name_matches(dns, hostname) {
                    return Ok(());
                }
            }
            if let Some(ip) = name.ipaddress() {
                if ip_matches(ip, hostname) {
                    return Ok(());
                }
            }
        }
        return Err(mismatch(hostname));
    }
    let subject = certificate.subject_name();
    for entry in subject.entries_by_nid(Nid::COMMONNAME) {
        if let Ok(common) = entry.data().as_utf8() {
            if dns_name_matches(&common, hostname) {
                return Ok(());
            }
        }
    }
    Err(mismatch(hostname))
}

fn mismatch(hostname: &str) -> Failure {
    Failure::with_reason(
        FailureKind::SslInvalidHostname,
        format!("certificate does not match {hostname}"),
    )
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    // "*.example.com" matches exactly one extra label.
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some((first, rest)) = hostname.split_once('.') {
            return !first.is_empty() && rest.eq_ignore_ascii_case(suffix);
        }
    }
    false
}

fn ip_matches(raw: &[u8], hostname: &str) -> bool {
    match raw.len() {
        4 => hostname
            .parse::<std::net::Ipv4Addr>()
            .map(|ip| ip.octets() == raw[..4])
            .unwrap_or(false),
        16 => hostname
            .parse::<std::net::Ipv6Addr>()
            .map(|ip| ip.octets() == raw[..16])
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_one_label_only() {
        assert!(dns_name_matches("*.example.com", "www.example.com"));
        assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
        assert!(!dns_name_matches("*.example.com", "example.com"));
        assert!(dns_name_matches("Example.COM", "example.com"));
    }

    #[test]
    fn ip_san_matching() {
        assert!(ip_matches(&[127, 0, 0, 1], "127.0.0.1"));
        assert!(!ip_matches(&[127, 0, 0, 1], "127.0.0.2"));
        assert!(!ip_matches(&[1, 2], "1.2.3.4"));
    }
}
