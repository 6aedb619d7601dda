use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use probekit_common::{Failure, FailureKind, Settings};
use probekit_dns::Resolve;
use probekit_http::{request_json_object, Headers};

use crate::report::{read_entries, Entry};

/// Reports are submitted to a testing collector unless the caller
/// configures `collector_base_url`; this keeps accidental runs out of
/// the production pipeline.
pub const DEFAULT_COLLECTOR_BASE_URL: &str = "https://b.collector.test.ooni.io";

/// The collector operations, injected so runner tests can capture
/// submissions in memory.
#[async_trait]
pub trait Collect: Send + Sync {
    /// Creates a remote report and returns its id.
    async fn create_report(&self, first: &Entry) -> Result<String, Failure>;

    /// Appends one entry to an open report.
    async fn update_report(&self, report_id: &str, entry: &Entry) -> Result<(), Failure>;

    /// Closes a report.
    async fn close_report(&self, report_id: &str) -> Result<(), Failure>;

    /// Uploads a whole report file: create, append each line, close.
    async fn submit_report(&self, path: &Path) -> Result<String, Failure> {
        let entries = read_entries(path)?;
        let first = entries.first().ok_or_else(|| {
            Failure::with_reason(FailureKind::Value, "report file has no entries")
        })?;
        let report_id = self.create_report(first).await?;
        for entry in &entries {
            self.update_report(&report_id, entry).await?;
        }
        self.close_report(&report_id).await?;
        tracing::info!(%report_id, entries = entries.len(), "report submitted");
        Ok(report_id)
    }
}

/// JSON-over-HTTP(S) collector client.
pub struct Collector {
    base_url: String,
    settings: Settings,
    resolver: Arc<dyn Resolve>,
}

impl Collector {
    pub fn new(base_url: impl Into<String>, settings: Settings, resolver: Arc<dyn Resolve>) -> Self {
        Self { base_url: base_url.into(), settings, resolver }
    }

    pub fn from_settings(settings: &Settings, resolver: Arc<dyn Resolve>) -> Self {
        let base_url = settings
            .get_or("collector_base_url", DEFAULT_COLLECTOR_BASE_URL)
            .to_string();
        Self::new(base_url, settings.clone(), resolver)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, Failure> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let (response, parsed) = request_json_object(
            "POST",
            &url,
            body,
            &Headers::new(),
            &self.settings,
            self.resolver.as_ref(),
        )
        .await?;
        if response.status_code >= 400 {
            return Err(Failure::with_reason(
                FailureKind::HttpRequestFailed,
                response.status_code.to_string(),
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Collect for Collector {
    async fn create_report(&self, first: &Entry) -> Result<String, Failure> {
        let body = serde_json::json!({
            "software_name": first.software_name,
            "software_version": first.software_version,
            "probe_asn": first.probe_asn,
            "probe_cc": first.probe_cc,
            "test_name": first.test_name,
            "test_version": first.test_version,
            "data_format_version": first.data_format_version,
            "format": "json",
        });
        let parsed = self.post("/report", &body).await?;
        let report_id = parsed
            .get("report_id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                Failure::with_reason(FailureKind::JsonKey, "response has no report_id")
            })?;
        Ok(report_id.to_string())
    }

    async fn update_report(&self, report_id: &str, entry: &Entry) -> Result<(), Failure> {
        let body = serde_json::json!({ "format": "json", "content": entry });
        self.post(&format!("/report/{report_id}"), &body).await?;
        Ok(())
    }

    async fn close_report(&self, report_id: &str) -> Result<(), Failure> {
        self.post(&format!("/report/{report_id}/close"), &serde_json::json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use probekit_dns::{Message, QueryClass, QueryType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    struct NoResolver;

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

    /// Minimal collector stub: answers each request with the next canned
    /// JSON body.
    async fn stub_collector(replies: Vec<(u16, &'static str)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                // Read until the end of headers, then the content-length.
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&raw[..pos]).to_string();
                        let want: usize = head
                            .lines()
                            .find_map(|l| l.strip_prefix("Content-Length: "))
                            .map(|v| v.parse().unwrap())
                            .unwrap_or(0);
                        if raw.len() >= pos + 4 + want {
                            break;
                        }
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    fn sample_entry() -> Entry {
        Entry {
            test_name: "example".into(),
            test_version: "0.0.1".into(),
            test_start_time: "2018-03-05T134519Z".into(),
            probe_ip: "127.0.0.1".into(),
            probe_asn: "AS0".into(),
            probe_cc: "ZZ".into(),
            input: String::new(),
            measurement_start_time: "2018-03-05 13:45:19".into(),
            test_runtime: 0.1,
            test_keys: serde_json::json!({}),
            software_name: "probekit".into(),
            software_version: "0.1.0".into(),
            data_format_version: "0.2.0".into(),
        }
    }

    #[tokio::test]
    async fn create_update_close_sequence() {
        let addr = stub_collector(vec![
            (200, r#"{"report_id": "r-1"}"#),
            (200, r#"{}"#),
            (200, r#"{}"#),
        ])
        .await;
        let collector = Collector::new(
            format!("http://{addr}"),
            Settings::new(),
            Arc::new(NoResolver),
        );
        let entry = sample_entry();
        let id = collector.create_report(&entry).await.unwrap();
        assert_eq!(id, "r-1");
        collector.update_report(&id, &entry).await.unwrap();
        collector.close_report(&id).await.unwrap();
    }

    #[tokio::test]
    async fn http_errors_carry_the_status_code() {
        let addr = stub_collector(vec![(500, r#"{"error": "internal"}"#)]).await;
        let collector = Collector::new(
            format!("http://{addr}"),
            Settings::new(),
            Arc::new(NoResolver),
        );
        let err = collector.create_report(&sample_entry()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::HttpRequestFailed);
        assert_eq!(err.reason(), "500");
    }

    #[tokio::test]
    async fn default_base_url_is_the_testing_collector() {
        let collector = Collector::from_settings(&Settings::new(), Arc::new(NoResolver));
        assert_eq!(collector.base_url(), DEFAULT_COLLECTOR_BASE_URL);
    }
}
