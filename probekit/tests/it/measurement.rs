//! A complete measurement: a test driving the transport layer under the
//! runner, the report landing on disk, and the collector receiving it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use probekit::nettest::collector::Collector;
use probekit::nettest::report::read_entries;
use probekit::{Failure, FailureKind, NetTest, Reactor, Runner, Settings, TestKeys};
use tokio::net::TcpListener;

use crate::helpers::{stub_json_server, NoResolver};

/// A minimal reachability test: try a TCP connect to `host:port` from the
/// input line and record the outcome.
struct TcpReachability;

#[async_trait]
impl NetTest for TcpReachability {
    fn name(&self) -> &str {
        "tcp_reachability"
    }

    fn version(&self) -> &str {
        "0.0.1"
    }

    fn needs_input(&self) -> bool {
        true
    }

    async fn run(
        &self,
        input: &str,
        settings: &Settings,
        keys: &mut TestKeys,
    ) -> Result<(), Failure> {
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| Failure::with_reason(FailureKind::Value, "input is not host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Failure::with_reason(FailureKind::Value, "bad port"))?;
        let mut txp = probekit::connect(host, port, settings, &NoResolver).await?;
        keys.insert("connection".into(), "success".into());
        txp.close().await;
        Ok(())
    }
}

fn runner_for(mut settings: Settings) -> Runner {
    // Pin a nameserver so building the default backend never depends on
    // the host's resolver configuration; tests swap in a stub anyway.
    settings.set("dns/nameserver", "127.0.0.1");
    Runner::new(settings).expect("runner").with_resolver(Arc::new(NoResolver))
}

#[tokio::test]
async fn measurement_entries_record_success_and_failure() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs.txt");
    std::fs::write(
        &inputs,
        format!("127.0.0.1:{open_port}\n192.0.2.9:81\n"),
    )
    .unwrap();

    let mut settings = Settings::new();
    settings.set("input_filepath", inputs.to_string_lossy());
    settings.set("output_filepath", dir.path().join("report.json").to_string_lossy());
    settings.set("net/timeout", "0.2");
    settings.set("no_collector", "yes");

    let runner = runner_for(settings);
    let outcome = runner.run(&TcpReachability, |_| {}).await.unwrap();
    assert_eq!(outcome.measurements, 2);

    let entries = read_entries(&outcome.report_path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].test_name, "tcp_reachability");
    assert_eq!(entries[0].test_keys["connection"], "success");
    assert_eq!(entries[0].test_keys["failure"], serde_json::Value::Null);
    // The dead address surfaces the cascade failure string.
    assert_eq!(entries[1].test_keys["failure"], "connect_error");
    assert!(entries[1].test_runtime > 0.0);
    assert_eq!(entries[1].probe_ip, "127.0.0.1");
}

#[tokio::test]
async fn finished_report_is_submitted_to_the_collector() {
    let _ = tracing_subscriber::fmt::try_init();

    // create + one update + close.
    let collector_addr = stub_json_server(vec![
        (200, r#"{"report_id": "e2e-report"}"#.to_string()),
        (200, "{}".to_string()),
        (200, "{}".to_string()),
    ])
    .await;

    struct Trivial;

    #[async_trait]
    impl NetTest for Trivial {
        fn name(&self) -> &str {
            "trivial"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        async fn run(
            &self,
            _input: &str,
            _settings: &Settings,
            keys: &mut TestKeys,
        ) -> Result<(), Failure> {
            keys.insert("ok".into(), true.into());
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::new();
    settings.set("output_filepath", dir.path().join("report.json").to_string_lossy());
    settings.set("collector_base_url", format!("http://{collector_addr}"));
    settings.set("dns/nameserver", "127.0.0.1");

    let resolver: Arc<dyn probekit::Resolve> = Arc::new(NoResolver);
    let collector = Collector::from_settings(&settings, resolver.clone());
    let runner = Runner::new(settings)
        .unwrap()
        .with_resolver(resolver)
        .with_collector(Arc::new(collector));
    let outcome = runner.run(&Trivial, |_| {}).await.unwrap();
    assert_eq!(outcome.report_id.as_deref(), Some("e2e-report"));
}

#[test]
fn reactor_drives_a_full_measurement_from_sync_code() {
    let _ = tracing_subscriber::fmt::try_init();

    struct Trivial;

    #[async_trait]
    impl NetTest for Trivial {
        fn name(&self) -> &str {
            "trivial"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        async fn run(
            &self,
            _input: &str,
            _settings: &Settings,
            keys: &mut TestKeys,
        ) -> Result<(), Failure> {
            keys.insert("ok".into(), true.into());
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::new();
    settings.set("output_filepath", dir.path().join("report.json").to_string_lossy());
    settings.set("no_collector", "yes");

    let reactor = Reactor::new().unwrap();
    let runner = runner_for(settings);
    let seen = Mutex::new(0usize);
    let outcome = runner
        .run_blocking(&reactor, &Trivial, |_| {
            *seen.lock().unwrap() += 1;
        })
        .unwrap();
    assert_eq!(outcome.measurements, 1);
    assert_eq!(*seen.lock().unwrap(), 1);
}
