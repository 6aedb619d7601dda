use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use probekit_common::{util, Failure, FailureKind, Reactor, Settings};
use probekit_dns::{resolver_from_settings, QueryClass, QueryType, Resolve};

use crate::collector::{Collect, Collector};
use crate::geoip::{GeoIpResolver, MaxMindGeoIp, ProbeLocation};
use crate::report::{Entry, ReportFile};

const SOFTWARE_NAME: &str = "probekit";
const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
const DATA_FORMAT_VERSION: &str = "0.2.0";

/// The keys a test emits for one measurement.
pub type TestKeys = serde_json::Map<String, serde_json::Value>;

/// A measurement test: an async state machine that drives the resolver,
/// transport and HTTP layers and fills in the entry's test keys.
#[async_trait]
pub trait NetTest: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Whether the test iterates the lines of `input_filepath`.
    fn needs_input(&self) -> bool {
        false
    }

    async fn run(
        &self,
        input: &str,
        settings: &Settings,
        keys: &mut TestKeys,
    ) -> Result<(), Failure>;
}

/// What one invocation produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub report_path: PathBuf,
    pub report_id: Option<String>,
    pub measurements: usize,
}

/// Drives one test over its inputs: GeoIP begin step, report file,
/// per-measurement timing and failure recording, collector submission.
pub struct Runner {
    settings: Settings,
    resolver: Arc<dyn Resolve>,
    geoip: Option<Arc<dyn GeoIpResolver>>,
    collector: Arc<dyn Collect>,
}

impl Runner {
    /// Builds a runner with the backends the settings describe.
    pub fn new(settings: Settings) -> Result<Self, Failure> {
        let resolver: Arc<dyn Resolve> = Arc::from(resolver_from_settings(&settings)?);
        let geoip = match MaxMindGeoIp::from_settings(&settings) {
            Some(Ok(geoip)) => Some(Arc::new(geoip) as Arc<dyn GeoIpResolver>),
            Some(Err(failure)) => {
                // GeoIP is best-effort: fall back to the default location.
                tracing::warn!(failure = failure.ooni_failure(), "geoip unavailable");
                None
            }
            None => None,
        };
        let collector = Arc::new(Collector::from_settings(&settings, resolver.clone()));
        Ok(Self { settings, resolver, geoip, collector })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_geoip(mut self, geoip: Arc<dyn GeoIpResolver>) -> Self {
        self.geoip = Some(geoip);
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collect>) -> Self {
        self.collector = collector;
        self
    }

    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    /// Runs `test`, invoking `on_entry` after each measurement lands in
    /// the report.
    pub async fn run(
        &self,
        test: &dyn NetTest,
        mut on_entry: impl FnMut(&Entry) + Send,
    ) -> Result<RunOutcome, Failure> {
        let start = util::utc_now();
        let location = self.locate_probe();
        self.lookup_resolver_ip().await;

        let mut report = match self.settings.get("output_filepath") {
            Some(path) => ReportFile::create_at(Path::new(path))?,
            None => ReportFile::create(Path::new("."), test.name(), &start)?,
        };

        let inputs = self.load_inputs(test)?;
        let mut measurements = 0usize;
        for input in inputs {
            let measurement_start = util::utc_now();
            let clock = Instant::now();
            let mut keys = TestKeys::new();
            if let Err(failure) = test.run(&input, &self.settings, &mut keys).await {
                tracing::warn!(
                    %input,
                    failure = failure.ooni_failure(),
                    "measurement failed, continuing"
                );
                keys.insert("failure".to_string(), failure.ooni_failure().into());
            }
            keys.entry("failure".to_string())
                .or_insert(serde_json::Value::Null);

            let entry = Entry {
                test_name: test.name().to_string(),
                test_version: test.version().to_string(),
                test_start_time: util::compact_timestamp(&start),
                probe_ip: location.probe_ip.clone(),
                probe_asn: location.probe_asn.clone(),
                probe_cc: location.probe_cc.clone(),
                input,
                measurement_start_time: util::entry_timestamp(&measurement_start),
                test_runtime: clock.elapsed().as_secs_f64(),
                test_keys: serde_json::Value::Object(keys),
                software_name: SOFTWARE_NAME.to_string(),
                software_version: SOFTWARE_VERSION.to_string(),
                data_format_version: DATA_FORMAT_VERSION.to_string(),
            };
            report.write_entry(&entry)?;
            on_entry(&entry);
            measurements += 1;

            // Yield between measurements so cancellation and timers get a
            // chance to run and deep input lists do not grow the stack.
            tokio::task::yield_now().await;
        }

        let report_path = report.close()?;
        let report_id = if self.settings.is_truthy("no_collector") {
            None
        } else {
            Some(self.collector.submit_report(&report_path).await?)
        };
        Ok(RunOutcome { report_path, report_id, measurements })
    }

    /// Convenience entry point for synchronous front-ends: drives
    /// [`Runner::run`] on the given reactor.
    pub fn run_blocking(
        &self,
        reactor: &Reactor,
        test: &dyn NetTest,
        on_entry: impl FnMut(&Entry) + Send,
    ) -> Result<RunOutcome, Failure> {
        reactor.block_on(self.run(test, on_entry))?
    }

    /// GeoIP begin step: look the probe up, fall back to the redacted
    /// defaults on any failure, honor `save_real_probe_ip`.
    fn locate_probe(&self) -> ProbeLocation {
        let configured = self
            .settings
            .get("probe_ip")
            .and_then(|raw| raw.parse::<IpAddr>().ok());
        let located = match (&self.geoip, configured) {
            (Some(geoip), Some(ip)) => match geoip.lookup(ip) {
                Ok(location) => location,
                Err(failure) => {
                    tracing::warn!(failure = failure.ooni_failure(), "geoip lookup failed");
                    ProbeLocation::default()
                }
            },
            (None, Some(ip)) => {
                ProbeLocation { probe_ip: ip.to_string(), ..ProbeLocation::default() }
            }
            _ => ProbeLocation::default(),
        };
        let save_real = self.settings.is_truthy("save_real_probe_ip");
        if save_real {
            located
        } else {
            ProbeLocation {
                probe_ip: ProbeLocation::default().probe_ip,
                ..located
            }
        }
    }

    /// Best-effort: a failure here never aborts the run.
    async fn lookup_resolver_ip(&self) {
        match self
            .resolver
            .query(QueryClass::In, QueryType::A, "whoami.akamai.net")
            .await
        {
            Ok(message) => {
                let resolver_ip = message.answers.iter().find_map(|a| a.ipv4);
                tracing::debug!(?resolver_ip, "resolver lookup done");
            }
            Err(failure) => {
                tracing::debug!(failure = failure.ooni_failure(), "resolver lookup failed");
            }
        }
    }

    fn load_inputs(&self, test: &dyn NetTest) -> Result<Vec<String>, Failure> {
        if !test.needs_input() {
            return Ok(vec![String::new()]);
        }
        let path = self.settings.get("input_filepath").ok_or_else(|| {
            Failure::with_reason(FailureKind::MissingRequiredInputFile, "input_filepath not set")
        })?;
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Failure::with_reason(FailureKind::CannotOpenInputFile, format!("{path}: {err}"))
        })?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
