#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! The measurement layer of probekit: the runner that iterates a test
//! over its inputs and owns the report file, the collector client that
//! uploads finished reports, the orchestrator registration state machine
//! and GeoIP lookup of the probe's vantage point.

pub mod collector;
pub mod geoip;
pub mod orchestrate;
pub mod report;
pub mod runner;

pub use collector::{Collect, Collector, DEFAULT_COLLECTOR_BASE_URL};
pub use geoip::{GeoIpResolver, MaxMindGeoIp, ProbeLocation, StaticGeoIp};
pub use orchestrate::{Authentication, ClientMetadata};
pub use report::{Entry, ReportFile};
pub use runner::{NetTest, RunOutcome, Runner, TestKeys};
