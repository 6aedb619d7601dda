use std::net::IpAddr;

use maxminddb::geoip2;
use probekit_common::{Failure, FailureKind, Settings};

/// Where the probe appears to be: address, autonomous system, country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeLocation {
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_cc: String,
}

impl Default for ProbeLocation {
    fn default() -> Self {
        Self {
            probe_ip: "127.0.0.1".to_string(),
            probe_asn: "AS0".to_string(),
            probe_cc: "ZZ".to_string(),
        }
    }
}

/// GeoIP database access, injected so tests can run without databases.
pub trait GeoIpResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Result<ProbeLocation, Failure>;
}

/// Lookup backed by MaxMind country and ASN databases.
#[derive(Debug)]
pub struct MaxMindGeoIp {
    country: maxminddb::Reader<Vec<u8>>,
    asn: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindGeoIp {
    pub fn open(country_path: &str, asn_path: &str) -> Result<Self, Failure> {
        let country = maxminddb::Reader::open_readfile(country_path).map_err(|err| {
            Failure::with_reason(FailureKind::FileIo, format!("{country_path}: {err}"))
        })?;
        let asn = maxminddb::Reader::open_readfile(asn_path).map_err(|err| {
            Failure::with_reason(FailureKind::FileIo, format!("{asn_path}: {err}"))
        })?;
        Ok(Self { country, asn })
    }

    /// Opens the databases named by `geoip_country_path` and
    /// `geoip_asn_path`; `None` when the settings do not configure both.
    pub fn from_settings(settings: &Settings) -> Option<Result<Self, Failure>> {
        let country = settings.get("geoip_country_path")?;
        let asn = settings.get("geoip_asn_path")?;
        Some(Self::open(country, asn))
    }
}

impl GeoIpResolver for MaxMindGeoIp {
    fn lookup(&self, ip: IpAddr) -> Result<ProbeLocation, Failure> {
        let country: geoip2::Country = self.country.lookup(ip).map_err(|err| {
            Failure::with_reason(FailureKind::Generic, format!("country lookup: {err}"))
        })?;
        let asn: geoip2::Asn = self.asn.lookup(ip).map_err(|err| {
            Failure::with_reason(FailureKind::Generic, format!("asn lookup: {err}"))
        })?;
        let probe_cc = country
            .country
            .and_then(|c| c.iso_code)
            .unwrap_or("ZZ")
            .to_string();
        let probe_asn = asn
            .autonomous_system_number
            .map(|n| format!("AS{n}"))
            .unwrap_or_else(|| "AS0".to_string());
        Ok(ProbeLocation { probe_ip: ip.to_string(), probe_asn, probe_cc })
    }
}

/// Fixed answer, for tests and for platforms without databases.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoIp(pub ProbeLocation);

impl GeoIpResolver for StaticGeoIp {
    fn lookup(&self, ip: IpAddr) -> Result<ProbeLocation, Failure> {
        let mut location = self.0.clone();
        location.probe_ip = ip.to_string();
        Ok(location)
    }
}
