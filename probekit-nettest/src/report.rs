use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use probekit_common::{util, Failure, FailureKind};
use serde::{Deserialize, Serialize};

/// One measurement observation, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub test_name: String,
    pub test_version: String,
    pub test_start_time: String,
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_cc: String,
    pub input: String,
    pub measurement_start_time: String,
    pub test_runtime: f64,
    pub test_keys: serde_json::Value,
    pub software_name: String,
    pub software_version: String,
    pub data_format_version: String,
}

/// A newline-delimited JSON report owned by the runner.
#[derive(Debug)]
pub struct ReportFile {
    path: PathBuf,
    file: File,
}

impl ReportFile {
    /// Creates `report-<test_name>-<timestamp>-<n>.json` under `dir`,
    /// with the lowest `n` that makes the name unique.
    pub fn create(
        dir: &Path,
        test_name: &str,
        start: &DateTime<Utc>,
    ) -> Result<Self, Failure> {
        let stamp = util::compact_timestamp(start);
        for n in 0.. {
            let path = dir.join(format!("report-{test_name}-{stamp}-{n}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    tracing::debug!(path = %path.display(), "report opened");
                    return Ok(Self { path, file });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(Failure::with_reason(
                        FailureKind::FileIo,
                        format!("{}: {err}", path.display()),
                    ))
                }
            }
        }
        unreachable!("some suffix is unique")
    }

    /// Opens exactly `path`, for callers that configured an explicit
    /// output file.
    pub fn create_at(path: &Path) -> Result<Self, Failure> {
        let file = File::create(path).map_err(|err| {
            Failure::with_reason(FailureKind::FileIo, format!("{}: {err}", path.display()))
        })?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry as a JSON line.
    pub fn write_entry(&mut self, entry: &Entry) -> Result<(), Failure> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(|err| Failure::with_reason(FailureKind::FileIo, err.to_string()))
    }

    /// Flushes and closes the file, returning its path.
    pub fn close(mut self) -> Result<PathBuf, Failure> {
        self.file
            .flush()
            .map_err(|err| Failure::with_reason(FailureKind::FileIo, err.to_string()))?;
        Ok(self.path)
    }
}

/// Reads a report back as its entries, in insertion order.
pub fn read_entries(path: &Path) -> Result<Vec<Entry>, Failure> {
    let file = File::open(path).map_err(|err| {
        Failure::with_reason(FailureKind::FileIo, format!("{}: {err}", path.display()))
    })?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line =
            line.map_err(|err| Failure::with_reason(FailureKind::FileIo, err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}
