use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;

use crate::failure::{Failure, FailureKind};

/// UTC wall-clock now.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// The compact timestamp used in report filenames and headers,
/// e.g. `2018-03-05T134519Z`.
pub fn compact_timestamp(when: &DateTime<Utc>) -> String {
    when.format("%Y-%m-%dT%H%M%SZ").to_string()
}

/// The timestamp written into measurement entries,
/// e.g. `2018-03-05 13:45:19`.
pub fn entry_timestamp(when: &DateTime<Utc>) -> String {
    when.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parses an ISO-8601 UTC timestamp ("2018-03-05T13:45:19Z" or without
/// the trailing Z) as used by the orchestrator registry.
pub fn parse_iso8601_utc(raw: &str) -> Result<DateTime<Utc>, Failure> {
    let trimmed = raw.strip_suffix('Z').unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|err| {
            Failure::with_reason(FailureKind::Value, format!("invalid timestamp {raw:?}: {err}"))
        })
}

fn random_within_charset(charset: &[u8], length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| charset[rng.gen_range(0..charset.len())] as char).collect()
}

/// A random string drawn from all printable ASCII characters.
pub fn random_printable(length: usize) -> String {
    const CHARSET: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@\
        ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
    random_within_charset(CHARSET, length)
}

/// A random alphanumeric string.
pub fn random_str(length: usize) -> String {
    const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    random_within_charset(CHARSET, length)
}
