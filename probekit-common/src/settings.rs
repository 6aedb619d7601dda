use std::collections::BTreeMap;
use std::str::FromStr;

use crate::failure::{Failure, FailureKind};

/// Per-operation configuration: a string-to-string map with typed getters.
///
/// Well-known keys are namespaced ("dns/timeout", "net/ssl", "http/url",
/// ...); unknown keys are carried through untouched so stages can hand
/// state to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    map: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    /// Parses the value under `key`. Absent keys are `Ok(None)`; present
    /// but malformed values are a `ValueError`.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, Failure> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                Failure::with_reason(FailureKind::Value, format!("{key}: invalid value {raw:?}"))
            }),
        }
    }

    /// Interprets the value under `key` as a boolean flag. "yes", "true"
    /// and "1" are truthy; "no", "false", "0" and "" are falsy.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, Failure> {
        match self.get(key) {
            None => Ok(None),
            Some("yes") | Some("true") | Some("1") => Ok(Some(true)),
            Some("no") | Some("false") | Some("0") | Some("") => Ok(Some(false)),
            Some(raw) => Err(Failure::with_reason(
                FailureKind::Value,
                format!("{key}: invalid boolean {raw:?}"),
            )),
        }
    }

    /// `true` iff `key` is present and truthy; malformed values count as
    /// falsy here (the strict reading is [`Settings::get_bool`]).
    pub fn is_truthy(&self, key: &str) -> bool {
        matches!(self.get_bool(key), Ok(Some(true)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (k, v) in iter {
            settings.set(k, v);
        }
        settings
    }
}
