//! Per-call metadata headers.
//!
//! Keys are case-insensitive (stored lowercase) and may carry several values.
//! Insertion order is kept per key; no ordering is promised across keys.

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from `(key, value)` pairs, appending repeated keys
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut md = Self::new();
        for (k, v) in pairs {
            md.append(k.as_ref(), v);
        }
        md
    }

    /// Replace every value of `key` with `value`, returning the first previous value
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        let previous = self.remove(key).into_iter().next();
        self.append(key, value);
        previous
    }

    /// Add a value to `key` without touching existing values
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((normalize(key), value.into()));
    }

    /// First value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = normalize(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of `key` in insertion order
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = normalize(key);
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove `key`, returning its values
    pub fn remove(&mut self, key: &str) -> Vec<String> {
        let key = normalize(key);
        let mut removed = Vec::new();
        self.entries.retain(|(k, v)| {
            if *k == key {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Merge `other` into `self`. Keys present in `other` replace ours.
    pub fn merge(&mut self, other: Metadata) {
        for key in other.keys() {
            self.remove(&key);
        }
        self.entries.extend(other.entries);
    }

    /// Distinct keys in first-seen order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (k, _) in &self.entries {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check keys and values against what the wire accepts.
    ///
    /// Keys: non-empty, `[a-z0-9-_.]`. Values: visible ASCII or space.
    pub fn validate(&self) -> Result<()> {
        for (k, v) in &self.entries {
            if k.is_empty() {
                return Err(ProtocolError::InvalidMetadata("empty key".into()));
            }
            if !k
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"-_.".contains(&b))
            {
                return Err(ProtocolError::InvalidMetadata(format!("invalid key '{k}'")));
            }
            if !v.bytes().all(|b| b == b' ' || b.is_ascii_graphic()) {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "invalid value for key '{k}'"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_wire(self) -> Vec<(String, String)> {
        self.entries
    }

    pub(crate) fn from_wire(entries: Vec<(String, String)>) -> Self {
        Self::from_pairs(entries)
    }
}

fn normalize(key: &str) -> String {
    key.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("Token", "valid-token");
        assert_eq!(md.get("token"), Some("valid-token"));
        assert_eq!(md.get("TOKEN"), Some("valid-token"));
        assert_eq!(md.keys(), vec!["token".to_string()]);
    }

    #[test]
    fn append_keeps_multiple_values_in_order() {
        let mut md = Metadata::new();
        md.append("x-trace", "a");
        md.append("other", "z");
        md.append("X-Trace", "b");
        assert_eq!(md.get_all("x-trace").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(md.get("x-trace"), Some("a"));
    }

    #[test]
    fn insert_replaces_all_values() {
        let mut md = Metadata::from_pairs([("k", "1"), ("k", "2")]);
        assert_eq!(md.insert("K", "3"), Some("1".to_string()));
        assert_eq!(md.get_all("k").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn merge_gives_precedence_to_incoming_keys() {
        let mut call = Metadata::from_pairs([("token", "caller"), ("x-request-id", "42")]);
        let attached = Metadata::from_pairs([("Token", "valid-token")]);
        call.merge(attached);

        assert_eq!(call.get_all("token").collect::<Vec<_>>(), vec!["valid-token"]);
        assert_eq!(call.get("x-request-id"), Some("42"));
    }

    #[test]
    fn validate_rejects_bad_keys_and_values() {
        assert!(Metadata::from_pairs([("token", "valid-token")]).validate().is_ok());
        assert!(Metadata::from_pairs([("", "v")]).validate().is_err());
        assert!(Metadata::from_pairs([("bad key", "v")]).validate().is_err());
        assert!(Metadata::from_pairs([("k", "line\nbreak")]).validate().is_err());
    }
}
