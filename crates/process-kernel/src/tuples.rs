//! Ordered key/value sets for command-line flags and environment variables

use crate::error::{Error, Result};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::LazyLock;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$").expect("valid key pattern"));

static INTEGER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-+]?[0-9]+$").expect("valid integer pattern"));

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern"));

/// Ordered set of unique keys with string values
///
/// Insertion order is preserved. Setting an existing key replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuples {
    entries: Vec<(String, String)>,
}

impl Tuples {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a key is usable as a flag or variable name
    pub fn validate_key(key: &str) -> Result<()> {
        if KEY_PATTERN.is_match(key) {
            Ok(())
        } else {
            Err(Error::bad_parameter(format!("invalid key: {key:?}")))
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Set a value, replacing an existing key in place
    pub fn set_string_for_key(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        Self::validate_key(key)?;
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    /// Remove a key, returning its value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Copy in every key of `defaults` that is not already set
    ///
    /// Existing values always win, so applying several sources left to right
    /// gives the first writer precedence.
    pub fn merge_missing(&mut self, defaults: &Tuples) {
        for (key, value) in &defaults.entries {
            if !self.contains_key(key) {
                self.entries.push((key.clone(), value.clone()));
            }
        }
    }

    /// Render as command-line flags: `-key` or `-key=value`
    pub fn flags(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("-{k}")
                } else {
                    format!("-{k}={}", quote(v))
                }
            })
            .collect()
    }

    /// Render as environment assignments: `key=value`
    pub fn env(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v)))
            .collect()
    }
}

/// Quote a value unless it is a signed integer or a bare identifier
fn quote(value: &str) -> String {
    if INTEGER_PATTERN.is_match(value) || IDENTIFIER_PATTERN.is_match(value) {
        value.to_string()
    } else {
        format!("{value:?}")
    }
}

impl<'a> IntoIterator for &'a Tuples {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl TryFrom<Vec<(String, String)>> for Tuples {
    type Error = Error;

    fn try_from(pairs: Vec<(String, String)>) -> Result<Self> {
        let mut tuples = Tuples::new();
        for (key, value) in pairs {
            tuples.set_string_for_key(&key, value)?;
        }
        Ok(tuples)
    }
}

impl Serialize for Tuples {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Tuples {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TuplesVisitor;

        impl<'de> Visitor<'de> for TuplesVisitor {
            type Value = Tuples;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Tuples, A::Error> {
                let mut tuples = Tuples::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    tuples
                        .set_string_for_key(&key, value)
                        .map_err(serde::de::Error::custom)?;
                }
                Ok(tuples)
            }
        }

        deserializer.deserialize_map(TuplesVisitor)
    }
}
