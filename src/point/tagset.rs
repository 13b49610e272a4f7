use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{is_valid_name, PointError};

/// Tag key to tag value map with unique keys.
///
/// Keys are kept sorted so the canonical serialization is stable regardless
/// of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tagset(BTreeMap<String, String>);

impl Tagset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tagset from pairs, rejecting repeated keys.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, PointError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tags = Self::new();
        for (k, v) in pairs {
            if tags.0.contains_key(k) {
                return Err(PointError::DuplicateTag { key: k.to_string() });
            }
            tags.0.insert(k.to_string(), v.to_string());
        }
        Ok(tags)
    }

    /// Inserts or replaces a tag, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks every key and value against the allowed character set.
    pub fn validate(&self) -> Result<(), PointError> {
        for (k, v) in &self.0 {
            if !is_valid_name(k) || !is_valid_name(v) {
                return Err(PointError::InvalidTag {
                    key: k.clone(),
                    value: v.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Tagset {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Tagset {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonical form `{k1=v1,k2=v2}`, used as part of the metadata dedup key.
impl fmt::Display for Tagset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}
