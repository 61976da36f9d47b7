use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Suffix marking a namespace-clear key, e.g. `term:*`.
pub const NAMESPACE_CLEAR_SUFFIX: &str = ":*";

/// Prefix of keys that only the owning front end may write.
pub const DISPLAY_PREFIX: &str = "display:";

/// A loosely-typed meta value.
///
/// `Null` is only meaningful inside an update, where it deletes the key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetaValue>),
}

impl MetaValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

/// Ordered map of namespaced keys (`term:fontsize`, `view`, ...) to values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaMap(BTreeMap<String, MetaValue>);

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(MetaValue::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MetaValue::as_f64)
    }

    /// Integer view of a numeric value; fractional values are rejected.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let n = self.get_f64(key)?;
        (n.fract() == 0.0).then_some(n as i64)
    }

    /// Apply `update` on top of `self`, returning the merged map.
    ///
    /// Rules, in order:
    /// 1. Every `ns:*` key set to `true` removes `ns` and all `ns:...` keys.
    /// 2. `display:` keys are skipped unless `merge_special` is set.
    /// 3. `null` deletes the key; any other value replaces it.
    ///
    /// Namespace markers are never stored.
    pub fn merged(&self, update: &MetaMap, merge_special: bool) -> MetaMap {
        let mut out = self.0.clone();

        for (key, value) in update.iter() {
            let Some(ns) = key.strip_suffix(NAMESPACE_CLEAR_SUFFIX) else {
                continue;
            };
            if ns.is_empty() || value.as_bool() != Some(true) {
                continue;
            }
            let prefix = format!("{ns}:");
            out.retain(|k, _| k != ns && !k.starts_with(&prefix));
        }

        for (key, value) in update.iter() {
            if key.ends_with(NAMESPACE_CLEAR_SUFFIX) {
                continue;
            }
            if !merge_special && key.starts_with(DISPLAY_PREFIX) {
                continue;
            }
            if value.is_null() {
                out.remove(key);
            } else {
                out.insert(key.clone(), value.clone());
            }
        }

        MetaMap(out)
    }
}

impl<K: Into<String>, V: Into<MetaValue>> FromIterator<(K, V)> for MetaMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for MetaMap {
    type Item = (String, MetaValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, MetaValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
