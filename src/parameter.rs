//! Parameter values and parameter sets.
//!
//! A configuration is a mapping from parameter name to [`ParamValue`]: a number,
//! a string, a flag, a list or a nested mapping. [`ParameterSet`] is the mutable
//! draft form; once saved through the
//! [`ConfigurationStore`](crate::store::ConfigurationStore) it is frozen inside a
//! [`ConfigSnapshot`](crate::snapshot::ConfigSnapshot).
//!
//! # Type stability
//!
//! The store enforces that a key keeps its [`ValueKind`] across versions. Integers
//! and floats share the `number` kind, so `power = 1` may later become
//! `power = 1.05`, but `power = "high"` is rejected. Nested mappings are compared
//! key by key.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value (lengths in ns, ADC thresholds, ...)
    Int(i64),
    /// Floating point value (frequencies, amplitudes, ...)
    Float(f64),
    /// Free text (addresses, modes)
    Text(String),
    /// Ordered list of values
    List(Vec<ParamValue>),
    /// Nested mapping
    Map(BTreeMap<String, ParamValue>),
}

/// Type class of a [`ParamValue`], used for schema checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `true` / `false`
    Bool,
    /// Integer or float
    Number,
    /// String
    Text,
    /// List
    List,
    /// Nested mapping
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        };
        f.write_str(name)
    }
}

impl ParamValue {
    /// Type class of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            ParamValue::Bool(_) => ValueKind::Bool,
            ParamValue::Int(_) | ParamValue::Float(_) => ValueKind::Number,
            ParamValue::Text(_) => ValueKind::Text,
            ParamValue::List(_) => ValueKind::List,
            ParamValue::Map(_) => ValueKind::Map,
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Mapping view of the value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            ParamValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Rejects values that cannot be stored losslessly (NaN and infinities
    /// serialize to `null` in JSON).
    fn check_finite(&self, path: &str) -> AppResult<()> {
        match self {
            ParamValue::Float(v) if !v.is_finite() => Err(DaqError::Validation(format!(
                "parameter '{path}' is not a finite number ({v})"
            ))),
            ParamValue::List(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| item.check_finite(&format!("{path}[{i}]"))),
            ParamValue::Map(map) => map
                .iter()
                .try_for_each(|(k, v)| v.check_finite(&format!("{path}.{k}"))),
            _ => Ok(()),
        }
    }
}

/// Checks that `new` keeps the type established by `prior` for the same key.
pub fn check_compatible(path: &str, new: &ParamValue, prior: &ParamValue) -> AppResult<()> {
    if new.kind() != prior.kind() {
        return Err(DaqError::Validation(format!(
            "parameter '{path}' changed type from {} to {}",
            prior.kind(),
            new.kind()
        )));
    }
    if let (ParamValue::Map(new_map), ParamValue::Map(prior_map)) = (new, prior) {
        for (key, value) in new_map {
            if let Some(prior_value) = prior_map.get(key) {
                check_compatible(&format!("{path}.{key}"), value, prior_value)?;
            }
        }
    }
    Ok(())
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(ParamValue::Float(v as f64), ParamValue::Int)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<ParameterSet> for ParamValue {
    fn from(v: ParameterSet) -> Self {
        ParamValue::Map(v.0)
    }
}

/// An ordered, mutable mapping of parameter names to values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.0.insert(key.to_string(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    /// Numeric value of `key`, if present and numeric.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ParamValue::as_f64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Returns a copy of `self` where every key of `delta` overrides the
    /// existing value. Keys absent from `delta` are copied unchanged.
    pub fn merged(&self, delta: &ParameterSet) -> ParameterSet {
        let mut merged = self.0.clone();
        for (key, value) in &delta.0 {
            merged.insert(key.clone(), value.clone());
        }
        ParameterSet(merged)
    }

    /// Rejects values that would not survive a save/load cycle.
    pub fn validate(&self) -> AppResult<()> {
        for (key, value) in &self.0 {
            if key.is_empty() {
                return Err(DaqError::Validation("empty parameter name".into()));
            }
            value.check_finite(key)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, ParamValue)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        ParameterSet(iter.into_iter().collect())
    }
}
