//! Closed scalar type for dimension options

use std::fmt;

use serde::{Deserialize, Serialize};

/// One option value of a dimension.
///
/// Deliberately closed: strings, integers, finite floats and booleans. This
/// keeps the canonical serialization (and thus the universe identity) total
/// and deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    /// Boolean option
    Bool(bool),
    /// Integer option
    Integer(i64),
    /// Floating point option (must be finite)
    Float(f64),
    /// String option
    Text(String),
}

impl DimensionValue {
    /// `false` only for NaN or infinite floats.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    /// The value as a JSON scalar.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// The string when this is a text option.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Text values print raw, everything else prints as its JSON literal.
impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for DimensionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for DimensionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for DimensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for DimensionValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for DimensionValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for DimensionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
