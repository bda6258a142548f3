use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Node output tagged with a `kind` that edge guards match on.
///
/// The payload is JSON so that heterogeneous nodes can hand values to each
/// other through one graph-level type; typed accessors convert at the edges
/// of a node body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingValue {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl RoutingValue {
    /// Kind given to values that were not explicitly tagged.
    pub const DEFAULT_KIND: &'static str = "value";

    /// Wrap a raw payload under the default kind.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            kind: Self::DEFAULT_KIND.to_string(),
            payload,
        }
    }

    /// Wrap a raw payload under an explicit kind.
    pub fn tagged(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize a typed value under the default kind.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Serialize a typed value under an explicit kind.
    pub fn typed<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::tagged(kind, serde_json::to_value(value)?))
    }

    /// A payload-less marker value.
    pub fn unit(kind: impl Into<String>) -> Self {
        Self::tagged(kind, serde_json::Value::Null)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(WeftError::from)
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    pub fn as_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.payload.as_i64()
    }

    /// Same payload under a different kind.
    pub fn retag(self, kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: self.payload,
        }
    }
}

impl From<serde_json::Value> for RoutingValue {
    fn from(payload: serde_json::Value) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for RoutingValue {
    fn from(s: &str) -> Self {
        Self::new(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for RoutingValue {
    fn from(s: String) -> Self {
        Self::new(serde_json::Value::String(s))
    }
}

impl From<i64> for RoutingValue {
    fn from(n: i64) -> Self {
        Self::new(serde_json::Value::from(n))
    }
}

impl std::fmt::Display for RoutingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.payload)
    }
}
