//! The in-memory cell representation the suppression kernel operates on.
//!
//! Aggregation happens in the substrate; once a dataset's cells are
//! materialized they are small enough (one row per distinct dimension
//! combination of a table destined for publication) that the suppression
//! bookkeeping itself runs as ordinary Rust over an in-memory vector. This
//! keeps the decision logic in `kernel` a pure, directly unit-testable
//! function rather than a set of per-row scalar SQL UDF registrations.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Cell {
    pub dimensions: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, Value>,
    pub is_anonymous: bool,
    pub is_redacted: bool,
    pub redaction_reason: Option<String>,
    pub peer_group: Option<Value>,
    pub redacted_peers: Option<Value>,
}

impl Cell {
    pub fn metric_f64(&self, alias: &str) -> f64 {
        self.metrics
            .get(alias)
            .map(json_to_f64)
            .unwrap_or(0.0)
    }

    pub fn dimension(&self, name: &str) -> &Value {
        self.dimensions.get(name).unwrap_or(&Value::Null)
    }

    /// Append a reason, never overwriting one already recorded.
    pub fn push_reason(&mut self, reason: &str) {
        match &mut self.redaction_reason {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(reason);
            }
            None => self.redaction_reason = Some(reason.to_string()),
        }
    }
}

pub fn json_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Order dimension values with NULLs sorting last, consistent with how the
/// target dimension's ordering is defined throughout the kernel.
pub fn cmp_json_nulls_last(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}
