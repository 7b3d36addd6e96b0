//! Records
//!
//! Live events and batch rows share one open-schema representation: an
//! ordered map from field name to JSON value. Nothing beyond "is a JSON
//! object" is assumed about the payload, so extra or missing fields never
//! cause a decoding failure.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Possible errors when decoding a record from the wire
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Payload is valid JSON, but not an object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// One observation, as produced by the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

/// One real-time observation delivered over the live connection.
pub type LiveEvent = Record;

/// One row of a completed batch analysis.
pub type BatchRow = Record;

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Record {
        Record { fields }
    }

    /// Decode a single record from a text frame.
    pub fn from_json(text: &str) -> Result<Record, DecodeError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => Ok(Record { fields }),
            other => Err(DecodeError::NotAnObject(kind_name(&other))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Field names, in the order the backend sent them.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    /// Display string for a field. Missing and null fields are empty,
    /// strings are shown raw, anything else as compact JSON.
    pub fn cell(&self, field: &str) -> String {
        match self.fields.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// The anomaly field. Some backends capitalize it; the capitalized
    /// field wins unless it is null.
    fn anomaly_field(&self) -> Option<&Value> {
        self.fields
            .get("Anomaly")
            .filter(|v| !v.is_null())
            .or_else(|| self.fields.get("anomaly"))
    }

    /// Numeric anomaly flag/score, 0 when absent or not numeric.
    pub fn anomaly_score(&self) -> f64 {
        match self.anomaly_field() {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::Bool(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        match self.anomaly_field() {
            Some(Value::String(s)) => {
                let s = s.trim();
                s.eq_ignore_ascii_case("true") || s.parse::<f64>().map_or(false, |v| v != 0.0)
            }
            _ => self.anomaly_score() != 0.0,
        }
    }

    pub fn anomaly_reason(&self) -> Option<&str> {
        match self.fields.get("anomaly_reason") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.fields.get("timestamp").and_then(|v| v.as_str())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Record {
        Record { fields }
    }
}

/// Aggregate counts returned with a batch analysis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub anomalies: u64,
    #[serde(default)]
    pub normal: u64,
    /// Anything else the backend chose to include.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Summary {
    pub fn anomaly_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.anomalies as f64 / self.total as f64
        }
    }
}

/// Response to a batch analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: Summary,
    #[serde(default)]
    pub rows: Vec<BatchRow>,
    pub file_id: String,
}

/// Line chart points for a sequence of rows: position and anomaly score.
pub fn anomaly_series(rows: &[BatchRow]) -> Vec<(usize, f64)> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| (i, row.anomaly_score()))
        .collect()
}
