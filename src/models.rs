//! Defines the core data structures used in the lead-enricher application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) const FIRST_NAME: &str = "First Name";
pub(crate) const LAST_NAME: &str = "Last Name";
pub(crate) const COMPANY: &str = "Company / Account";
pub(crate) const PHONE: &str = "Phone";
pub(crate) const EMAIL: &str = "Email";

/// The five identity fields, in fingerprint order.
pub(crate) const IDENTITY_COLUMNS: [&str; 5] = [FIRST_NAME, LAST_NAME, COMPANY, PHONE, EMAIL];

/// Rendering of the absent marker inside fingerprints and lookup tables.
pub(crate) const ABSENT_TOKEN: &str = "nan";

/// A single cell. `Absent` is distinct from an empty string in memory but
/// both are written as an empty CSV field.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum Value {
    #[default]
    Absent,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ColumnKind {
    Text,
    Int,
    Float,
    Bool,
    /// Serialized JSON kept as text.
    Json,
}

impl ColumnKind {
    /// Text and JSON columns share a representation.
    pub(crate) fn is_textual(self) -> bool {
        matches!(self, ColumnKind::Text | ColumnKind::Json)
    }
}

impl Value {
    pub(crate) fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Text content with surrounding whitespace removed; empty text counts as absent.
    pub(crate) fn as_trimmed_str(&self) -> Option<&str> {
        self.as_str().map(str::trim).filter(|s| !s.is_empty())
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if f.is_finite() => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    pub(crate) fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Text(s) => parse_bool(s),
            _ => None,
        }
    }

    /// Builds a cell from a CSV field.
    pub(crate) fn from_csv(field: &str) -> Self {
        if field.is_empty() {
            Value::Absent
        } else {
            Value::Text(field.to_string())
        }
    }

    /// Renders the cell as a CSV field.
    pub(crate) fn to_csv(&self) -> String {
        match self {
            Value::Absent => String::new(),
            Value::Text(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => String::new(),
            Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        }
    }

    /// Canonical textual form used by fingerprints and lookup tables.
    pub(crate) fn canonical(&self) -> String {
        match self {
            Value::Absent => ABSENT_TOKEN.to_string(),
            other => other.to_csv(),
        }
    }

    /// Maps NaN-like cells to `Absent`.
    pub(crate) fn normalized(self) -> Self {
        match self {
            Value::Float(f) if !f.is_finite() => Value::Absent,
            Value::Text(s) if matches!(s.as_str(), "" | "nan" | "NaN" | "NaT") => Value::Absent,
            other => other,
        }
    }

    /// Converts the cell to the representation of `kind`. Cells that cannot
    /// be represented become `Absent`.
    pub(crate) fn coerce(self, kind: ColumnKind) -> Self {
        match (kind, self) {
            (_, Value::Absent) => Value::Absent,
            (ColumnKind::Text | ColumnKind::Json, Value::Text(s)) => Value::Text(s),
            (ColumnKind::Text | ColumnKind::Json, other) => Value::Text(other.to_csv()),
            (ColumnKind::Int, Value::Int(i)) => Value::Int(i),
            (ColumnKind::Int, Value::Float(f)) if f.is_finite() && f.fract() == 0.0 => {
                Value::Int(f as i64)
            }
            (ColumnKind::Int, Value::Bool(b)) => Value::Int(b as i64),
            (ColumnKind::Int, Value::Text(s)) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        trimmed
                            .parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite() && f.fract() == 0.0)
                            .map(|f| f as i64)
                    })
                    .map(Value::Int)
                    .unwrap_or(Value::Absent)
            }
            (ColumnKind::Int, Value::Float(_)) => Value::Absent,
            (ColumnKind::Float, other) => other.as_f64().map(Value::Float).unwrap_or(Value::Absent),
            (ColumnKind::Bool, other) => other.as_bool().map(Value::Bool).unwrap_or(Value::Absent),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" | "yes" => Some(true),
        "false" | "0" | "0.0" | "no" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_csv())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f).normalized()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Absent)
    }
}

/// A column a step appends, with its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub(crate) const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self { name, kind }
    }

    pub(crate) const fn text(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Text)
    }
}

/// Snapshot of a lead's identity fields, in `IDENTITY_COLUMNS` order.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct LeadIdentity {
    pub fields: [Value; 5],
}

impl LeadIdentity {
    pub(crate) fn new(fields: [Value; 5]) -> Self {
        Self { fields }
    }

    pub(crate) fn get(&self, column: &str) -> &Value {
        IDENTITY_COLUMNS
            .iter()
            .position(|c| *c == column)
            .map(|i| &self.fields[i])
            .unwrap_or(&Value::Absent)
    }
}

/// One row of a per-step lookup table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LookupEntry {
    pub identity: LeadIdentity,
    pub last_update: DateTime<Utc>,
    /// Output columns the recorded computation left non-absent.
    pub filled: Vec<String>,
}

/// Cached output of one LLM operation for one place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct GptResult {
    pub result: serde_json::Value,
    pub last_update: DateTime<Utc>,
}

/// Families of per-place side artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArtifactKind {
    Reviews,
    Nearby,
    Gpt,
}

impl ArtifactKind {
    pub(crate) fn directory(self) -> &'static str {
        match self {
            ArtifactKind::Reviews => "reviews",
            ArtifactKind::Nearby => "nearby",
            ArtifactKind::Gpt => "gpt-results",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Reviews => "reviews",
            ArtifactKind::Nearby => "nearby",
            ArtifactKind::Gpt => "gpt_result",
        }
    }

    /// Relative key of the artifact for `key` (a place id).
    pub(crate) fn relative_key(self, key: &str) -> String {
        format!("{}/{}_{}.json", self.directory(), key, self.suffix())
    }
}

/// One customer review as persisted in the reviews artifact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct Review {
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
    /// Unix timestamp (seconds).
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub language: Option<String>,
}
