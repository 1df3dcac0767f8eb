use chrono::{DateTime, Utc};
use std::fmt;

/// The value a tag holds. `Null` models the absence of a reading (a
/// never-yet-updated driver tag, or an expression whose inputs are not all
/// known yet).
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl TagValue {
    /// Numeric != 0, non-empty string, non-null count as true. Drives alarm
    /// edge detection on non-boolean expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            TagValue::Null => false,
            TagValue::Bool(b) => *b,
            TagValue::Int(i) => *i != 0,
            TagValue::Float(f) => *f != 0.0,
            TagValue::Str(s) => !s.is_empty(),
            TagValue::Timestamp(_) => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TagValue::Null)
    }

    /// Renders a value for the websocket gateway and log sink: bool/int/float
    /// become a decimal string, datetime becomes "YYYY-MM-DD HH:MM:SS".
    /// Returns `None` for `Null`, which callers filter out.
    pub fn render(&self) -> Option<String> {
        match self {
            TagValue::Null => None,
            TagValue::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
            TagValue::Int(i) => Some(i.to_string()),
            TagValue::Float(f) => Some(f.to_string()),
            TagValue::Str(s) => Some(s.clone()),
            TagValue::Timestamp(t) => Some(t.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Int(i) => Some(*i as f64),
            TagValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl Default for TagValue {
    fn default() -> Self {
        TagValue::Null
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Null => write!(f, "null"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Str(s) => write!(f, "{s}"),
            TagValue::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}
