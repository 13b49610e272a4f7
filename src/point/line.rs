//! Plaintext line protocol: `[put ]metric timestamp value [k=v ...]`.
//!
//! This is what program collectors print on stdout and, without the `put`
//! prefix, what the local sink writes.

use thiserror::Error;

use super::Value;

/// Timestamps above this are taken to be milliseconds.
const MAX_SECONDS_TIMESTAMP: i64 = 9_999_999_999;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineParseError {
    #[error("expected at least metric, timestamp and value, got {0} fields")]
    TooFewFields(usize),

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("invalid value {0:?}")]
    Value(String),

    #[error("invalid tag {0:?}, expected key=value")]
    Tag(String),
}

/// A decoded line, not yet validated against the point rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub metric: String,
    pub timestamp: i64,
    pub value: Value,
    pub tags: Vec<(String, String)>,
}

impl ParsedLine {
    /// Borrowed tag pairs in the shape the emitter accepts.
    pub fn tag_pairs(&self) -> Vec<(&str, &str)> {
        self.tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

pub fn parse(line: &str) -> Result<ParsedLine, LineParseError> {
    let line = line.trim();
    let line = line.strip_prefix("put ").unwrap_or(line);
    let fields: Vec<&str> = line.split_whitespace().collect();

    let [metric, ts, value, tags @ ..] = fields.as_slice() else {
        return Err(LineParseError::TooFewFields(fields.len()));
    };

    let mut timestamp: i64 = ts
        .parse()
        .map_err(|_| LineParseError::Timestamp(ts.to_string()))?;
    if timestamp > MAX_SECONDS_TIMESTAMP {
        timestamp /= 1000;
    }

    let value = parse_value(value)?;

    let tags = tags
        .iter()
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(LineParseError::Tag(kv.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedLine {
        metric: metric.to_string(),
        timestamp,
        value,
        tags,
    })
}

fn parse_value(s: &str) -> Result<Value, LineParseError> {
    if let Ok(i) = s.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(Value::Float(f)),
        _ => Err(LineParseError::Value(s.to_string())),
    }
}
