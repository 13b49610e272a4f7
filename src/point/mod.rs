//! Normalized metric samples.
//!
//! A [`Point`] is one tagged, timestamped numeric observation. Producers do
//! not build points directly: they call [`SampleBatch::add`] on a batch
//! obtained from an [`Emitter`], which merges the default tags, validates the
//! result and stages metadata for first-seen series.

mod emit;
pub mod line;
mod tagset;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use emit::{Emitter, SampleBatch, HOST_TAG};
pub use tagset::Tagset;

/// Largest magnitude at which an `f64` still represents every integer exactly.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// Validation failures for a point under construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PointError {
    #[error("empty metric name")]
    EmptyMetric,

    #[error("invalid metric name {metric:?}")]
    InvalidMetric { metric: String },

    #[error("duplicate tag key {key:?}")]
    DuplicateTag { key: String },

    #[error("invalid tag {key:?}={value:?}")]
    InvalidTag { key: String, value: String },

    #[error("non-finite value for {metric}")]
    NonFinite { metric: String },
}

/// Returns true for characters allowed in metric names and tag keys/values.
fn is_valid_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

/// Returns true if `s` is non-empty and only uses the allowed character set.
pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_char)
}

/// Strips characters outside the allowed set.
pub fn clean_name(s: &str) -> String {
    s.chars().filter(|c| is_valid_char(*c)).collect()
}

/// How downstream consumers should interpret successive values of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    #[default]
    Gauge,
    Counter,
    Rate,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Rate => "rate",
        }
    }
}

/// Semantic unit label attached to a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Unit {
    #[default]
    None,
    Bytes,
    Percent,
    Count,
    Seconds,
    Megahertz,
    Load,
    Other(String),
}

impl Unit {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "",
            Self::Bytes => "bytes",
            Self::Percent => "percent",
            Self::Count => "count",
            Self::Seconds => "seconds",
            Self::Megahertz => "MHz",
            Self::Load => "load",
            Self::Other(s) => s,
        }
    }

    pub fn is_none(&self) -> bool {
        self.as_str().is_empty()
    }
}

/// Numeric sample value.
///
/// Integral values are kept as integers so they are encoded without a
/// fractional part on the wire. An integral `Float` therefore decodes as
/// `Int`; equality is numeric so the two forms compare equal.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_exact_int(), other.as_exact_int()) {
            (Some(a), Some(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn is_finite(self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(f) => f.is_finite(),
        }
    }

    /// Returns the integer form of the value if it has no fractional part.
    fn as_exact_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            Self::Float(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64_INT => Some(f as i64),
            Self::Float(_) => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::Float(v as f64),
        }
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::from(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_exact_int(), self) {
            (Some(i), _) => write!(f, "{i}"),
            (None, Self::Float(v)) => write!(f, "{v}"),
            (None, Self::Int(i)) => write!(f, "{i}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match (self.as_exact_int(), self) {
            (Some(i), _) => serializer.serialize_i64(i),
            (None, v) => serializer.serialize_f64(v.as_f64()),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Number {
            Int(i64),
            Float(f64),
        }

        Ok(match Number::deserialize(deserializer)? {
            Number::Int(i) => Self::Int(i),
            Number::Float(f) => Self::Float(f),
        })
    }
}

/// One normalized observation.
///
/// Serializes to the collector wire form `{metric, timestamp, value, tags}`.
/// Rate type, unit and description only travel through the metadata channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    metric: String,
    timestamp: i64,
    value: Value,
    tags: Tagset,
    #[serde(skip)]
    rate: RateType,
    #[serde(skip)]
    unit: Unit,
    #[serde(skip)]
    description: String,
}

impl Point {
    /// Builds a validated point. Only the emitter and wire decoding call this.
    pub(crate) fn new(
        metric: &str,
        value: Value,
        tags: Tagset,
        timestamp: i64,
    ) -> Result<Self, PointError> {
        validate_metric(metric)?;
        if !value.is_finite() {
            return Err(PointError::NonFinite {
                metric: metric.to_string(),
            });
        }
        tags.validate()?;

        Ok(Self {
            metric: metric.to_string(),
            timestamp,
            value,
            tags,
            rate: RateType::default(),
            unit: Unit::default(),
            description: String::new(),
        })
    }

    pub(crate) fn with_metadata(mut self, rate: RateType, unit: Unit, description: &str) -> Self {
        self.rate = rate;
        self.unit = unit;
        self.description = description.to_string();
        self
    }

    /// Decodes a single wire-format JSON object and validates it.
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let raw: Point = serde_json::from_str(data)?;
        Ok(Self::new(&raw.metric, raw.value, raw.tags, raw.timestamp)?)
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn tags(&self) -> &Tagset {
        &self.tags
    }

    pub fn rate(&self) -> RateType {
        self.rate
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Renders the plaintext line form: `metric timestamp value k1=v1 k2=v2`.
impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.timestamp, self.value)?;
        for (k, v) in self.tags.iter() {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

fn validate_metric(metric: &str) -> Result<(), PointError> {
    if metric.is_empty() {
        return Err(PointError::EmptyMetric);
    }
    if !is_valid_name(metric) {
        return Err(PointError::InvalidMetric {
            metric: metric.to_string(),
        });
    }
    Ok(())
}
