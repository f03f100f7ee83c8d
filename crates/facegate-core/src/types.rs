use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name reported for faces that matched no enrolled user.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Maximum Euclidean distance accepted as a match (inclusive).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Timestamp layout used in both the store and the access log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is not a JSON array of numbers: {0}")]
    Syntax(String),
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor element {index} is not finite")]
    NonFinite { index: usize },
}

/// Fixed-length face descriptor produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Dimensionality D.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`.
    ///
    /// Returns `None` when the dimensions differ; such descriptors are not
    /// comparable.
    pub fn distance(&self, other: &Descriptor) -> Option<f32> {
        if self.dim() != other.dim() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }

    /// Text form stored in the `Encoding` column: a JSON array.
    pub fn to_json(&self) -> String {
        // Vec<f32> always serializes; non-finite values are rejected on the way in.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    /// Strict parse of the `Encoding` column.
    ///
    /// Accepts only a non-empty JSON array whose elements are all finite
    /// numbers. Anything else fails closed.
    pub fn from_json(text: &str) -> Result<Self, DescriptorError> {
        let values: Vec<f32> = serde_json::from_str(text.trim())
            .map_err(|e| DescriptorError::Syntax(e.to_string()))?;
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// One face found in a frame. Lives only for the frame that produced it.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// An enrolled user: one descriptor per record.
///
/// Names are not unique across records; the store keeps every row in
/// file order.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub name: String,
    pub descriptor: Descriptor,
    pub enrolled_at: NaiveDateTime,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, descriptor: Descriptor, enrolled_at: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            descriptor,
            enrolled_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessStatus::Granted => f.write_str("Granted"),
            AccessStatus::Denied => f.write_str("Denied"),
        }
    }
}

impl FromStr for AccessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Granted" => Ok(AccessStatus::Granted),
            "Denied" => Ok(AccessStatus::Denied),
            other => Err(format!("unknown access status: {other:?}")),
        }
    }
}

/// One row of the access log.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessAttempt {
    pub observed_name: String,
    pub timestamp: NaiveDateTime,
    pub status: AccessStatus,
}

impl AccessAttempt {
    pub fn from_outcome(outcome: &MatchOutcome, timestamp: NaiveDateTime) -> Self {
        Self {
            observed_name: outcome.name.clone(),
            timestamp,
            status: if outcome.granted {
                AccessStatus::Granted
            } else {
                AccessStatus::Denied
            },
        }
    }
}

/// Result of matching one live descriptor against the enrolled set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Matched user name, or [`UNKNOWN_NAME`].
    pub name: String,
    pub granted: bool,
    /// Distance to the nearest enrolled descriptor, if any was comparable.
    pub distance: Option<f32>,
    /// Index of the nearest record in the enrolled sequence.
    pub index: Option<usize>,
}

impl MatchOutcome {
    pub fn unknown(distance: Option<f32>, index: Option<usize>) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            granted: false,
            distance,
            index,
        }
    }

    pub fn status(&self) -> AccessStatus {
        if self.granted {
            AccessStatus::Granted
        } else {
            AccessStatus::Denied
        }
    }
}

/// Current local time truncated to whole seconds, the store's resolution.
pub fn now_timestamp() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identical() {
        let a = Descriptor::new(vec![0.25, -1.0, 3.0]);
        assert_eq!(a.distance(&a), Some(0.0));
    }

    #[test]
    fn test_distance_three_four_five() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert_eq!(a.distance(&b), Some(5.0));
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), None);
    }

    #[test]
    fn test_json_preserves_values() {
        let d = Descriptor::new(vec![0.1, -0.035_721_4, 1.0e-7, 123.456]);
        let parsed = Descriptor::from_json(&d.to_json()).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_from_json_accepts_loose_spacing() {
        // Spaces after separators and integer literals are both fine.
        let d = Descriptor::from_json("[-0.1, 0.2, 3]").unwrap();
        assert_eq!(d.values(), &[-0.1, 0.2, 3.0]);
    }

    #[test]
    fn test_from_json_rejects_non_vectors() {
        assert!(matches!(Descriptor::from_json("hello"), Err(DescriptorError::Syntax(_))));
        assert!(matches!(Descriptor::from_json("{\"a\": 1}"), Err(DescriptorError::Syntax(_))));
        assert!(matches!(Descriptor::from_json("[1, \"x\"]"), Err(DescriptorError::Syntax(_))));
        assert!(matches!(Descriptor::from_json("[[1.0], [2.0]]"), Err(DescriptorError::Syntax(_))));
        assert!(matches!(Descriptor::from_json("__import__('os')"), Err(DescriptorError::Syntax(_))));
        assert_eq!(Descriptor::from_json("[]"), Err(DescriptorError::Empty));
    }

    #[test]
    fn test_from_json_rejects_overflow() {
        // 1e300 does not fit in f32 and must not become infinity silently.
        assert!(Descriptor::from_json("[0.0, 1e300]").is_err());
    }

    #[test]
    fn test_access_status_text() {
        assert_eq!(AccessStatus::Granted.to_string(), "Granted");
        assert_eq!("Denied".parse::<AccessStatus>(), Ok(AccessStatus::Denied));
        assert!("granted".parse::<AccessStatus>().is_err());
    }

    #[test]
    fn test_timestamp_format() {
        let ts = parse_timestamp("2024-05-01 09:30:15").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-01 09:30:15");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_unknown_outcome() {
        let outcome = MatchOutcome::unknown(Some(0.9), Some(0));
        assert_eq!(outcome.name, UNKNOWN_NAME);
        assert_eq!(outcome.status(), AccessStatus::Denied);
    }
}
