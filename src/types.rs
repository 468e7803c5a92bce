use std::fmt;

use crate::error::MergeError;

/// Timestamp type (milliseconds since epoch, signed so tombstone horizons can
/// reach below zero).
pub type Timestamp = i64;

/// Marker for "no deletion applies": any real tombstone end time is greater.
pub const NO_DELETION: Timestamp = i64::MIN;

/// The closed set of scalar types a measurement can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Text,
}

impl DataType {
    pub(crate) fn from_tag(tag: u8) -> Result<Self, MergeError> {
        Ok(match tag {
            0 => DataType::Bool,
            1 => DataType::Int32,
            2 => DataType::Int64,
            3 => DataType::Float32,
            4 => DataType::Float64,
            5 => DataType::Text,
            other => {
                return Err(MergeError::Corruption {
                    details: format!("Unknown data type tag {}", other),
                    series: None,
                    timestamp: None,
                })
            }
        })
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            DataType::Bool => 0,
            DataType::Int32 => 1,
            DataType::Int64 => 2,
            DataType::Float32 => 3,
            DataType::Float64 => 4,
            DataType::Text => 5,
        }
    }
}

/// A typed point value. Generic code dispatches on the variant once per chunk,
/// not per point.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Bool(_) => DataType::Bool,
            FieldValue::Int32(_) => DataType::Int32,
            FieldValue::Int64(_) => DataType::Int64,
            FieldValue::Float32(_) => DataType::Float32,
            FieldValue::Float64(_) => DataType::Float64,
            FieldValue::Text(_) => DataType::Text,
        }
    }
}

/// A single timestamped value as seen by the merge kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: FieldValue,
}

impl TimeValuePair {
    pub fn new(timestamp: Timestamp, value: FieldValue) -> Self {
        Self { timestamp, value }
    }
}

/// Identifies one measurement of one device ("series").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesPath {
    pub device: String,
    pub measurement: String,
}

impl SeriesPath {
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self { device: device.into(), measurement: measurement.into() }
    }

    /// Parses `device.measurement`; the measurement is the part after the last dot.
    pub fn parse(full: &str) -> Result<Self, MergeError> {
        match full.rsplit_once('.') {
            Some((device, measurement)) if !device.is_empty() && !measurement.is_empty() => {
                Ok(Self::new(device, measurement))
            }
            _ => Err(MergeError::SeriesNotFound(full.to_string())),
        }
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_path_roundtrip() {
        let p = SeriesPath::new("root.sg.d1", "s0");
        assert_eq!(p.to_string(), "root.sg.d1.s0");
        assert_eq!(SeriesPath::parse("root.sg.d1.s0").unwrap(), p);
    }

    #[test]
    fn test_series_path_rejects_bare_name() {
        assert!(SeriesPath::parse("nodots").is_err());
        assert!(SeriesPath::parse(".s0").is_err());
        assert!(SeriesPath::parse("d1.").is_err());
    }

    #[test]
    fn test_data_type_tags_roundtrip() {
        for dt in [
            DataType::Bool,
            DataType::Int32,
            DataType::Int64,
            DataType::Float32,
            DataType::Float64,
            DataType::Text,
        ] {
            assert_eq!(DataType::from_tag(dt.tag()).unwrap(), dt);
        }
        assert!(DataType::from_tag(17).is_err());
    }
}
