//! Data point collections.
//!
//! A collection groups samples by stream. Each stream is declared once with
//! a format string naming its value type and the optional parts every
//! sample carries:
//!
//! ```text
//!   "int32"                       value only
//!   "double ts_epoch_ms loc"      value, millisecond timestamp, location
//!   "string ts_iso qual"          value, ISO 8601 timestamp, quality
//! ```
//!
//! Samples are checked against their stream's format when added, so an
//! upload never carries a malformed point. The collection is plain data;
//! share it between threads behind a `Mutex` if needed.

use core::fmt;
use core::str::FromStr;

use serde::Serialize;

use crate::error::DataPointError;

/// Characters allowed in stream ids besides ASCII letters and digits.
const STREAM_ID_SPECIALS: &str = "_-./[]!+:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int32,
    Int64,
    Float,
    Double,
    String,
    Json,
    GeoJson,
}

impl DataType {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "float" => Self::Float,
            "double" => Self::Double,
            "string" => Self::String,
            "json" => Self::Json,
            "geojson" => Self::GeoJson,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Json => "json",
            Self::GeoJson => "geojson",
        };
        f.write_str(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampKind {
    /// Seconds plus milliseconds since the Unix epoch.
    Epoch,
    EpochMs,
    Iso8601,
}

/// What every sample of a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub data_type: DataType,
    pub timestamp: Option<TimestampKind>,
    pub location: bool,
    pub quality: bool,
}

impl FromStr for StreamFormat {
    type Err = DataPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.starts_with(' ') {
            return Err(DataPointError::InvalidFormat);
        }
        let mut data_type = None;
        let mut timestamp = None;
        let mut location = false;
        let mut quality = false;

        for key in s.split_whitespace() {
            let duplicate = match key {
                "ts_epoch" | "ts_epoch_ms" | "ts_iso" => {
                    let kind = match key {
                        "ts_epoch" => TimestampKind::Epoch,
                        "ts_epoch_ms" => TimestampKind::EpochMs,
                        _ => TimestampKind::Iso8601,
                    };
                    timestamp.replace(kind).is_some()
                }
                "loc" => core::mem::replace(&mut location, true),
                "qual" => core::mem::replace(&mut quality, true),
                other => {
                    let ty = DataType::from_key(other).ok_or(DataPointError::InvalidFormat)?;
                    data_type.replace(ty).is_some()
                }
            };
            if duplicate {
                return Err(DataPointError::InvalidFormat);
            }
        }

        Ok(Self {
            data_type: data_type.ok_or(DataPointError::InvalidFormat)?,
            timestamp,
            location,
            quality,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Json(String),
    GeoJson(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::String(_) => DataType::String,
            Self::Json(_) => DataType::Json,
            Self::GeoJson(_) => DataType::GeoJson,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timestamp {
    Epoch { seconds: u32, milliseconds: u32 },
    EpochMs(u64),
    Iso8601(String),
}

impl Timestamp {
    pub fn kind(&self) -> TimestampKind {
        match self {
            Self::Epoch { .. } => TimestampKind::Epoch,
            Self::EpochMs(_) => TimestampKind::EpochMs,
            Self::Iso8601(_) => TimestampKind::Iso8601,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f32,
    pub longitude: f32,
    pub elevation: f32,
}

/// One sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
}

impl DataPoint {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
            location: None,
            quality: None,
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn located(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = Some(quality);
        self
    }

    fn matches(&self, format: &StreamFormat) -> bool {
        self.value.data_type() == format.data_type
            && self.timestamp.as_ref().map(Timestamp::kind) == format.timestamp
            && self.location.is_some() == format.location
            && self.quality.is_some() == format.quality
    }
}

/// A declared stream and the samples added to it since the last upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataStream {
    pub id: String,
    pub format: StreamFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<String>,
    pub points: Vec<DataPoint>,
}

pub fn is_valid_stream_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || STREAM_ID_SPECIALS.contains(c))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataPointCollection {
    streams: Vec<DataStream>,
}

impl DataPointCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&mut self, id: &str, format: &str) -> Result<(), DataPointError> {
        self.add_stream_extra(id, format, None, None)
    }

    /// Declare a stream with display units and/or a forwarding target.
    /// Both must be non-empty when given.
    pub fn add_stream_extra(
        &mut self,
        id: &str,
        format: &str,
        units: Option<&str>,
        forward_to: Option<&str>,
    ) -> Result<(), DataPointError> {
        if !is_valid_stream_id(id) || self.stream(id).is_some() {
            return Err(DataPointError::InvalidStreamId);
        }
        let format: StreamFormat = format.parse()?;
        if units.is_some_and(str::is_empty) {
            return Err(DataPointError::InvalidUnits);
        }
        if forward_to.is_some_and(str::is_empty) {
            return Err(DataPointError::InvalidForwardTo);
        }
        self.streams.push(DataStream {
            id: id.to_owned(),
            format,
            units: units.map(str::to_owned),
            forward_to: forward_to.map(str::to_owned),
            points: Vec::new(),
        });
        Ok(())
    }

    /// Drop a stream together with its pending samples.
    pub fn remove_stream(&mut self, id: &str) -> Result<(), DataPointError> {
        let index = self
            .streams
            .iter()
            .position(|s| s.id == id)
            .ok_or(DataPointError::InvalidStreamId)?;
        self.streams.remove(index);
        Ok(())
    }

    pub fn add(&mut self, id: &str, point: DataPoint) -> Result<(), DataPointError> {
        let stream = self
            .streams
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(DataPointError::InvalidStreamId)?;
        if !point.matches(&stream.format) {
            return Err(DataPointError::InvalidArgument);
        }
        stream.points.push(point);
        Ok(())
    }

    pub fn stream(&self, id: &str) -> Option<&DataStream> {
        self.streams.iter().find(|s| s.id == id)
    }

    pub fn streams(&self) -> &[DataStream] {
        &self.streams
    }

    pub fn point_count(&self) -> usize {
        self.streams.iter().map(|s| s.points.len()).sum()
    }

    /// Drop every pending sample; declared streams stay.
    pub fn clear(&mut self) {
        for stream in &mut self.streams {
            stream.points.clear();
        }
    }

    /// Streams that have samples, as they go into an upload.
    pub(crate) fn pending(&self) -> Vec<DataStream> {
        self.streams
            .iter()
            .filter(|s| !s.points.is_empty())
            .cloned()
            .collect()
    }
}
