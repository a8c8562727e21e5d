// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value codec: record values to and from their stored shapes.
//!
//! Records travel through the codec as `serde_json::Value` trees (the serde
//! rendering of the user's type). The codec rewrites that tree into the
//! stored shape and back, guided by the declared schema:
//!
//! - **Hash layout**: a flat `field -> bytes` mapping. Numbers become
//!   decimal strings, booleans become `"1"`/`"0"`, datetimes become decimal
//!   seconds since epoch, vectors become packed little-endian floats, and
//!   `None` values are elided entirely.
//! - **Document layout**: one JSON value. Scalars stay native, datetimes
//!   become numbers (enabling NUMERIC range queries), booleans become 0/1
//!   numbers, vectors become base64 of their packed bytes, embedded records
//!   nest.
//!
//! Decoding tolerates the pre-transition datetime form: a field holding an
//! ISO-8601 string decodes the same as one holding the numeric timestamp.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{OmError, Result};
use crate::schema::{
    FieldDef, FieldType, IndexState, RecordSchema, VectorOptions, VectorType,
};

/// A geographic point. Stored as a `"lon,lat"` string, the shape the
/// server's GEO fields expect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.longitude, self.latitude)
    }
}

impl std::str::FromStr for GeoPoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (lon, lat) = s
            .split_once(',')
            .ok_or_else(|| format!("expected 'lon,lat', got '{s}'"))?;
        Ok(Self {
            longitude: lon.trim().parse().map_err(|e| format!("{e}"))?,
            latitude: lat.trim().parse().map_err(|e| format!("{e}"))?,
        })
    }
}

impl Serialize for GeoPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GeoPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Datetime conversions
// ---------------------------------------------------------------------------

/// Encode a UTC timestamp as double seconds since epoch, microsecond
/// precision.
pub fn datetime_to_timestamp(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6
}

/// Encode a date as the timestamp of its UTC midnight.
pub fn date_to_timestamp(date: &NaiveDate) -> f64 {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    midnight.and_utc().timestamp() as f64
}

/// Decode a numeric timestamp back into a UTC instant (microsecond
/// resolution).
pub fn timestamp_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros((ts * 1e6).round() as i64)
}

/// Parse a datetime in any of the shapes found in stored records: a number
/// (seconds since epoch), a numeric string, an ISO-8601 string with or
/// without offset, or a bare date.
pub fn parse_datetime_flexible(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => timestamp_to_datetime(n.as_f64()?),
        Value::String(s) => parse_datetime_str(s),
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = s.parse::<f64>() {
        return timestamp_to_datetime(ts);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // ISO without offset: treat as UTC
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Vector packing
// ---------------------------------------------------------------------------

/// Pack a JSON number array into the little-endian byte layout the KNN
/// engine expects.
pub fn pack_vector(values: &[Value], options: &VectorOptions) -> Result<Vec<u8>> {
    if values.len() != options.dim {
        return Err(OmError::Validation(serde_json::Error::custom(format!(
            "vector has {} elements, schema declares {}",
            values.len(),
            options.dim
        ))));
    }
    let mut bytes = Vec::with_capacity(values.len() * options.dtype.width());
    for value in values {
        let n = value.as_f64().ok_or_else(|| {
            OmError::Validation(serde_json::Error::custom("vector elements must be numbers"))
        })?;
        match options.dtype {
            VectorType::Float32 => bytes.extend_from_slice(&(n as f32).to_le_bytes()),
            VectorType::Float64 => bytes.extend_from_slice(&n.to_le_bytes()),
        }
    }
    Ok(bytes)
}

/// Pack an `f32` slice directly (the common case for query vectors).
pub fn pack_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn unpack_vector(bytes: &[u8], dtype: VectorType) -> Vec<Value> {
    let width = dtype.width();
    bytes
        .chunks_exact(width)
        .map(|chunk| match dtype {
            VectorType::Float32 => {
                let n = f32::from_le_bytes(chunk.try_into().expect("chunk width"));
                json!(n)
            }
            VectorType::Float64 => {
                let n = f64::from_le_bytes(chunk.try_into().expect("chunk width"));
                json!(n)
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Hash layout
// ---------------------------------------------------------------------------

fn field_is_indexed_tag(schema: &RecordSchema, field: &FieldDef) -> bool {
    let indexed = field.options.primary_key
        || match field.options.index {
            IndexState::Inherit => schema.index,
            IndexState::Included => true,
            IndexState::Excluded => false,
        };
    indexed
        && !field.options.full_text_search
        && matches!(field.ty.unwrapped(), FieldType::Str)
}

/// Encode a record value into flat hash pairs. `None` fields are absent
/// from the result.
pub fn encode_hash(schema: &RecordSchema, record: &Value) -> Result<Vec<(String, Vec<u8>)>> {
    let object = record.as_object().ok_or_else(|| {
        OmError::Validation(serde_json::Error::custom("record must serialize to an object"))
    })?;
    let mut pairs = Vec::with_capacity(object.len());
    for field in &schema.fields {
        let Some(value) = object.get(&field.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let encoded = encode_hash_value(schema, field, value)?;
        pairs.push((field.name.clone(), encoded));
    }
    Ok(pairs)
}

fn encode_hash_value(schema: &RecordSchema, field: &FieldDef, value: &Value) -> Result<Vec<u8>> {
    let invalid = |msg: String| OmError::Validation(serde_json::Error::custom(msg));
    match field.ty.unwrapped() {
        FieldType::Str | FieldType::Geo => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("field '{}' must be a string", field.name)))?;
            if field_is_indexed_tag(schema, field) && s.contains(field.options.separator) {
                return Err(invalid(format!(
                    "field '{}' contains the tag separator '{}'",
                    field.name, field.options.separator
                )));
            }
            Ok(s.as_bytes().to_vec())
        }
        FieldType::Int | FieldType::Float => {
            let n = value
                .as_f64()
                .ok_or_else(|| invalid(format!("field '{}' must be numeric", field.name)))?;
            if value.is_i64() || value.is_u64() {
                Ok(value.to_string().into_bytes())
            } else {
                Ok(format_f64(n).into_bytes())
            }
        }
        FieldType::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| invalid(format!("field '{}' must be a boolean", field.name)))?;
            Ok(if b { b"1".to_vec() } else { b"0".to_vec() })
        }
        FieldType::DateTime => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a datetime", field.name)))?;
            Ok(format_f64(datetime_to_timestamp(&dt)).into_bytes())
        }
        FieldType::Date => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a date", field.name)))?;
            Ok(format_f64(date_to_timestamp(&dt.date_naive())).into_bytes())
        }
        FieldType::Vector => {
            let options = field
                .options
                .vector
                .as_ref()
                .ok_or_else(|| invalid(format!("field '{}' lacks vector options", field.name)))?;
            let values = value
                .as_array()
                .ok_or_else(|| invalid(format!("field '{}' must be a number array", field.name)))?;
            pack_vector(values, options)
        }
        FieldType::List(_) | FieldType::Embedded(_) => Err(invalid(format!(
            "flat records cannot store container field '{}'",
            field.name
        ))),
        FieldType::Optional(_) => unreachable!("unwrapped"),
    }
}

/// Decode flat hash pairs back into the record's serde shape.
pub fn decode_hash(schema: &RecordSchema, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<Value> {
    let mut object = Map::new();
    for field in &schema.fields {
        let raw = pairs
            .iter()
            .find(|(name, _)| name.as_slice() == field.name.as_bytes())
            .map(|(_, v)| v.as_slice());
        match raw {
            Some(bytes) => {
                object.insert(field.name.clone(), decode_hash_value(field, bytes)?);
            }
            None => {
                // Absent hash field: None for optionals, missing otherwise
                // (a missing required field fails validation downstream).
                if matches!(field.ty, FieldType::Optional(_)) {
                    object.insert(field.name.clone(), Value::Null);
                }
            }
        }
    }
    Ok(Value::Object(object))
}

fn decode_hash_value(field: &FieldDef, bytes: &[u8]) -> Result<Value> {
    let invalid = |msg: String| OmError::Validation(serde_json::Error::custom(msg));
    let text = || String::from_utf8_lossy(bytes).into_owned();
    match field.ty.unwrapped() {
        FieldType::Str | FieldType::Geo => Ok(Value::String(text())),
        FieldType::Int => {
            let s = text();
            let n = s
                .parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map_err(|_| invalid(format!("field '{}' holds non-integer '{s}'", field.name)))?;
            Ok(json!(n))
        }
        FieldType::Float => {
            let s = text();
            let n = s
                .parse::<f64>()
                .map_err(|_| invalid(format!("field '{}' holds non-float '{s}'", field.name)))?;
            Ok(json!(n))
        }
        FieldType::Bool => match text().as_str() {
            "1" | "true" | "True" => Ok(Value::Bool(true)),
            "0" | "false" | "False" => Ok(Value::Bool(false)),
            other => Err(invalid(format!(
                "field '{}' holds non-boolean '{other}'",
                field.name
            ))),
        },
        FieldType::DateTime => {
            let value = Value::String(text());
            let dt = parse_datetime_flexible(&value)
                .ok_or_else(|| invalid(format!("field '{}' is not a datetime", field.name)))?;
            Ok(Value::String(rfc3339(&dt)))
        }
        FieldType::Date => {
            let value = Value::String(text());
            let dt = parse_datetime_flexible(&value)
                .ok_or_else(|| invalid(format!("field '{}' is not a date", field.name)))?;
            Ok(Value::String(dt.date_naive().to_string()))
        }
        FieldType::Vector => {
            let dtype = field
                .options
                .vector
                .as_ref()
                .map(|v| v.dtype)
                .unwrap_or(VectorType::Float32);
            Ok(Value::Array(unpack_vector(bytes, dtype)))
        }
        FieldType::List(_) | FieldType::Embedded(_) => Err(invalid(format!(
            "flat records cannot store container field '{}'",
            field.name
        ))),
        FieldType::Optional(_) => unreachable!("unwrapped"),
    }
}

// ---------------------------------------------------------------------------
// Document layout
// ---------------------------------------------------------------------------

/// Encode a record value into its stored JSON document shape.
pub fn encode_json(schema: &RecordSchema, record: &Value) -> Result<Value> {
    let object = record.as_object().ok_or_else(|| {
        OmError::Validation(serde_json::Error::custom("record must serialize to an object"))
    })?;
    let mut out = Map::with_capacity(object.len());
    for (key, value) in object {
        match schema.field(key) {
            Some(field) => {
                out.insert(key.clone(), encode_json_value(field, value)?);
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(Value::Object(out))
}

fn encode_json_value(field: &FieldDef, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let invalid = |msg: String| OmError::Validation(serde_json::Error::custom(msg));
    match field.ty.unwrapped() {
        FieldType::DateTime => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a datetime", field.name)))?;
            Ok(json!(datetime_to_timestamp(&dt)))
        }
        FieldType::Date => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a date", field.name)))?;
            Ok(json!(date_to_timestamp(&dt.date_naive())))
        }
        FieldType::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| invalid(format!("field '{}' must be a boolean", field.name)))?;
            Ok(json!(if b { 1 } else { 0 }))
        }
        FieldType::Vector => {
            let options = field
                .options
                .vector
                .as_ref()
                .ok_or_else(|| invalid(format!("field '{}' lacks vector options", field.name)))?;
            let values = value
                .as_array()
                .ok_or_else(|| invalid(format!("field '{}' must be a number array", field.name)))?;
            Ok(Value::String(BASE64.encode(pack_vector(values, options)?)))
        }
        FieldType::Embedded(sub) => encode_json(sub, value),
        FieldType::List(element) => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid(format!("field '{}' must be a list", field.name)))?;
            match element.unwrapped() {
                FieldType::Embedded(sub) => {
                    let encoded: Result<Vec<_>> =
                        items.iter().map(|item| encode_json(sub, item)).collect();
                    Ok(Value::Array(encoded?))
                }
                _ => Ok(value.clone()),
            }
        }
        _ => Ok(value.clone()),
    }
}

/// Decode a stored JSON document back into the record's serde shape.
pub fn decode_json(schema: &RecordSchema, doc: &Value) -> Result<Value> {
    let object = doc.as_object().ok_or_else(|| {
        OmError::Validation(serde_json::Error::custom("stored document is not an object"))
    })?;
    let mut out = Map::with_capacity(object.len());
    for (key, value) in object {
        match schema.field(key) {
            Some(field) => {
                out.insert(key.clone(), decode_json_value(field, value)?);
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(Value::Object(out))
}

fn decode_json_value(field: &FieldDef, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let invalid = |msg: String| OmError::Validation(serde_json::Error::custom(msg));
    match field.ty.unwrapped() {
        FieldType::DateTime => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a datetime", field.name)))?;
            Ok(Value::String(rfc3339(&dt)))
        }
        FieldType::Date => {
            let dt = parse_datetime_flexible(value)
                .ok_or_else(|| invalid(format!("field '{}' is not a date", field.name)))?;
            Ok(Value::String(dt.date_naive().to_string()))
        }
        FieldType::Bool => match value {
            // Our own writes store 0/1; tolerate native booleans from other
            // writers.
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
            other => Err(invalid(format!(
                "field '{}' holds non-boolean {other}",
                field.name
            ))),
        },
        FieldType::Vector => {
            let dtype = field
                .options
                .vector
                .as_ref()
                .map(|v| v.dtype)
                .unwrap_or(VectorType::Float32);
            match value {
                Value::String(b64) => {
                    let bytes = BASE64.decode(b64).map_err(|e| {
                        invalid(format!("field '{}' is not base64: {e}", field.name))
                    })?;
                    Ok(Value::Array(unpack_vector(&bytes, dtype)))
                }
                Value::Array(_) => Ok(value.clone()),
                other => Err(invalid(format!(
                    "field '{}' holds non-vector {other}",
                    field.name
                ))),
            }
        }
        FieldType::Embedded(sub) => decode_json(sub, value),
        FieldType::List(element) => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid(format!("field '{}' must be a list", field.name)))?;
            match element.unwrapped() {
                FieldType::Embedded(sub) => {
                    let decoded: Result<Vec<_>> =
                        items.iter().map(|item| decode_json(sub, item)).collect();
                    Ok(Value::Array(decoded?))
                }
                _ => Ok(value.clone()),
            }
        }
        _ => Ok(value.clone()),
    }
}

/// Walk a dotted path through a decoded document. Descending into an array
/// maps the remaining path over its elements.
pub fn extract_path(doc: &Value, path: &str) -> Option<Value> {
    let mut current = doc.clone();
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let remaining: Vec<&str> = std::iter::once(segment).chain(segments.clone()).collect();
        match current {
            Value::Object(ref map) => {
                current = map.get(segment)?.clone();
            }
            Value::Array(items) => {
                let rest = remaining.join(".");
                let mapped: Option<Vec<Value>> =
                    items.iter().map(|item| extract_path(item, &rest)).collect();
                return mapped.map(Value::Array);
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Render an f64 without scientific notation surprises; integral values keep
/// a bare integer form (`38`, not `38.0`).
pub fn format_f64(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
