// ABOUTME: Dynamically typed column values carried inside row snapshots
// ABOUTME: Defines the fixed timestamp wire format and its lenient parser

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical timestamp format written to the wire and to SQLite.
///
/// Fixed width (microsecond precision, always UTC) so that lexicographic
/// order of the text equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Naive forms accepted on input, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A single scalar column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Interpret the value as an integer key.
    ///
    /// Accepts integers, floats without a fractional part and numeric text,
    /// since row ids may have passed through loosely typed producers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            ColumnValue::Float(v) if v.fract() == 0.0 && v.is_finite() => {
                if *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Some(*v as i64)
                } else {
                    None
                }
            }
            ColumnValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a timestamp, parsing text if needed.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::Timestamp(ts) => Some(*ts),
            ColumnValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Int(_) => "integer",
            ColumnValue::Float(_) => "float",
            ColumnValue::Text(_) => "string",
            ColumnValue::Timestamp(_) => "timestamp",
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        ColumnValue::Int(value.into())
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// Format a timestamp in the canonical wire format.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp from RFC 3339 or one of the accepted naive forms.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(value, fmt)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Returns the timestamp only if `value` is exactly in the canonical format.
///
/// Used when decoding so that text which merely resembles a date stays text.
fn parse_canonical_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let ts = parse_timestamp(value)?;
    (format_timestamp(&ts) == value).then_some(ts)
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_unit(),
            ColumnValue::Int(v) => serializer.serialize_i64(*v),
            ColumnValue::Float(v) => serializer.serialize_f64(*v),
            ColumnValue::Text(v) => serializer.serialize_str(v),
            ColumnValue::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
        }
    }
}

struct ColumnValueVisitor;

impl<'de> Visitor<'de> for ColumnValueVisitor {
    type Value = ColumnValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar column value (number, string, timestamp or null)")
    }

    fn visit_unit<E: de::Error>(self) -> Result<ColumnValue, E> {
        Ok(ColumnValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<ColumnValue, E> {
        Ok(ColumnValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<ColumnValue, D::Error> {
        ColumnValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ColumnValue, E> {
        Ok(ColumnValue::Int(i64::from(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ColumnValue, E> {
        Ok(ColumnValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ColumnValue, E> {
        Ok(i64::try_from(v)
            .map(ColumnValue::Int)
            .unwrap_or(ColumnValue::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ColumnValue, E> {
        Ok(ColumnValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ColumnValue, E> {
        Ok(parse_canonical_timestamp(v)
            .map(ColumnValue::Timestamp)
            .unwrap_or_else(|| ColumnValue::Text(v.to_string())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ColumnValue, E> {
        match parse_canonical_timestamp(&v) {
            Some(ts) => Ok(ColumnValue::Timestamp(ts)),
            None => Ok(ColumnValue::Text(v)),
        }
    }
}

impl<'de> Deserialize<'de> for ColumnValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ColumnValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_format_timestamp_is_fixed_width() {
        assert_eq!(
            format_timestamp(&ts("2024-10-29T09:16:18Z")),
            "2024-10-29T09:16:18.000000Z"
        );
        assert_eq!(
            format_timestamp(&ts("2024-10-29T09:16:18.5+02:00")),
            "2024-10-29T07:16:18.500000Z"
        );
    }

    #[test]
    fn test_parse_timestamp_accepts_naive_forms() {
        let expected = ts("2024-10-29T09:16:18.123Z");
        assert_eq!(parse_timestamp("2024-10-29T09:16:18.123"), Some(expected));
        assert_eq!(parse_timestamp("2024-10-29 09:16:18.123"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-10-29T09:16:18"),
            Some(ts("2024-10-29T09:16:18Z"))
        );
        assert_eq!(parse_timestamp("29/10/2024"), None);
        assert_eq!(parse_timestamp("Kitchen"), None);
    }

    #[test]
    fn test_decode_scalars() {
        let values: Vec<ColumnValue> =
            serde_json::from_str(r#"[null, 1, 20.5, 20.0, "A", true]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ColumnValue::Null,
                ColumnValue::Int(1),
                ColumnValue::Float(20.5),
                ColumnValue::Float(20.0),
                ColumnValue::Text("A".into()),
                ColumnValue::Int(1),
            ]
        );
    }

    #[test]
    fn test_decode_only_canonical_strings_as_timestamps() {
        let values: Vec<ColumnValue> = serde_json::from_str(
            r#"["2024-10-29T09:16:18.000000Z", "2024-10-29 09:16:18"]"#,
        )
        .unwrap();
        assert_eq!(values[0], ColumnValue::Timestamp(ts("2024-10-29T09:16:18Z")));
        assert_eq!(values[1], ColumnValue::Text("2024-10-29 09:16:18".into()));
    }

    #[test]
    fn test_decode_rejects_nested_values() {
        assert!(serde_json::from_str::<ColumnValue>(r#"{"a": 1}"#).is_err());
        assert!(serde_json::from_str::<ColumnValue>("[1]").is_err());
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(ColumnValue::Int(7).as_i64(), Some(7));
        assert_eq!(ColumnValue::Float(7.0).as_i64(), Some(7));
        assert_eq!(ColumnValue::Float(7.5).as_i64(), None);
        assert_eq!(ColumnValue::Text(" 12 ".into()).as_i64(), Some(12));
        assert_eq!(ColumnValue::Null.as_i64(), None);
    }

    #[test]
    fn test_as_timestamp_parses_text() {
        let value = ColumnValue::Text("2024-10-29T09:16:18Z".into());
        assert_eq!(value.as_timestamp(), Some(ts("2024-10-29T09:16:18Z")));
        assert_eq!(ColumnValue::Int(3).as_timestamp(), None);
    }
}
