use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{PropertyKind, StrataError, StrataResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Str(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Json(JsonValue),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Semantic kind of a scalar field, declared once in the type schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FieldKind {
    Text = 1,
    Integer = 2,
    Float = 3,
    Boolean = 4,
    DateTime = 5,
    Json = 6,
    Blob = 7,
}

/// Payload of one content row, ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub enum StoredContent {
    Text(Option<String>),
    Blob(Option<Vec<u8>>),
}

impl StoredContent {
    pub fn kind(&self) -> PropertyKind {
        match self {
            StoredContent::Text(_) => PropertyKind::Text,
            StoredContent::Blob(_) => PropertyKind::Blob,
        }
    }

    /// Stored content read back as an untyped value, before kind coercion.
    pub fn into_value(self) -> Value {
        match self {
            StoredContent::Text(Some(text)) => Value::Str(text),
            StoredContent::Blob(Some(bytes)) => Value::Blob(bytes),
            StoredContent::Text(None) | StoredContent::Blob(None) => Value::Null,
        }
    }
}

impl FieldKind {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(FieldKind::Text),
            2 => Some(FieldKind::Integer),
            3 => Some(FieldKind::Float),
            4 => Some(FieldKind::Boolean),
            5 => Some(FieldKind::DateTime),
            6 => Some(FieldKind::Json),
            7 => Some(FieldKind::Blob),
            _ => None,
        }
    }

    pub fn property_kind(self) -> PropertyKind {
        match self {
            FieldKind::Blob => PropertyKind::Blob,
            _ => PropertyKind::Text,
        }
    }

    /// Converts a live value into its stored payload.
    ///
    /// Errors are `Conversion` errors: the capture engine drops the field and keeps going.
    pub fn encode(self, field: &str, value: &Value) -> StrataResult<StoredContent> {
        if value.is_null() {
            return Ok(match self.property_kind() {
                PropertyKind::Blob => StoredContent::Blob(None),
                PropertyKind::Text => StoredContent::Text(None),
            });
        }
        let text = match (self, value) {
            (FieldKind::Text, Value::Str(text)) => text.clone(),
            (FieldKind::Integer, Value::I64(number)) => number.to_string(),
            (FieldKind::Integer, Value::Str(text)) if text.parse::<i64>().is_ok() => text.clone(),
            (FieldKind::Float, Value::F64(number)) => number.to_string(),
            (FieldKind::Float, Value::I64(number)) => (*number as f64).to_string(),
            (FieldKind::Boolean, Value::Bool(flag)) => if *flag { "1" } else { "0" }.to_string(),
            (FieldKind::DateTime, Value::Time(time)) => time.timestamp().to_string(),
            (FieldKind::DateTime, Value::I64(epoch)) => epoch.to_string(),
            (FieldKind::Json, value) => serde_json::to_string(&json_for(value))
                .map_err(|err| StrataError::conversion(format!("{field}: {err}")))?,
            (FieldKind::Blob, Value::Blob(bytes)) => {
                return Ok(StoredContent::Blob(Some(bytes.clone())));
            }
            (FieldKind::Blob, Value::Str(text)) => {
                return Ok(StoredContent::Blob(Some(text.as_bytes().to_vec())));
            }
            (kind, value) => {
                return Err(StrataError::conversion(format!(
                    "{field}: cannot store {value:?} as {kind:?}"
                )));
            }
        };
        Ok(StoredContent::Text(Some(text)))
    }

    /// Coerces a stored (or live) value to this kind.
    ///
    /// Errors are `Decode` errors and are fatal for the read that hit them.
    pub fn decode(self, field: &str, value: Value) -> StrataResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let invalid =
            |value: &Value| StrataError::decode(format!("invalid {self:?} value for {field}: {value:?}"));
        match self {
            FieldKind::Text => match value {
                Value::Str(_) => Ok(value),
                Value::Blob(bytes) => String::from_utf8(bytes)
                    .map(Value::Str)
                    .map_err(|err| StrataError::decode(format!("{field}: {err}"))),
                Value::I64(number) => Ok(Value::Str(number.to_string())),
                Value::F64(number) => Ok(Value::Str(number.to_string())),
                other => Err(invalid(&other)),
            },
            FieldKind::Integer => match value {
                Value::I64(_) => Ok(value),
                Value::Str(ref text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::I64)
                    .map_err(|_| invalid(&value)),
                other => Err(invalid(&other)),
            },
            FieldKind::Float => match value {
                Value::F64(_) => Ok(value),
                Value::I64(number) => Ok(Value::F64(number as f64)),
                Value::Str(ref text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::F64)
                    .map_err(|_| invalid(&value)),
                other => Err(invalid(&other)),
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value),
                Value::I64(number) => Ok(Value::Bool(number != 0)),
                Value::Str(ref text) => match text.trim() {
                    "1" | "true" => Ok(Value::Bool(true)),
                    "0" | "false" | "" => Ok(Value::Bool(false)),
                    _ => Err(invalid(&value)),
                },
                other => Err(invalid(&other)),
            },
            FieldKind::DateTime => match value {
                Value::Time(_) => Ok(value),
                Value::I64(epoch) => epoch_to_time(epoch).ok_or_else(|| invalid(&value)),
                Value::Str(ref text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        return Ok(Value::Null);
                    }
                    parse_time(text).ok_or_else(|| invalid(&value))
                }
                other => Err(invalid(&other)),
            },
            FieldKind::Json => match value {
                Value::Json(_) => Ok(value),
                Value::Str(ref text) => serde_json::from_str(text)
                    .map(Value::Json)
                    .map_err(|err| StrataError::decode(format!("{field}: {err}"))),
                other => Ok(Value::Json(json_for(&other))),
            },
            FieldKind::Blob => match value {
                Value::Blob(_) => Ok(value),
                Value::Str(text) => Ok(Value::Blob(text.into_bytes())),
                other => Err(invalid(&other)),
            },
        }
    }
}

fn epoch_to_time(epoch: i64) -> Option<Value> {
    Utc.timestamp_opt(epoch, 0).single().map(Value::Time)
}

fn parse_time(text: &str) -> Option<Value> {
    if let Ok(epoch) = text.parse::<i64>() {
        return epoch_to_time(epoch);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(Value::Time(time.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Value::Time(naive.and_utc()))
}

fn json_for(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Str(text) => JsonValue::String(text.clone()),
        Value::I64(number) => JsonValue::from(*number),
        Value::F64(number) => JsonValue::from(*number),
        Value::Bool(flag) => JsonValue::Bool(*flag),
        Value::Time(time) => JsonValue::from(time.timestamp()),
        Value::Json(json) => json.clone(),
        Value::Blob(bytes) => JsonValue::from(bytes.clone()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{FieldKind, StoredContent, Value};

    #[test]
    fn encodes_scalars_as_text() {
        let text = FieldKind::Integer.encode("age", &Value::I64(42)).expect("encode");
        assert_eq!(text, StoredContent::Text(Some("42".to_string())));
        let flag = FieldKind::Boolean.encode("active", &Value::Bool(true)).expect("encode");
        assert_eq!(flag, StoredContent::Text(Some("1".to_string())));
        let time = Utc.timestamp_opt(123_456_789, 0).single().expect("time");
        let stamp = FieldKind::DateTime.encode("at", &Value::Time(time)).expect("encode");
        assert_eq!(stamp, StoredContent::Text(Some("123456789".to_string())));
    }

    #[test]
    fn blobs_keep_their_payload_kind() {
        let blob = FieldKind::Blob.encode("avatar", &Value::Blob(vec![1, 2])).expect("encode");
        assert_eq!(blob, StoredContent::Blob(Some(vec![1, 2])));
        let empty = FieldKind::Blob.encode("avatar", &Value::Null).expect("encode");
        assert_eq!(empty, StoredContent::Blob(None));
    }

    #[test]
    fn mismatched_kinds_are_conversion_errors() {
        let err = FieldKind::Integer
            .encode("age", &Value::Str("old".to_string()))
            .expect_err("should fail");
        assert!(err.is_skippable());
    }

    #[test]
    fn decodes_epoch_into_date_time() {
        let value = FieldKind::DateTime
            .decode("at", Value::Str("123456789".to_string()))
            .expect("decode");
        let expected = Utc.timestamp_opt(123_456_789, 0).single().expect("time");
        assert_eq!(value, Value::Time(expected));
        let empty = FieldKind::DateTime
            .decode("at", Value::Str(String::new()))
            .expect("decode");
        assert_eq!(empty, Value::Null);
    }

    #[test]
    fn malformed_dates_are_decode_errors() {
        let err = FieldKind::DateTime
            .decode("at", Value::Str("invalid value".to_string()))
            .expect_err("should fail");
        assert!(matches!(err, crate::StrataError::Decode { .. }));
    }

    #[test]
    fn stored_content_becomes_untyped_value() {
        assert_eq!(
            StoredContent::Text(Some("x".to_string())).into_value(),
            Value::Str("x".to_string())
        );
        assert_eq!(StoredContent::Text(None).into_value(), Value::Null);
    }
}
