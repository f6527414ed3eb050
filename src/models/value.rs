//! Parameter values and decoded rows.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A positional parameter value for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A decoded result row, column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(serde_json::Map<String, JsonValue>);

impl Row {
    pub fn new(values: serde_json::Map<String, JsonValue>) -> Self {
        Self(values)
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(JsonValue::as_str)
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        self.get_str(column).map(str::to_string)
    }

    /// Integers may come back as numbers or numeric strings (NUMERIC columns).
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            JsonValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Booleans may come back as bools, 0/1 integers or YES/NO text.
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
            JsonValue::String(s) => match s.to_ascii_uppercase().as_str() {
                "YES" | "TRUE" | "T" | "1" => Some(true),
                "NO" | "FALSE" | "F" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> serde_json::Map<String, JsonValue> {
        self.0
    }
}

impl FromIterator<(String, JsonValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_value_from_option() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5)), SqlValue::Int(5));
        assert_eq!(SqlValue::from("x").type_name(), "text");
    }

    #[test]
    fn test_sql_value_bytes_serialize_base64() {
        let v = SqlValue::Bytes(b"hello".to_vec());
        assert_eq!(serde_json::to_value(&v).unwrap(), json!("aGVsbG8="));
    }

    #[test]
    fn test_row_getters() {
        let row: Row = [
            ("name".to_string(), json!("dblock")),
            ("ordinal".to_string(), json!(3)),
            ("len".to_string(), json!("255")),
            ("nullable".to_string(), json!("YES")),
            ("unique".to_string(), json!(0)),
            ("missing".to_string(), JsonValue::Null),
        ]
        .into_iter()
        .collect();

        assert_eq!(row.get_str("name"), Some("dblock"));
        assert_eq!(row.get_i64("ordinal"), Some(3));
        assert_eq!(row.get_i64("len"), Some(255));
        assert_eq!(row.get_bool("nullable"), Some(true));
        assert_eq!(row.get_bool("unique"), Some(false));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 6);
    }
}
