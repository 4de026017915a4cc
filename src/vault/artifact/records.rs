//! Engine-agnostic row stream shared by the interchange format, SQL scripts and
//! live databases.

use crate::vault::result_error::result::Result;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the object a binary value is wrapped in.
pub const BLOB_KEY: &str = "$base64";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Column order of the rows that follow. Empty means "the target's own order".
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// `CREATE TABLE` statement in the source engine's dialect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordEvent {
    /// Following rows belong to this table, until the next `Table`.
    Table(TableDescriptor),
    Row(Vec<Value>),
}

pub trait RecordSource {
    fn next_event(&mut self) -> Result<Option<RecordEvent>>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_event(&mut self) -> Result<Option<RecordEvent>> {
        (**self).next_event()
    }
}

pub fn blob_value(bytes: &[u8]) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(
        BLOB_KEY.to_owned(),
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    );
    Value::Object(map)
}

/// Bytes of a value produced by [`blob_value`], `None` for anything else.
pub fn as_blob(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(BLOB_KEY)?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Builds a column-keyed object from a positional row.
pub fn row_object(columns: &[String], row: Vec<Value>) -> Map<String, Value> {
    columns.iter().cloned().zip(row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blob_value() {
        let value = blob_value(&[0, 159, 146, 150]);
        assert_eq!(value, json!({"$base64": "AJ+Slg=="}));
        assert_eq!(as_blob(&value).unwrap(), vec![0, 159, 146, 150]);
        assert!(as_blob(&json!({"$base64": "AA==", "other": 1})).is_none());
        assert!(as_blob(&json!("AA==")).is_none());
    }

    #[test]
    fn test_hex() {
        assert_eq!(encode_hex(&[0, 255, 16]), "00ff10");
        assert_eq!(decode_hex("00FF10").unwrap(), vec![0, 255, 16]);
        assert!(decode_hex("abc").is_none());
        assert!(decode_hex("zz").is_none());
    }

    #[test]
    fn test_descriptor_defaults() {
        let d: TableDescriptor = serde_json::from_str(r#"{"name":"customers"}"#).unwrap();
        assert_eq!(d.name, "customers");
        assert!(d.columns.is_empty() && d.ddl.is_none());
    }
}
