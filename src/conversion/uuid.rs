//! UUID type implementation (uuid crate).

use crate::error::{Error, Result};
use crate::value::Value;

use super::{FromValue, mismatch};

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => {
                uuid::Uuid::parse_str(s).map_err(|e| Error::Decode(format!("invalid UUID: {}", e)))
            }
            Value::Bytes(bytes) => uuid::Uuid::from_slice(bytes)
                .map_err(|e| Error::Decode(format!("invalid UUID: {}", e))),
            v => mismatch(v, "Uuid"),
        }
    }
}

impl From<uuid::Uuid> for Value {
    fn from(value: uuid::Uuid) -> Self {
        Value::Text(value.hyphenated().to_string())
    }
}
