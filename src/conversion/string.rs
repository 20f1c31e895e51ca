//! String type implementations.

use crate::error::{Error, Result};
use crate::value::Value;

use super::{FromValue, mismatch};

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(bytes) => simdutf8::compat::from_utf8(bytes)
                .map(|s| s.to_owned())
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e))),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            v => mismatch(v, "String"),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_from_bytes() {
        let s = String::from_value(&Value::Bytes(b"hello".to_vec())).unwrap();
        assert_eq!(s, "hello");
        assert!(String::from_value(&Value::Bytes(vec![0xff, 0xfe])).is_err());
    }
}
