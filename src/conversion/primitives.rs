//! Primitive type implementations (bool, integers, floats).

use crate::error::{Error, Result};
use crate::value::Value;

use super::{FromValue, mismatch};

// === Boolean ===

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Text(s) => match s.as_str() {
                "t" | "true" | "TRUE" | "T" | "1" => Ok(true),
                "f" | "false" | "FALSE" | "F" | "0" => Ok(false),
                _ => Err(Error::Decode(format!("invalid boolean: {:?}", s))),
            },
            v => mismatch(v, "bool"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

// === Integer types ===

macro_rules! impl_int {
    ($($t:ty),+) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &Value) -> Result<Self> {
                    match value {
                        Value::Int(i) => <$t>::try_from(*i).map_err(|_| {
                            Error::Decode(format!("{} out of range for {}", i, stringify!($t)))
                        }),
                        Value::Bool(b) => Ok(<$t>::from(*b)),
                        Value::Text(s) => s.trim().parse().map_err(|e| {
                            Error::Decode(format!("invalid {}: {}", stringify!($t), e))
                        }),
                        v => mismatch(v, stringify!($t)),
                    }
                }
            }
        )+
    };
}

impl_int!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_int_into_value {
    ($($t:ty),+) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::Int(i64::from(value))
                }
            }
        )+
    };
}

impl_int_into_value!(i8, i16, i32, i64, u8, u16, u32);

// === Floating point ===

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| Error::Decode(format!("invalid f64: {}", e))),
            v => mismatch(v, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}
