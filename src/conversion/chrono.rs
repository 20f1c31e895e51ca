//! Chrono crate type implementations (NaiveDate, NaiveTime, NaiveDateTime, DateTime<Utc>).
//!
//! Values travel as text in ISO-8601 form.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{Error, Result};
use crate::value::Value;

use super::{FromValue, mismatch};

fn text<'a>(value: &'a Value, target: &str) -> Result<&'a str> {
    match value {
        Value::Text(s) => Ok(s.as_str()),
        v => mismatch(v, target),
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        NaiveDate::parse_from_str(text(value, "NaiveDate")?, "%Y-%m-%d")
            .map_err(|e| Error::Decode(format!("invalid date: {}", e)))
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &Value) -> Result<Self> {
        NaiveTime::parse_from_str(text(value, "NaiveTime")?, "%H:%M:%S%.f")
            .map_err(|e| Error::Decode(format!("invalid time: {}", e)))
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        let s = text(value, "NaiveDateTime")?;
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(|e| Error::Decode(format!("invalid timestamp: {}", e)))
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        let s = text(value, "DateTime<Utc>")?;
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::from_value(value).map(|naive| naive.and_utc()))
            .map_err(|e| Error::Decode(format!("invalid timestamptz: {}", e)))
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Text(value.format("%Y-%m-%d").to_string())
    }
}

impl From<NaiveTime> for Value {
    fn from(value: NaiveTime) -> Self {
        Value::Text(value.format("%H:%M:%S%.f").to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Text(value.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Text(value.to_rfc3339())
    }
}
