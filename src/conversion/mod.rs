//! Conversions between Rust types and [`Value`].
//!
//! Driver adapters hand rows over as [`Value`]s; these traits give typed
//! access on the way out and build parameter lists on the way in.

mod bytes;
mod primitives;
mod row;
mod string;

#[cfg(feature = "with-chrono")]
mod chrono;
#[cfg(feature = "with-uuid")]
mod uuid;

use crate::error::{Error, Result};
use crate::value::Value;
pub use row::FromRow;

/// Trait for decoding a field value into a Rust type.
pub trait FromValue: Sized {
    /// Decode from a non-NULL value.
    fn from_value(value: &Value) -> Result<Self>;

    /// Decode from NULL.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Dispatch between [`from_null`](Self::from_null) and [`from_value`](Self::from_value).
    fn decode(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Self::from_null(),
            v => Self::from_value(v),
        }
    }
}

pub(crate) fn mismatch<T>(value: &Value, target: &str) -> Result<T> {
    Err(Error::Decode(format!(
        "cannot decode {} value as {}",
        value.kind(),
        target
    )))
}

/// Trait for building a positional parameter list.
pub trait ToParams {
    /// Convert into parameter values.
    fn to_params(self) -> Vec<Value>;
}

// === Option<T> - NULL handling ===

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        T::from_value(value).map(Some)
    }

    fn from_null() -> Result<Self> {
        Ok(None)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }

    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }
}

// === ToParams implementations ===

impl ToParams for () {
    fn to_params(self) -> Vec<Value> {
        Vec::new()
    }
}

impl ToParams for Vec<Value> {
    fn to_params(self) -> Vec<Value> {
        self
    }
}

impl ToParams for &[Value] {
    fn to_params(self) -> Vec<Value> {
        self.to_vec()
    }
}

impl<const N: usize> ToParams for [Value; N] {
    fn to_params(self) -> Vec<Value> {
        self.into()
    }
}

// Tuple implementations via macro
macro_rules! impl_to_params {
    ($($T:ident),+) => {
        impl<$($T: Into<Value>),+> ToParams for ($($T,)+) {
            #[allow(non_snake_case)]
            fn to_params(self) -> Vec<Value> {
                let ($($T,)+) = self;
                vec![$($T.into()),+]
            }
        }
    };
}

impl_to_params!(T1);
impl_to_params!(T1, T2);
impl_to_params!(T1, T2, T3);
impl_to_params!(T1, T2, T3, T4);
impl_to_params!(T1, T2, T3, T4, T5);
impl_to_params!(T1, T2, T3, T4, T5, T6);
impl_to_params!(T1, T2, T3, T4, T5, T6, T7);
impl_to_params!(T1, T2, T3, T4, T5, T6, T7, T8);
