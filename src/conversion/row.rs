//! Row decoding traits and implementations.

use crate::error::{Error, Result};
use crate::row::Row;

use super::FromValue;

/// Trait for decoding a row into a Rust type.
///
/// Decoding copies the field values, so the result outlives the cursor
/// position it was read from.
pub trait FromRow: Sized {
    /// Decode a row.
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

// === Tuple implementations ===

macro_rules! impl_from_row {
    ($count:expr, $($idx:tt: $T:ident),+) => {
        impl<$($T: FromValue),+> FromRow for ($($T,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                if row.len() < $count {
                    return Err(Error::Decode(format!(
                        "not enough columns for tuple: expected {}, got {}",
                        $count,
                        row.len()
                    )));
                }
                Ok(($($T::decode(&row.values()[$idx])?,)+))
            }
        }
    };
}

impl_from_row!(1, 0: T1);
impl_from_row!(2, 0: T1, 1: T2);
impl_from_row!(3, 0: T1, 1: T2, 2: T3);
impl_from_row!(4, 0: T1, 1: T2, 2: T3, 3: T4);
impl_from_row!(5, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5);
impl_from_row!(6, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6);
impl_from_row!(7, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7);
impl_from_row!(8, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7, 7: T8);
impl_from_row!(9, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7, 7: T8, 8: T9);
impl_from_row!(10, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7, 7: T8, 8: T9, 9: T10);
impl_from_row!(11, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7, 7: T8, 8: T9, 9: T10, 10: T11);
impl_from_row!(12, 0: T1, 1: T2, 2: T3, 3: T4, 4: T5, 5: T6, 6: T7, 7: T8, 8: T9, 9: T10, 10: T11, 11: T12);
