//! Column metadata and rows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conversion::{FromRow, FromValue};
use crate::error::{Error, Result};
use crate::value::Value;

/// Column metadata announced by the producer of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Backend type name (e.g. `"int4"`, `"TEXT"`); empty if unknown
    pub type_name: String,
    /// Whether the column may hold NULL, if the backend reports it
    pub nullable: Option<bool>,
}

impl ColumnInfo {
    /// Column with a name and type name.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: None,
        }
    }

    /// Column with a name only.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }
}

/// Column list plus the name lookup table, built once per result set and
/// shared by every row of it.
#[derive(Debug)]
pub struct Columns {
    infos: Vec<ColumnInfo>,
    index: HashMap<String, usize>,
}

impl Columns {
    /// Build the lookup table. On duplicate names the first column wins.
    pub fn new(infos: Vec<ColumnInfo>) -> Self {
        let mut index = HashMap::with_capacity(infos.len());
        for (i, info) in infos.iter().enumerate() {
            index.entry(info.name.clone()).or_insert(i);
        }
        Self { infos, index }
    }

    /// Column metadata in result order.
    pub fn infos(&self) -> &[ColumnInfo] {
        &self.infos
    }

    /// Ordinal of a column name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns true if the result set has no columns.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Column lookup by ordinal or by name.
pub trait ColumnIndex: private::Sealed {
    /// Resolve to a zero-based ordinal.
    fn index(&self, columns: &Columns) -> Result<usize>;
}

mod private {
    pub trait Sealed {}

    impl Sealed for usize {}
    impl Sealed for &str {}
}

impl ColumnIndex for usize {
    fn index(&self, columns: &Columns) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::InvalidUsage(format!(
                "column index {} out of range ({} columns)",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn index(&self, columns: &Columns) -> Result<usize> {
        columns
            .position(self)
            .ok_or_else(|| Error::InvalidUsage(format!("no column named {:?}", self)))
    }
}

/// One row of a result set.
///
/// Cloning is cheap; the values are shared. Use [`to_vec`](Self::to_vec),
/// [`to_map`](Self::to_map) or [`decode`](Self::decode) for an independent copy.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Columns>,
    values: Arc<[Value]>,
}

impl Row {
    /// Create a row. Missing trailing values read as NULL; extra values are dropped.
    pub fn new(columns: Arc<Columns>, mut values: Vec<Value>) -> Self {
        values.resize(columns.len(), Value::Null);
        Self {
            columns,
            values: values.into(),
        }
    }

    /// Column metadata of the owning result set.
    pub fn columns(&self) -> &[ColumnInfo] {
        self.columns.infos()
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Field by zero-based ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    /// Field by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.position(name).and_then(|i| self.values.get(i))
    }

    /// Decode one field.
    pub fn try_get<T: FromValue, I: ColumnIndex>(&self, index: I) -> Result<T> {
        let i = index.index(&self.columns)?;
        T::decode(&self.values[i])
    }

    /// Decode the whole row.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }

    /// Copy the values out.
    pub fn to_vec(&self) -> Vec<Value> {
        self.values.to_vec()
    }

    /// Copy the row into `(column name, value)` pairs in column order.
    pub fn to_map(&self) -> Vec<(String, Value)> {
        self.columns
            .infos()
            .iter()
            .zip(self.values.iter())
            .map(|(info, value)| (info.name.clone(), value.clone()))
            .collect()
    }
}
