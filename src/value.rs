//! Dynamic SQL values exchanged with driver adapters.

/// A single field or parameter value.
///
/// Driver adapters translate their wire representation into these variants;
/// typed access goes through [`FromValue`](crate::FromValue).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type, widened to 64 bits
    Int(i64),
    /// Any floating point type, widened to 64 bits
    Float(f64),
    /// Text (also used for dates, decimals and other textual encodings)
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in decode errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Number of rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Identifier generated by the last insert, if the backend reports one.
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    /// Create a result without an insert id.
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }

    /// Attach the generated insert id.
    pub fn with_last_insert_id(mut self, id: i64) -> Self {
        self.last_insert_id = Some(id);
        self
    }
}
