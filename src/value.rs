//! The typed value domain shared by primary-key components and column
//! values: the concrete enum the key codec and the metadata stores operate
//! on. `Decimal` models exact numeric column values such as replay-gain or
//! loudness figures, where float rounding would be the wrong tradeoff.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One column value or primary-key component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    /// The one-byte type tag used by the key codec to keep distinct
    /// logical keys from colliding and to order mixed-type tuples by type
    /// before value.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => 0x00,
            Value::Integer(_) => 0x01,
            Value::Real(_) => 0x02,
            Value::Text(_) => 0x03,
            Value::Blob(_) => 0x04,
            Value::Boolean(_) => 0x05,
            Value::Uuid(_) => 0x06,
            Value::Decimal(_) => 0x07,
            Value::Timestamp(_) => 0x08,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
            Value::Blob(v) => write!(f, "blob({} bytes)", v.len()),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}
