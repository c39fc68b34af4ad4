//! Typed row values.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::RowId;

//----------- Value ------------------------------------------------------------

/// A single field value in a stored row.
///
/// Every value carries a type tag.  Numeric values of differing tags compare
/// by widening both sides to a signedness-preserving common type; text and
/// enum values compare only against values of the same tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value (SQL NULL).
    Empty,

    /// A 32-bit signed integer.
    Int32(i32),

    /// A 32-bit unsigned integer.
    UInt32(u32),

    /// A 64-bit signed integer.
    Int64(i64),

    /// A 64-bit unsigned integer.
    UInt64(u64),

    /// Free-form text.
    Text(String),

    /// An enumerated value, stored as its textual name.
    ///
    /// The mapping between Rust enums and these tokens is owned by the entity
    /// layer and must be bijective.
    Enum(String),

    /// A reference to a row (a primary key).
    Id(RowId),
}

impl Value {
    /// Whether this is the empty value.
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// The value as a signed 64-bit integer, if it is numeric and fits.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// The value as an unsigned 64-bit integer, if it is numeric and fits.
    pub fn as_uint(&self) -> Option<u64> {
        match *self {
            Value::Int32(v) => u64::try_from(v).ok(),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => u64::try_from(v).ok(),
            Value::UInt64(v) => Some(v),
            _ => None,
        }
    }

    /// The value as text, if it has the text tag.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The value as an enum token, if it has the enum tag.
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Value::Enum(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a row reference, if it has the primary-key tag.
    pub fn as_id(&self) -> Option<RowId> {
        match *self {
            Value::Id(v) => Some(v),
            _ => None,
        }
    }

    /// Compare two values.
    ///
    /// Returns `None` when the tags are incomparable (e.g. text against a
    /// number), which makes every comparison clause on the pair fail.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;

        match (self, other) {
            (Empty, Empty) => Some(Ordering::Equal),
            (Empty, _) | (_, Empty) => None,
            (Text(a), Text(b)) => Some(a.as_str().cmp(b)),
            (Enum(a), Enum(b)) => Some(a.as_str().cmp(b)),
            (Id(a), Id(b)) => Some(a.cmp(b)),
            _ => {
                // Both sides must be numeric at this point; widen to i128,
                // which preserves the full range of every numeric tag.
                Some(self.as_wide()?.cmp(&other.as_wide()?))
            }
        }
    }

    fn as_wide(&self) -> Option<i128> {
        match *self {
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v.into()),
            Value::UInt64(v) => Some(v.into()),
            _ => None,
        }
    }
}

//--- Conversion

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::UInt32(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<RowId> for Value {
    fn from(v: RowId) -> Self {
        Value::Id(v)
    }
}

//--- Display

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("(empty)"),
            Value::Int32(v) => v.fmt(f),
            Value::UInt32(v) => v.fmt(f),
            Value::Int64(v) => v.fmt(f),
            Value::UInt64(v) => v.fmt(f),
            Value::Text(v) => v.fmt(f),
            Value::Enum(v) => v.fmt(f),
            Value::Id(v) => v.fmt(f),
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_widening() {
        assert_eq!(
            Value::Int32(-1).compare(&Value::UInt64(0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::UInt64(u64::MAX).compare(&Value::Int64(i64::MAX)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::UInt32(7).compare(&Value::Int64(7)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn mismatched_tags() {
        assert_eq!(Value::Text("7".into()).compare(&Value::Int32(7)), None);
        assert_eq!(
            Value::Enum("HIDDEN".into()).compare(&Value::Text("HIDDEN".into())),
            None
        );
        assert_eq!(Value::Empty.compare(&Value::Int32(0)), None);
    }

    #[test]
    fn text_and_enum_within_tag() {
        assert_eq!(
            Value::Enum("ACTIVE".into()).compare(&Value::Enum("ACTIVE".into())),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Text("a".into()).compare(&Value::Text("b".into())),
            Some(Ordering::Less)
        );
    }
}
