//! Tables, rows and row identifiers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The version of the persistent schema.
///
/// The file-backed engine refuses to open snapshots carrying a different
/// version; see the `databaseVersion` singleton below.
pub const SCHEMA_VERSION: u32 = 1;

//----------- table ------------------------------------------------------------

/// The table names of the Warden schema.
pub mod table {
    pub const POLICY: &str = "policy";
    pub const POLICY_KEY: &str = "policyKey";
    pub const HSM_KEY: &str = "hsmKey";
    pub const ZONE: &str = "zone";
    pub const KEY_DATA: &str = "keyData";
    pub const KEY_STATE: &str = "keyState";
    pub const KEY_DEPENDENCY: &str = "keyDependency";
    pub const DATABASE_VERSION: &str = "databaseVersion";

    /// Every table of the schema.
    pub const ALL: &[&str] = &[
        POLICY,
        POLICY_KEY,
        HSM_KEY,
        ZONE,
        KEY_DATA,
        KEY_STATE,
        KEY_DEPENDENCY,
        DATABASE_VERSION,
    ];
}

//----------- RowId ------------------------------------------------------------

/// An opaque row handle.
///
/// Identifiers are unique across all tables of one store and are never
/// reused within the lifetime of the store.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowId(u64);

impl RowId {
    /// Construct a row identifier from its raw representation.
    ///
    /// Only the storage engines mint fresh identifiers; this is exposed for
    /// snapshot decoding and tests.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw representation of this identifier.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//----------- Row --------------------------------------------------------------

/// A stored row.
///
/// The `id` and `rev` columns live outside the field map; clauses may still
/// refer to them by the names `"id"` and `"rev"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// The row identifier.
    pub id: RowId,

    /// The revision of this row.
    ///
    /// Starts at 1 on creation and increments by one on every successful
    /// update.
    pub rev: u64,

    /// The remaining fields, by column name.
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// Look up a field, with `id` and `rev` resolved from the fixed columns.
    pub fn get(&self, field: &str) -> Value {
        match field {
            "id" => Value::Id(self.id),
            "rev" => Value::UInt64(self.rev),
            _ => self.fields.get(field).cloned().unwrap_or(Value::Empty),
        }
    }
}
