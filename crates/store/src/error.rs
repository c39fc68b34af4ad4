//! Store errors.

use std::fmt;

use crate::schema::RowId;

//----------- Error ------------------------------------------------------------

/// An error from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An update or delete expected a revision the row no longer carries.
    ///
    /// Another transaction committed a change to the row in between the read
    /// and the write.  This is transient; re-read and re-apply.
    StaleRevision {
        /// The table of the row.
        table: String,

        /// The row that changed underneath the caller.
        id: RowId,
    },

    /// A read that expected exactly one row found none.
    NotFound {
        /// The table read from.
        table: String,
    },

    /// A read that expected exactly one row found several.
    Ambiguous {
        /// The table read from.
        table: String,
    },

    /// An operation referenced a table outside the schema.
    UnknownTable(String),

    /// A durable snapshot could not be read or written.
    Io(String),

    /// A durable snapshot exists but cannot be decoded.
    Corrupt(String),

    /// A durable snapshot carries a different schema version.
    Version {
        /// The version found in the snapshot.
        found: u32,

        /// The version this build understands.
        expected: u32,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StaleRevision { table, id } => {
                write!(f, "stale revision on {table} row {id}")
            }
            Error::NotFound { table } => {
                write!(f, "no matching row in table '{table}'")
            }
            Error::Ambiguous { table } => {
                write!(f, "more than one matching row in table '{table}'")
            }
            Error::UnknownTable(table) => {
                write!(f, "unknown table '{table}'")
            }
            Error::Io(err) => {
                write!(f, "snapshot I/O failed: {err}")
            }
            Error::Corrupt(err) => {
                write!(f, "snapshot is corrupt: {err}")
            }
            Error::Version { found, expected } => {
                write!(
                    f,
                    "snapshot has schema version {found}, expected {expected}"
                )
            }
        }
    }
}
