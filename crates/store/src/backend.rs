//! The storage engine interface.

use crate::clause::{ClauseList, Join};
use crate::error::Error;
use crate::schema::{Row, RowId};
use crate::value::Value;

//----------- Backend ----------------------------------------------------------

/// A storage engine.
///
/// Engines provide serializable transactions: once [`Backend::begin`]
/// returns, the transaction observes and produces a consistent snapshot, and
/// nothing it writes is visible to others until [`Transaction::commit`].
///
/// Which engine backs a store is decided once, at startup, from
/// configuration.
pub trait Backend: Send + Sync {
    /// Begin a transaction.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error>;
}

//----------- Transaction ------------------------------------------------------

/// A transaction against a storage engine.
///
/// Dropping a transaction without committing rolls it back.
pub trait Transaction {
    /// Read rows of `table` matching `clauses`.
    ///
    /// Joined tables are brought into scope in order; clauses may refer to
    /// them by name.  The returned rows belong to the base table.
    fn read(
        &self,
        table: &str,
        joins: &[Join],
        clauses: &ClauseList,
    ) -> Result<Vec<Row>, Error>;

    /// Count rows of `table` matching `clauses`.
    fn count(
        &self,
        table: &str,
        joins: &[Join],
        clauses: &ClauseList,
    ) -> Result<u64, Error>;

    /// Create a row with the given fields; returns its fresh identifier.
    ///
    /// The new row has revision 1.
    fn create(&mut self, table: &str, fields: Vec<(String, Value)>) -> Result<RowId, Error>;

    /// Set `fields` on every row of `table` matching `clauses`.
    ///
    /// Returns the number of rows changed.  This is the raw operation; use
    /// [`update_row`] for the revision-checked form.
    fn update(
        &mut self,
        table: &str,
        fields: Vec<(String, Value)>,
        clauses: &ClauseList,
    ) -> Result<u64, Error>;

    /// Delete every row of `table` matching `clauses`.
    ///
    /// Returns the number of rows deleted.
    fn delete(&mut self, table: &str, clauses: &ClauseList) -> Result<u64, Error>;

    /// Commit the transaction.
    fn commit(self: Box<Self>) -> Result<(), Error>;

    /// Roll the transaction back explicitly.
    fn rollback(self: Box<Self>);
}

//----------- Revisioned helpers -----------------------------------------------

/// Read the single row matching `clauses`, or fail.
pub fn read_one(
    txn: &dyn Transaction,
    table: &str,
    joins: &[Join],
    clauses: &ClauseList,
) -> Result<Row, Error> {
    let mut rows = txn.read(table, joins, clauses)?;
    match rows.len() {
        0 => Err(Error::NotFound {
            table: table.into(),
        }),
        1 => Ok(rows.pop().expect("checked length")),
        _ => Err(Error::Ambiguous {
            table: table.into(),
        }),
    }
}

/// Update one row under its revision.
///
/// The caller passes the revision it read; the update only applies if the
/// row still carries it, and bumps it by one.  Zero matched rows means the
/// revision went stale.
pub fn update_row(
    txn: &mut dyn Transaction,
    table: &str,
    id: RowId,
    rev: u64,
    mut fields: Vec<(String, Value)>,
) -> Result<(), Error> {
    fields.push(("rev".into(), Value::UInt64(rev + 1)));
    let clauses = ClauseList::new().eq("id", id).eq("rev", rev);
    match txn.update(table, fields, &clauses)? {
        1 => Ok(()),
        0 => Err(Error::StaleRevision {
            table: table.into(),
            id,
        }),
        _ => unreachable!("id clauses match at most one row"),
    }
}

/// Delete one row under its revision.
pub fn delete_row(
    txn: &mut dyn Transaction,
    table: &str,
    id: RowId,
    rev: u64,
) -> Result<(), Error> {
    let clauses = ClauseList::new().eq("id", id).eq("rev", rev);
    match txn.delete(table, &clauses)? {
        1 => Ok(()),
        0 => Err(Error::StaleRevision {
            table: table.into(),
            id,
        }),
        _ => unreachable!("id clauses match at most one row"),
    }
}
