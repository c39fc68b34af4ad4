//! The in-memory storage engine.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::backend::{Backend, Transaction};
use crate::clause::{ClauseList, Join};
use crate::error::Error;
use crate::schema::{Row, RowId, SCHEMA_VERSION, table};
use crate::value::Value;

//----------- MemoryBackend ----------------------------------------------------

/// A storage engine keeping all rows in process memory.
///
/// Transactions are serialized by holding the table lock for their entire
/// duration; writes are journaled so an abandoned transaction rolls back
/// cleanly.  Nothing is durable; this engine backs tests and ephemeral
/// deployments.
pub struct MemoryBackend {
    inner: Mutex<Tables>,
}

impl MemoryBackend {
    /// Create an empty store with all schema tables.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error> {
        let guard = self.inner.lock().expect("store lock is never poisoned");
        Ok(Box::new(TablesTxn::new(guard)))
    }
}

//----------- Tables -----------------------------------------------------------

/// The full table set of one store.
#[derive(Clone, Debug)]
pub(crate) struct Tables {
    /// The next fresh row identifier.
    ///
    /// Identifiers are minted from a single counter across all tables and
    /// are never reused, so a dangling reference can never alias a younger
    /// row.
    pub(crate) next_id: u64,

    /// All rows, by table and identifier.
    pub(crate) tables: BTreeMap<String, BTreeMap<RowId, Row>>,
}

impl Tables {
    /// Fresh tables, including the schema-version singleton.
    pub(crate) fn new() -> Self {
        let mut tables = Self {
            next_id: 1,
            tables: table::ALL
                .iter()
                .map(|name| (name.to_string(), BTreeMap::new()))
                .collect(),
        };
        let id = tables.mint();
        tables
            .tables
            .get_mut(table::DATABASE_VERSION)
            .expect("schema tables are complete")
            .insert(
                id,
                Row {
                    id,
                    rev: 1,
                    fields: [("version".to_string(), Value::UInt32(SCHEMA_VERSION))]
                        .into_iter()
                        .collect(),
                },
            );
        tables
    }

    /// The schema version recorded in the singleton row.
    pub(crate) fn version(&self) -> Option<u32> {
        let rows = self.tables.get(table::DATABASE_VERSION)?;
        let row = rows.values().next()?;
        row.get("version").as_uint().map(|v| v as u32)
    }

    fn mint(&mut self) -> RowId {
        let id = RowId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    fn table(&self, name: &str) -> Result<&BTreeMap<RowId, Row>, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.into()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut BTreeMap<RowId, Row>, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTable(name.into()))
    }
}

//----------- TablesTxn --------------------------------------------------------

/// One entry of the rollback journal.
enum Undo {
    /// A row was created; roll back by removing it.
    Created { table: String, id: RowId },

    /// A row was updated; roll back by restoring the pre-image.
    Updated { table: String, pre: Row },

    /// A row was deleted; roll back by re-inserting the pre-image.
    Deleted { table: String, pre: Row },
}

/// A transaction over [`Tables`], shared by the memory and file engines.
pub(crate) struct TablesTxn<'a> {
    guard: MutexGuard<'a, Tables>,
    journal: Vec<Undo>,
    finished: bool,

    /// Invoked with the final tables on commit; a failure rolls back.
    on_commit: Option<Box<dyn FnMut(&Tables) -> Result<(), Error> + Send + 'a>>,
}

impl<'a> TablesTxn<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, Tables>) -> Self {
        Self {
            guard,
            journal: Vec::new(),
            finished: false,
            on_commit: None,
        }
    }

    pub(crate) fn with_commit_hook(
        guard: MutexGuard<'a, Tables>,
        hook: impl FnMut(&Tables) -> Result<(), Error> + Send + 'a,
    ) -> Self {
        let mut txn = Self::new(guard);
        txn.on_commit = Some(Box::new(hook));
        txn
    }

    fn undo_all(&mut self) {
        while let Some(entry) = self.journal.pop() {
            match entry {
                Undo::Created { table, id } => {
                    self.guard
                        .tables
                        .get_mut(&table)
                        .expect("journaled tables exist")
                        .remove(&id);
                }
                Undo::Updated { table, pre } | Undo::Deleted { table, pre } => {
                    self.guard
                        .tables
                        .get_mut(&table)
                        .expect("journaled tables exist")
                        .insert(pre.id, pre);
                }
            }
        }
    }

    /// Rows of `table` matching `clauses` after resolving `joins`.
    fn matching_ids(&self, table: &str, clauses: &ClauseList) -> Result<Vec<RowId>, Error> {
        Ok(self
            .guard
            .table(table)?
            .values()
            .filter(|row| {
                let base = (*row).clone();
                clauses.matches(&move |t: Option<&str>| t.is_none().then(|| base.clone()))
            })
            .map(|row| row.id)
            .collect())
    }

    /// Resolve joins for one base row; yields one scope per join combination.
    fn scopes_for(&self, base: &Row, joins: &[Join]) -> Result<Vec<BTreeMap<String, Row>>, Error> {
        // The scope maps table names to matched rows; the base row is keyed
        // under the empty string.
        let mut scopes: Vec<BTreeMap<String, Row>> =
            vec![[(String::new(), base.clone())].into_iter().collect()];

        for join in joins {
            let to_table = self.guard.table(&join.to_table)?;
            let mut next = Vec::new();
            for scope in &scopes {
                let from_key = join.table.clone().unwrap_or_default();
                let Some(from) = scope.get(&from_key) else {
                    continue;
                };
                let value = from.get(&join.field);
                for cand in to_table.values() {
                    if cand.get(&join.to_field).compare(&value)
                        == Some(std::cmp::Ordering::Equal)
                    {
                        let mut extended = scope.clone();
                        extended.insert(join.to_table.clone(), cand.clone());
                        next.push(extended);
                    }
                }
            }
            scopes = next;
        }
        Ok(scopes)
    }

    fn select(
        &self,
        table: &str,
        joins: &[Join],
        clauses: &ClauseList,
    ) -> Result<Vec<Row>, Error> {
        let mut out = Vec::new();
        for row in self.guard.table(table)?.values() {
            let scopes = self.scopes_for(row, joins)?;
            let matched = scopes.into_iter().any(|scope| {
                clauses.matches(&move |t: Option<&str>| {
                    scope.get(t.unwrap_or_default()).cloned()
                })
            });
            if matched {
                out.push(row.clone());
            }
        }
        Ok(out)
    }
}

impl Transaction for TablesTxn<'_> {
    fn read(
        &self,
        table: &str,
        joins: &[Join],
        clauses: &ClauseList,
    ) -> Result<Vec<Row>, Error> {
        self.select(table, joins, clauses)
    }

    fn count(
        &self,
        table: &str,
        joins: &[Join],
        clauses: &ClauseList,
    ) -> Result<u64, Error> {
        Ok(self.select(table, joins, clauses)?.len() as u64)
    }

    fn create(&mut self, table: &str, fields: Vec<(String, Value)>) -> Result<RowId, Error> {
        self.guard.table(table)?;
        let id = self.guard.mint();
        let mut row = Row {
            id,
            rev: 1,
            fields: BTreeMap::new(),
        };
        for (field, value) in fields {
            match field.as_str() {
                "rev" => row.rev = value.as_uint().unwrap_or(1),
                "id" => {}
                _ => {
                    row.fields.insert(field, value);
                }
            }
        }
        self.guard
            .table_mut(table)
            .expect("validated above")
            .insert(id, row);
        self.journal.push(Undo::Created {
            table: table.into(),
            id,
        });
        Ok(id)
    }

    fn update(
        &mut self,
        table: &str,
        fields: Vec<(String, Value)>,
        clauses: &ClauseList,
    ) -> Result<u64, Error> {
        let ids = self.matching_ids(table, clauses)?;
        let rows = self.guard.table_mut(table)?;
        for id in &ids {
            let row = rows.get_mut(id).expect("matched rows exist");
            self.journal.push(Undo::Updated {
                table: table.into(),
                pre: row.clone(),
            });
            for (field, value) in &fields {
                match field.as_str() {
                    "rev" => {
                        row.rev = value
                            .as_uint()
                            .expect("revisions are unsigned integers");
                    }
                    "id" => {}
                    _ => {
                        row.fields.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        Ok(ids.len() as u64)
    }

    fn delete(&mut self, table: &str, clauses: &ClauseList) -> Result<u64, Error> {
        let ids = self.matching_ids(table, clauses)?;
        let rows = self.guard.table_mut(table)?;
        for id in &ids {
            let pre = rows.remove(id).expect("matched rows exist");
            self.journal.push(Undo::Deleted {
                table: table.into(),
                pre,
            });
        }
        Ok(ids.len() as u64)
    }

    fn commit(mut self: Box<Self>) -> Result<(), Error> {
        if let Some(mut hook) = self.on_commit.take() {
            if let Err(err) = hook(&self.guard) {
                self.undo_all();
                self.finished = true;
                return Err(err);
            }
        }
        self.finished = true;
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        // Drop performs the actual rollback.
    }
}

impl Drop for TablesTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{delete_row, read_one, update_row};

    #[test]
    fn create_read_roundtrip() {
        let store = MemoryBackend::new();
        let mut txn = store.begin().unwrap();
        let id = txn
            .create(
                table::ZONE,
                vec![("name".into(), Value::Text("example.com".into()))],
            )
            .unwrap();
        let row = read_one(
            &*txn,
            table::ZONE,
            &[],
            &ClauseList::new().eq("id", id),
        )
        .unwrap();
        assert_eq!(row.rev, 1);
        assert_eq!(row.get("name"), Value::Text("example.com".into()));
        txn.commit().unwrap();
    }

    #[test]
    fn revision_discipline() {
        let store = MemoryBackend::new();
        let mut txn = store.begin().unwrap();
        let id = txn
            .create(
                table::ZONE,
                vec![("name".into(), Value::Text("example.com".into()))],
            )
            .unwrap();

        update_row(
            &mut *txn,
            table::ZONE,
            id,
            1,
            vec![("name".into(), Value::Text("example.net".into()))],
        )
        .unwrap();

        // The same revision no longer matches.
        let err = update_row(
            &mut *txn,
            table::ZONE,
            id,
            1,
            vec![("name".into(), Value::Text("example.org".into()))],
        )
        .unwrap_err();
        assert!(matches!(err, Error::StaleRevision { .. }));

        // The bumped revision does.
        update_row(
            &mut *txn,
            table::ZONE,
            id,
            2,
            vec![("name".into(), Value::Text("example.org".into()))],
        )
        .unwrap();
        let row = read_one(&*txn, table::ZONE, &[], &ClauseList::new().eq("id", id)).unwrap();
        assert_eq!(row.rev, 3);

        delete_row(&mut *txn, table::ZONE, id, 3).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn rollback_on_drop() {
        let store = MemoryBackend::new();
        let id = {
            let mut txn = store.begin().unwrap();
            let id = txn
                .create(
                    table::POLICY,
                    vec![("name".into(), Value::Text("default".into()))],
                )
                .unwrap();
            txn.commit().unwrap();
            id
        };

        {
            let mut txn = store.begin().unwrap();
            update_row(
                &mut *txn,
                table::POLICY,
                id,
                1,
                vec![("name".into(), Value::Text("renamed".into()))],
            )
            .unwrap();
            txn.rollback();
        }

        let txn = store.begin().unwrap();
        let row = read_one(&*txn, table::POLICY, &[], &ClauseList::new().eq("id", id)).unwrap();
        assert_eq!(row.rev, 1);
        assert_eq!(row.get("name"), Value::Text("default".into()));
    }

    #[test]
    fn join_read() {
        let store = MemoryBackend::new();
        let mut txn = store.begin().unwrap();
        let policy = txn
            .create(
                table::POLICY,
                vec![("name".into(), Value::Text("default".into()))],
            )
            .unwrap();
        let zone = txn
            .create(
                table::ZONE,
                vec![
                    ("name".into(), Value::Text("example.com".into())),
                    ("policyId".into(), Value::Id(policy)),
                ],
            )
            .unwrap();
        txn.create(
            table::KEY_DATA,
            vec![("zoneId".into(), Value::Id(zone))],
        )
        .unwrap();

        // All key data of zones under the policy named "default".
        let rows = txn
            .read(
                table::KEY_DATA,
                &[
                    Join::new("zoneId", table::ZONE, "id"),
                    Join {
                        table: Some(table::ZONE.into()),
                        field: "policyId".into(),
                        to_table: table::POLICY.into(),
                        to_field: "id".into(),
                    },
                ],
                &ClauseList::new().on(
                    table::POLICY,
                    "name",
                    crate::clause::Compare::Equal,
                    Value::Text("default".into()),
                ),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn version_singleton() {
        let store = MemoryBackend::new();
        let txn = store.begin().unwrap();
        let row = read_one(
            &*txn,
            table::DATABASE_VERSION,
            &[],
            &ClauseList::new(),
        )
        .unwrap();
        assert_eq!(row.get("version"), Value::UInt32(SCHEMA_VERSION));
    }
}
