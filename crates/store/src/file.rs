//! The file-backed storage engine.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Transaction};
use crate::error::Error;
use crate::memory::{Tables, TablesTxn};
use crate::schema::{Row, SCHEMA_VERSION};

//----------- FileBackend ------------------------------------------------------

/// A storage engine persisting a durable snapshot on every commit.
///
/// The working set is the in-memory table set; committing a transaction
/// serializes the full set to a JSON snapshot and renames it over the
/// previous one, so a crash at any point leaves either the old or the new
/// snapshot on disk, never a torn one.
pub struct FileBackend {
    path: Utf8PathBuf,
    inner: Mutex<Tables>,
}

impl FileBackend {
    /// Open a store at `path`, creating it if absent.
    ///
    /// Fails if an existing snapshot cannot be decoded or carries a schema
    /// version this build does not understand.
    pub fn open(path: &Utf8Path) -> Result<Self, Error> {
        let tables = match std::fs::read_to_string(path) {
            Ok(text) => {
                let spec: Snapshot = serde_json::from_str(&text)
                    .map_err(|err| Error::Corrupt(err.to_string()))?;
                let tables = spec.into_tables();
                match tables.version() {
                    Some(SCHEMA_VERSION) => {}
                    Some(found) => {
                        return Err(Error::Version {
                            found,
                            expected: SCHEMA_VERSION,
                        });
                    }
                    None => {
                        return Err(Error::Corrupt(
                            "snapshot lacks the schema-version row".into(),
                        ));
                    }
                }
                log::debug!("Loaded store snapshot from '{path}'");
                tables
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Creating a fresh store at '{path}'");
                let tables = Tables::new();
                write_snapshot(path, &tables)?;
                tables
            }
            Err(err) => return Err(Error::Io(err.to_string())),
        };

        Ok(Self {
            path: path.to_owned(),
            inner: Mutex::new(tables),
        })
    }

    /// The path of the snapshot file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Backend for FileBackend {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, Error> {
        let guard = self.inner.lock().expect("store lock is never poisoned");
        let path = self.path.clone();
        Ok(Box::new(TablesTxn::with_commit_hook(
            guard,
            move |tables| write_snapshot(&path, tables),
        )))
    }
}

//----------- Snapshot ---------------------------------------------------------

/// The on-disk snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    /// The next fresh row identifier.
    next_id: u64,

    /// All rows, by table.
    tables: BTreeMap<String, Vec<Row>>,
}

impl Snapshot {
    fn build(tables: &Tables) -> Self {
        Self {
            next_id: tables.next_id,
            tables: tables
                .tables
                .iter()
                .map(|(name, rows)| (name.clone(), rows.values().cloned().collect()))
                .collect(),
        }
    }

    fn into_tables(self) -> Tables {
        Tables {
            next_id: self.next_id,
            tables: self
                .tables
                .into_iter()
                .map(|(name, rows)| {
                    (name, rows.into_iter().map(|row| (row.id, row)).collect())
                })
                .collect(),
        }
    }
}

/// Atomically write the snapshot for a table set.
fn write_snapshot(path: &Utf8Path, tables: &Tables) -> Result<(), Error> {
    let text = serde_json::to_vec_pretty(&Snapshot::build(tables))
        .map_err(|err| Error::Io(err.to_string()))?;

    let dir = path
        .parent()
        .expect("the snapshot path has a containing directory");
    std::fs::create_dir_all(dir).map_err(|err| Error::Io(err.to_string()))?;

    let mut tmp = tempfile::Builder::new()
        .tempfile_in(dir)
        .map_err(|err| Error::Io(err.to_string()))?;
    tmp.as_file_mut()
        .write_all(&text)
        .map_err(|err| Error::Io(err.to_string()))?;
    tmp.persist(path.as_std_path())
        .map_err(|err| Error::Io(err.to_string()))?;
    Ok(())
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::read_one;
    use crate::clause::ClauseList;
    use crate::schema::table;
    use crate::value::Value;

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store.db")).unwrap();

        let id = {
            let store = FileBackend::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            let id = txn
                .create(
                    table::ZONE,
                    vec![("name".into(), Value::Text("example.com".into()))],
                )
                .unwrap();
            txn.commit().unwrap();
            id
        };

        // Reopen and observe the committed row.
        let store = FileBackend::open(&path).unwrap();
        let txn = store.begin().unwrap();
        let row = read_one(&*txn, table::ZONE, &[], &ClauseList::new().eq("id", id)).unwrap();
        assert_eq!(row.get("name"), Value::Text("example.com".into()));
    }

    #[test]
    fn uncommitted_changes_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store.db")).unwrap();

        {
            let store = FileBackend::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            txn.create(
                table::ZONE,
                vec![("name".into(), Value::Text("example.com".into()))],
            )
            .unwrap();
            txn.rollback();
        }

        let store = FileBackend::open(&path).unwrap();
        let txn = store.begin().unwrap();
        assert_eq!(
            txn.count(table::ZONE, &[], &ClauseList::new()).unwrap(),
            0
        );
    }

    #[test]
    fn foreign_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store.db")).unwrap();

        {
            let store = FileBackend::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            let row = read_one(
                &*txn,
                table::DATABASE_VERSION,
                &[],
                &ClauseList::new(),
            )
            .unwrap();
            crate::backend::update_row(
                &mut *txn,
                table::DATABASE_VERSION,
                row.id,
                row.rev,
                vec![("version".into(), Value::UInt32(999))],
            )
            .unwrap();
            txn.commit().unwrap();
        }

        let err = FileBackend::open(&path).unwrap_err();
        assert!(matches!(err, Error::Version { found: 999, .. }));
    }
}
