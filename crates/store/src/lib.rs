//! Persistent row storage for Warden.
//!
//! The store keeps the enforcer's entities (policies, zones, keys and their
//! states) as rows in named tables.  It provides:
//!
//! - Typed row values with well-defined cross-type comparisons.
//! - A small clause AST with a fluent builder for filtered reads, updates
//!   and deletes, including inner joins across tables.
//! - Serializable transactions: a tick either commits fully or not at all.
//! - Optimistic concurrency: every row carries a revision that is checked on
//!   update and delete, and incremented on every successful update.
//! - Two engines behind one trait: a purely in-memory one, and a file-backed
//!   one that persists a durable snapshot on every commit.
//!
//! The store knows nothing about DNSSEC.  The entity layer above it owns the
//! mapping between Rust types and row fields, including the textual encoding
//! of enumerated values.

pub mod backend;
pub mod clause;
pub mod error;
pub mod file;
pub mod memory;
pub mod schema;
pub mod value;

pub use backend::{Backend, Transaction, delete_row, read_one, update_row};
pub use clause::{Clause, ClauseList, Compare, Join};
pub use error::Error;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use schema::{Row, RowId, SCHEMA_VERSION, table};
pub use value::Value;
