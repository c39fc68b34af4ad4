//! Filter clauses and joins for store operations.

use crate::schema::Row;
use crate::value::Value;

//----------- Compare ----------------------------------------------------------

/// A comparison operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compare {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl Compare {
    fn matches(&self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering::*;

        let Some(ord) = left.compare(right) else {
            // Incomparable values never match, not even for NotEqual; a
            // clause on the wrong tag is a bug in the caller, not a filter.
            return false;
        };
        match self {
            Compare::Equal => ord == Equal,
            Compare::NotEqual => ord != Equal,
            Compare::LessThan => ord == Less,
            Compare::LessOrEqual => ord != Greater,
            Compare::GreaterThan => ord == Greater,
            Compare::GreaterOrEqual => ord != Less,
        }
    }
}

//----------- Clause -----------------------------------------------------------

/// A single filter clause.
#[derive(Clone, Debug)]
pub enum Clause {
    /// Compare a field against a value.
    Field {
        /// The table the field belongs to.
        ///
        /// `None` refers to the base table of the operation; a name refers
        /// to a joined table.
        table: Option<String>,

        /// The column name.
        field: String,

        /// The comparison operator.
        op: Compare,

        /// The value to compare against.
        value: Value,
    },

    /// Require a field to be the empty value.
    IsNull {
        /// The table the field belongs to (see [`Clause::Field`]).
        table: Option<String>,

        /// The column name.
        field: String,
    },

    /// A nested group of clauses, any of which may match.
    Any(Vec<Clause>),

    /// A nested group of clauses, all of which must match.
    All(Vec<Clause>),
}

impl Clause {
    /// Evaluate this clause against a scope of rows.
    ///
    /// The scope maps `None` to the base-table row and joined table names to
    /// their matched rows.
    pub(crate) fn matches(&self, scope: &dyn Fn(Option<&str>) -> Option<Row>) -> bool {
        match self {
            Clause::Field {
                table,
                field,
                op,
                value,
            } => {
                let Some(row) = scope(table.as_deref()) else {
                    return false;
                };
                op.matches(&row.get(field), value)
            }
            Clause::IsNull { table, field } => {
                let Some(row) = scope(table.as_deref()) else {
                    return false;
                };
                row.get(field).is_empty()
            }
            Clause::Any(clauses) => clauses.iter().any(|c| c.matches(scope)),
            Clause::All(clauses) => clauses.iter().all(|c| c.matches(scope)),
        }
    }
}

//----------- ClauseList -------------------------------------------------------

/// An AND-combined list of clauses, built fluently.
///
/// ```
/// use warden_store::{ClauseList, Value};
///
/// let clauses = ClauseList::new()
///     .eq("role", Value::Enum("ZSK".into()))
///     .gt("inception", Value::Int64(1000));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ClauseList {
    clauses: Vec<Clause>,
}

impl ClauseList {
    /// Create an empty clause list, which matches every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field = value`.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::Equal, value)
    }

    /// Require `field != value`.
    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::NotEqual, value)
    }

    /// Require `field < value`.
    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::LessThan, value)
    }

    /// Require `field <= value`.
    pub fn le(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::LessOrEqual, value)
    }

    /// Require `field > value`.
    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::GreaterThan, value)
    }

    /// Require `field >= value`.
    pub fn ge(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(field, Compare::GreaterOrEqual, value)
    }

    /// Require `field` to be empty.
    pub fn null(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::IsNull {
            table: None,
            field: field.into(),
        });
        self
    }

    /// Require a comparison on a joined table's field.
    pub fn on(
        mut self,
        table: impl Into<String>,
        field: impl Into<String>,
        op: Compare,
        value: impl Into<Value>,
    ) -> Self {
        self.clauses.push(Clause::Field {
            table: Some(table.into()),
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Require any of the given clauses to match.
    pub fn any(mut self, clauses: Vec<Clause>) -> Self {
        self.clauses.push(Clause::Any(clauses));
        self
    }

    /// Append a raw clause.
    pub fn push(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    fn cmp(mut self, field: impl Into<String>, op: Compare, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Field {
            table: None,
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// The clauses of this list.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate the full list against a row scope.
    pub(crate) fn matches(&self, scope: &dyn Fn(Option<&str>) -> Option<Row>) -> bool {
        self.clauses.iter().all(|c| c.matches(scope))
    }
}

//----------- Join -------------------------------------------------------------

/// An inner join between two tables.
///
/// The join matches rows of `to_table` whose `to_field` equals the value of
/// `field` on the already-joined `table` (or the base table when `table` is
/// `None`).
#[derive(Clone, Debug)]
pub struct Join {
    /// The already-in-scope table to join from (`None` = base table).
    pub table: Option<String>,

    /// The field on the from-side.
    pub field: String,

    /// The table to join.
    pub to_table: String,

    /// The field on the joined table.
    pub to_field: String,
}

impl Join {
    /// Join the base table's `field` to `to_table.to_field`.
    pub fn new(
        field: impl Into<String>,
        to_table: impl Into<String>,
        to_field: impl Into<String>,
    ) -> Self {
        Self {
            table: None,
            field: field.into(),
            to_table: to_table.into(),
            to_field: to_field.into(),
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Row, RowId};
    use std::collections::BTreeMap;

    fn row(fields: &[(&str, Value)]) -> Row {
        Row {
            id: RowId::from_raw(1),
            rev: 1,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn and_list() {
        let r = row(&[
            ("role", Value::Enum("ZSK".into())),
            ("inception", Value::Int64(500)),
        ]);
        let scope = move |t: Option<&str>| t.is_none().then(|| r.clone());

        assert!(
            ClauseList::new()
                .eq("role", Value::Enum("ZSK".into()))
                .lt("inception", Value::Int64(1000))
                .matches(&scope)
        );
        assert!(
            !ClauseList::new()
                .eq("role", Value::Enum("KSK".into()))
                .matches(&scope)
        );
    }

    #[test]
    fn nested_any() {
        let r = row(&[("state", Value::Enum("RETIRE".into()))]);
        let scope = move |t: Option<&str>| t.is_none().then(|| r.clone());

        let list = ClauseList::new().any(vec![
            Clause::Field {
                table: None,
                field: "state".into(),
                op: Compare::Equal,
                value: Value::Enum("ACTIVE".into()),
            },
            Clause::Field {
                table: None,
                field: "state".into(),
                op: Compare::Equal,
                value: Value::Enum("RETIRE".into()),
            },
        ]);
        assert!(list.matches(&scope));
    }

    #[test]
    fn null_clause() {
        let r = row(&[("nextChange", Value::Empty)]);
        let scope = move |t: Option<&str>| t.is_none().then(|| r.clone());
        assert!(ClauseList::new().null("nextChange").matches(&scope));
        assert!(ClauseList::new().null("missing").matches(&scope));
    }
}
