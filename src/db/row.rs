//! Materialized query results.

use std::sync::Arc;

use rusqlite::types::{FromSql, FromSqlError, ValueRef};

use super::value::Value;
use crate::error::{Error, Result};

/// Something that selects a column of a row: a position or a name.
pub trait ColumnIndex {
    fn index(&self, columns: &[String]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn index(&self, columns: &[String]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::ColumnIndex {
                index: *self,
                count: columns.len(),
            })
        }
    }
}

impl ColumnIndex for &str {
    fn index(&self, columns: &[String]) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(self))
            .ok_or_else(|| Error::ColumnNotFound(self.to_string()))
    }
}

/// One result row. Rows of the same result share their column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of a column.
    pub fn get_value<I: ColumnIndex>(&self, idx: I) -> Result<&Value> {
        let i = idx.index(&self.columns)?;
        self.values.get(i).ok_or(Error::ColumnIndex {
            index: i,
            count: self.values.len(),
        })
    }

    /// Typed value of a column.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use ratelimited_db::{Row, Value};
    ///
    /// let row = Row::new(
    ///     Arc::from(vec!["id".to_string(), "name".to_string()]),
    ///     vec![Value::Integer(1), Value::Text("Alice".into())],
    /// );
    /// let name: String = row.get("name").unwrap();
    /// assert_eq!(name, "Alice");
    /// ```
    pub fn get<T: FromSql, I: ColumnIndex>(&self, idx: I) -> Result<T> {
        let i = idx.index(&self.columns)?;
        let value = self.get_value(i)?;
        T::column_result(ValueRef::from(value)).map_err(|err| match err {
            FromSqlError::InvalidType => Error::InvalidType {
                column: self.columns[i].clone(),
                expected: std::any::type_name::<T>(),
                found: value.data_type(),
            },
            other => Error::Sqlite(rusqlite::Error::FromSqlConversionFailure(
                i,
                value.data_type(),
                Box::new(other),
            )),
        })
    }
}

/// All rows of a query, in result order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl Rows {
    pub fn new(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}
