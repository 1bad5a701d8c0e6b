//! Result rows.

use crate::db::types::{decode_mysql_column, decode_postgres_column};
use crate::error::{DbError, DbResult};
use crate::models::Value;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, MySql, Postgres, Row as SqlxRow};

/// A single result row from either driver.
#[derive(Debug)]
pub enum Row {
    MySql(MySqlRow),
    Postgres(PgRow),
}

impl Row {
    /// Column names in select order.
    pub fn columns(&self) -> Vec<String> {
        match self {
            Row::MySql(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            Row::Postgres(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Row::MySql(row) => row.len(),
            Row::Postgres(row) => row.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the column at `idx` into a [`Value`].
    pub fn value_at(&self, idx: usize) -> DbResult<Value> {
        if idx >= self.len() {
            return Err(DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                idx,
                self.len()
            )));
        }
        Ok(match self {
            Row::MySql(row) => decode_mysql_column(row, idx),
            Row::Postgres(row) => decode_postgres_column(row, idx),
        })
    }

    /// Decode the named column into a [`Value`].
    pub fn get_value(&self, column: &str) -> DbResult<Value> {
        let idx = match self {
            Row::MySql(row) => row.columns().iter().position(|c| c.name() == column),
            Row::Postgres(row) => row.columns().iter().position(|c| c.name() == column),
        }
        .ok_or_else(|| DbError::decode(column, "column not found"))?;
        self.value_at(idx)
    }

    /// Every column as `(name, value)` pairs.
    pub fn values(&self) -> Vec<(String, Value)> {
        let names = self.columns();
        names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let value = match self {
                    Row::MySql(row) => decode_mysql_column(row, idx),
                    Row::Postgres(row) => decode_postgres_column(row, idx),
                };
                (name, value)
            })
            .collect()
    }

    /// Decode a column with the driver's native decoding.
    pub fn try_get<T>(&self, column: &str) -> DbResult<T>
    where
        T: for<'r> sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
        T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        match self {
            Row::MySql(row) => row.try_get(column).map_err(DbError::from),
            Row::Postgres(row) => row.try_get(column).map_err(DbError::from),
        }
    }
}

/// Rows returned by a query, already fetched.
#[derive(Debug, Default)]
pub struct Rows {
    rows: Vec<Row>,
}

impl Rows {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
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

    pub fn into_vec(self) -> Vec<Row> {
        self.rows
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

impl From<Vec<MySqlRow>> for Rows {
    fn from(rows: Vec<MySqlRow>) -> Self {
        Self::new(rows.into_iter().map(Row::MySql).collect())
    }
}

impl From<Vec<PgRow>> for Rows {
    fn from(rows: Vec<PgRow>) -> Self {
        Self::new(rows.into_iter().map(Row::Postgres).collect())
    }
}
