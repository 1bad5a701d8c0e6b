//! Parameter binding utilities for database queries.
//!
//! Binds [`Value`]s to driver-specific query objects. `Value::List` binds
//! each element in turn; callers expand the matching `?` placeholders first.

use crate::models::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres};

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Timestamp(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v)),
        Value::List(items) => items.iter().fold(query, bind_mysql_param),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Timestamp(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v)),
        Value::List(items) => items.iter().fold(query, bind_postgres_param),
    }
}

/// Number of bind slots `params` occupy once lists are flattened.
pub fn flat_len(params: &[Value]) -> usize {
    params
        .iter()
        .map(|p| match p {
            Value::List(items) => flat_len(items),
            _ => 1,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_len_expands_lists() {
        let params = vec![
            Value::Int(1),
            Value::List(vec![Value::Int(2), Value::Int(3)]),
            Value::Null,
        ];
        assert_eq!(flat_len(&params), 4);
        assert_eq!(flat_len(&[]), 0);
    }
}
