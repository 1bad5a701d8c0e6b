//! Statement execution and query logging.
//!
//! Every statement that reaches a driver goes through [`execute`] or
//! [`fetch_all`] here, which log one `[DB] ...` line per call. The
//! driver-specific code lives in parallel `mysql` / `postgres` submodules.

use crate::db::pool::DbPool;
use crate::db::row::{Row, Rows};
use crate::db::tx::DbTransaction;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Value};
use std::time::Instant;
use tracing::info;

const CONTINUATION_INDENT: &str = "\n\t\t\t\t\t     ";

/// Render a statement the way it appears in the query log.
///
/// Surrounding newlines and whitespace are trimmed and continuation lines
/// are indented so multi-line SQL lines up under the `[DB]` prefix.
pub fn format_query(query: &str, params: &[Value]) -> String {
    let query = query.trim_matches('\n').trim();
    format!(
        "[DB] {}{}",
        query.replace('\n', CONTINUATION_INDENT),
        format_params(params)
    )
}

/// `" (a, b)"`, or nothing without params.
pub fn format_params(params: &[Value]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = params.iter().map(|p| p.to_string()).collect();
    format!(" ({})", rendered.join(", "))
}

/// Where a statement runs.
pub(crate) enum Target<'a> {
    Pool(&'a DbPool),
    Tx(&'a mut DbTransaction),
}

/// Run a statement that returns no rows.
pub(crate) async fn execute(
    db: &str,
    target: Target<'_>,
    sql: &str,
    params: &[Value],
) -> DbResult<ExecResult> {
    let start = Instant::now();
    let result = match target {
        Target::Pool(DbPool::MySql(pool)) => mysql::execute(pool, sql, params).await,
        Target::Pool(DbPool::Postgres(pool)) => postgres::execute(pool, sql, params).await,
        Target::Tx(DbTransaction::MySql(tx)) => mysql::execute(&mut **tx, sql, params).await,
        Target::Tx(DbTransaction::Postgres(tx)) => {
            postgres::execute(&mut **tx, sql, params).await
        }
    };
    log_statement(db, sql, params, start);
    result
}

/// Run a statement and fetch every row.
pub(crate) async fn fetch_all(
    db: &str,
    target: Target<'_>,
    sql: &str,
    params: &[Value],
) -> DbResult<Rows> {
    let start = Instant::now();
    let result = match target {
        Target::Pool(DbPool::MySql(pool)) => mysql::fetch_all(pool, sql, params).await,
        Target::Pool(DbPool::Postgres(pool)) => postgres::fetch_all(pool, sql, params).await,
        Target::Tx(DbTransaction::MySql(tx)) => mysql::fetch_all(&mut **tx, sql, params).await,
        Target::Tx(DbTransaction::Postgres(tx)) => {
            postgres::fetch_all(&mut **tx, sql, params).await
        }
    };
    log_statement(db, sql, params, start);
    result
}

/// Run a statement and fetch the first row, if any.
pub(crate) async fn fetch_optional(
    db: &str,
    target: Target<'_>,
    sql: &str,
    params: &[Value],
) -> DbResult<Option<Row>> {
    let rows = fetch_all(db, target, sql, params).await?;
    Ok(rows.into_iter().next())
}

pub(crate) fn log_statement(db: &str, sql: &str, params: &[Value], start: Instant) {
    info!(
        db = %db,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "{}",
        format_query(sql, params)
    );
}

/// A statement bound to one database, executed with fresh parameters on
/// every call.
#[derive(Debug, Clone)]
pub struct Stmt {
    db: String,
    pool: DbPool,
    sql: String,
}

impl Stmt {
    pub(crate) fn new(db: impl Into<String>, pool: DbPool, sql: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            pool,
            sql: sql.into(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn exec(&self, params: &[Value]) -> DbResult<ExecResult> {
        execute(&self.db, Target::Pool(&self.pool), &self.sql, params).await
    }

    pub async fn query(&self, params: &[Value]) -> DbResult<Rows> {
        fetch_all(&self.db, Target::Pool(&self.pool), &self.sql, params).await
    }

    pub async fn query_row(&self, params: &[Value]) -> DbResult<Option<Row>> {
        fetch_optional(&self.db, Target::Pool(&self.pool), &self.sql, params).await
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::{Executor, MySql};

    pub async fn execute<'e, E>(executor: E, sql: &'e str, params: &'e [Value]) -> DbResult<ExecResult>
    where
        E: Executor<'e, Database = MySql>,
    {
        // Raw SQL avoids prepared statements, which DDL such as CREATE DATABASE rejects
        let result = if params.is_empty() {
            executor.execute(sql).await
        } else {
            let query = params.iter().fold(sqlx::query(sql), bind_mysql_param);
            query.execute(executor).await
        }
        .map_err(DbError::from)?;

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_id()),
        })
    }

    pub async fn fetch_all<'e, E>(executor: E, sql: &'e str, params: &'e [Value]) -> DbResult<Rows>
    where
        E: Executor<'e, Database = MySql>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await
        } else {
            let query = params.iter().fold(sqlx::query(sql), bind_mysql_param);
            query.fetch_all(executor).await
        }
        .map_err(DbError::from)?;

        Ok(Rows::from(rows))
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::{Executor, Postgres};

    pub async fn execute<'e, E>(executor: E, sql: &'e str, params: &'e [Value]) -> DbResult<ExecResult>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await
        } else {
            let query = params.iter().fold(sqlx::query(sql), bind_postgres_param);
            query.execute(executor).await
        }
        .map_err(DbError::from)?;

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch_all<'e, E>(executor: E, sql: &'e str, params: &'e [Value]) -> DbResult<Rows>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await
        } else {
            let query = params.iter().fold(sqlx::query(sql), bind_postgres_param);
            query.fetch_all(executor).await
        }
        .map_err(DbError::from)?;

        Ok(Rows::from(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_query_single_line() {
        assert_eq!(
            format_query("SELECT 1;", &[]),
            "[DB] SELECT 1;"
        );
    }

    #[test]
    fn test_format_query_with_params() {
        assert_eq!(
            format_query(
                "SELECT * FROM users WHERE id = ? AND name = ?",
                &[Value::Int(1), Value::from("john")]
            ),
            "[DB] SELECT * FROM users WHERE id = ? AND name = ? (1, john)"
        );
    }

    #[test]
    fn test_format_query_reindents_multiline() {
        let sql = "\n  SELECT *\nFROM users\n";
        assert_eq!(
            format_query(sql, &[]),
            "[DB] SELECT *\n\t\t\t\t\t     FROM users"
        );
    }

    #[test]
    fn test_format_params() {
        assert_eq!(format_params(&[]), "");
        assert_eq!(format_params(&[Value::Null, Value::Bool(true)]), " (NULL, true)");
    }
}
