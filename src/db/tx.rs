//! Transactions.

use crate::db::pool::DbPool;
use crate::db::row::{Row, Rows};
use crate::db::stmt::{self, Target};
use crate::error::{DbError, DbResult};
use crate::models::{Adapter, ExecResult, Value};
use sqlx::{MySql, Postgres, Transaction};
use std::time::Instant;

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
}

impl DbTransaction {
    pub fn adapter(&self) -> Adapter {
        match self {
            DbTransaction::MySql(_) => Adapter::MySql,
            DbTransaction::Postgres(_) => Adapter::Postgres,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

/// An open transaction on one database. Every statement is logged.
///
/// Dropping a `Tx` without calling [`Tx::commit`] rolls it back.
pub struct Tx {
    db: String,
    inner: DbTransaction,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("db", &self.db)
            .field("adapter", &self.inner.adapter())
            .finish_non_exhaustive()
    }
}

impl Tx {
    /// Begin a transaction on `pool`.
    pub(crate) async fn begin(db: &str, pool: &DbPool) -> DbResult<Self> {
        let start = Instant::now();
        let inner = match pool {
            DbPool::MySql(pool) => DbTransaction::MySql(pool.begin().await?),
            DbPool::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
        };
        stmt::log_statement(db, "BEGIN;", &[], start);

        Ok(Self {
            db: db.to_string(),
            inner,
        })
    }

    /// Name of the database this transaction runs on.
    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn adapter(&self) -> Adapter {
        self.inner.adapter()
    }

    pub async fn exec(&mut self, sql: &str, params: &[Value]) -> DbResult<ExecResult> {
        stmt::execute(&self.db, Target::Tx(&mut self.inner), sql, params).await
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Rows> {
        stmt::fetch_all(&self.db, Target::Tx(&mut self.inner), sql, params).await
    }

    pub async fn query_row(&mut self, sql: &str, params: &[Value]) -> DbResult<Option<Row>> {
        stmt::fetch_optional(&self.db, Target::Tx(&mut self.inner), sql, params).await
    }

    pub async fn commit(self) -> DbResult<()> {
        let start = Instant::now();
        let result = self.inner.commit().await;
        stmt::log_statement(&self.db, "COMMIT;", &[], start);
        result
    }

    pub async fn rollback(self) -> DbResult<()> {
        let start = Instant::now();
        let result = self.inner.rollback().await;
        stmt::log_statement(&self.db, "ROLLBACK;", &[], start);
        result
    }
}
