//! The per-database handle.

use crate::config::DbConfig;
use crate::db::migration::{Migration, TxFn};
use crate::db::pool::{DbPool, create_pool};
use crate::db::row::{Row, Rows};
use crate::db::stmt::{self, Stmt, Target};
use crate::db::tx::Tx;
use crate::error::{DbError, DbResult};
use crate::models::{Adapter, ExecResult, Value};
use futures_util::future::BoxFuture;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// A named database: its configuration, its pool once connected, and the
/// migrations, schema and seed registered against it.
///
/// Shared as `Arc<DB>`; every method takes `&self`.
pub struct DB {
    name: String,
    config: DbConfig,
    pool: RwLock<Option<DbPool>>,
    pub(crate) migrations: StdRwLock<Vec<Migration>>,
    pub(crate) migrate_lock: Mutex<()>,
    schema: StdRwLock<String>,
    seed: StdRwLock<Option<TxFn>>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DB {
    pub fn new(name: impl Into<String>, config: DbConfig) -> Self {
        Self {
            name: name.into(),
            config,
            pool: RwLock::new(None),
            migrations: StdRwLock::new(Vec::new()),
            migrate_lock: Mutex::new(()),
            schema: StdRwLock::new(String::new()),
            seed: StdRwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn adapter(&self) -> Adapter {
        self.config.adapter
    }

    /// Whether this database is configured as a read replica.
    pub fn is_replica(&self) -> bool {
        self.config.replica
    }

    /// Open the connection pool. Calling it again while connected is a no-op.
    pub async fn connect(&self) -> DbResult<()> {
        let mut pool = self.pool.write().await;
        if pool.is_some() {
            return Ok(());
        }

        let new_pool = create_pool(&self.config, None).await?;
        let server_version = new_pool.server_version().await;
        info!(
            db = %self.name,
            adapter = %self.config.adapter,
            server_version = ?server_version,
            "Connected"
        );
        *pool = Some(new_pool);
        Ok(())
    }

    /// Close the connection pool. Calling it while disconnected is a no-op.
    pub async fn close(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(db = %self.name, "Connection closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// The connected pool, or `NotConnected`.
    pub async fn pool(&self) -> DbResult<DbPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| DbError::not_connected(&self.name))
    }

    pub async fn begin(&self) -> DbResult<Tx> {
        let pool = self.pool().await?;
        Tx::begin(&self.name, &pool).await
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> DbResult<ExecResult> {
        let pool = self.pool().await?;
        stmt::execute(&self.name, Target::Pool(&pool), sql, params).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Rows> {
        let pool = self.pool().await?;
        stmt::fetch_all(&self.name, Target::Pool(&pool), sql, params).await
    }

    pub async fn query_row(&self, sql: &str, params: &[Value]) -> DbResult<Option<Row>> {
        let pool = self.pool().await?;
        stmt::fetch_optional(&self.name, Target::Pool(&pool), sql, params).await
    }

    pub async fn prepare(&self, sql: &str) -> DbResult<Stmt> {
        let pool = self.pool().await?;
        Ok(Stmt::new(&self.name, pool, sql))
    }

    /// Open a separate single-connection pool against another database on
    /// the same server. `None` uses the adapter's bootstrap database.
    pub async fn connect_db(&self, database: Option<&str>) -> DbResult<DbPool> {
        let target = database
            .or(self.config.adapter.bootstrap_database())
            .unwrap_or("");
        let mut config = self.config.clone();
        config.max_open_conns = 1;
        create_pool(&config, Some(target)).await
    }

    /// `CREATE DATABASE <name>;` through a bootstrap connection.
    pub async fn create_db(&self, database: &str) -> DbResult<()> {
        validate_identifier(database)?;
        let pool = self.connect_db(None).await?;
        let result = stmt::execute(
            &self.name,
            Target::Pool(&pool),
            &format!("CREATE DATABASE {};", database),
            &[],
        )
        .await;
        pool.close().await;
        result.map(|_| ())
    }

    /// `DROP DATABASE <name>;` through a bootstrap connection. On Postgres
    /// other sessions connected to the database are terminated first.
    pub async fn drop_db(&self, database: &str) -> DbResult<()> {
        validate_identifier(database)?;
        let pool = self.connect_db(None).await?;
        let result = self.drop_db_on(&pool, database).await;
        pool.close().await;
        result
    }

    async fn drop_db_on(&self, pool: &DbPool, database: &str) -> DbResult<()> {
        if self.config.adapter == Adapter::Postgres {
            stmt::execute(
                &self.name,
                Target::Pool(pool),
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid();",
                &[Value::from(database)],
            )
            .await?;
        }
        stmt::execute(
            &self.name,
            Target::Pool(pool),
            &format!("DROP DATABASE {};", database),
            &[],
        )
        .await
        .map(|_| ())
    }

    /// The schema text loaded by [`DB::load_schema`].
    pub fn schema(&self) -> String {
        self.schema.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.schema.write().unwrap_or_else(|e| e.into_inner()) = schema.into();
    }

    /// Execute the registered schema, typically on a freshly created database.
    pub async fn load_schema(&self) -> DbResult<()> {
        let schema = self.schema();
        if schema.trim().is_empty() {
            return Err(DbError::SchemaEmpty {
                database: self.name.clone(),
            });
        }
        self.exec(&schema, &[]).await?;
        Ok(())
    }

    /// Register the seed procedure run by [`DB::seed`].
    pub fn register_seed_tx<F>(&self, seed: F)
    where
        F: for<'a> Fn(&'a mut Tx) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
    {
        *self.seed.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(seed));
    }

    /// Run the registered seed inside one transaction. Without a seed this
    /// does nothing.
    pub async fn seed(&self) -> DbResult<()> {
        let seed = self.seed.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(seed) = seed else {
            info!(db = %self.name, "No seed registered");
            return Ok(());
        };

        let mut tx = self.begin().await?;
        match seed(&mut tx).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(db = %self.name, error = %rollback_err, "Failed to roll back seed");
                }
                Err(e)
            }
        }
    }
}

/// Database names are interpolated into DDL, so only plain identifiers pass.
fn validate_identifier(name: &str) -> DbResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::invalid_input(format!(
            "'{}' is not a valid database name",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> DB {
        DB::new(
            "primary",
            DbConfig::from_uri("postgres://u:p@localhost:5432/app").unwrap(),
        )
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("appy_test2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("app; DROP TABLE users").is_err());
        assert!(validate_identifier("app-db").is_err());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let db = db();
        assert!(!db.is_connected().await);
        let err = db.exec("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::NotConnected { .. }));
        // closing while disconnected is fine
        db.close().await;
    }

    #[tokio::test]
    async fn test_load_schema_requires_schema() {
        let db = db();
        let err = db.load_schema().await.unwrap_err();
        assert!(matches!(err, DbError::SchemaEmpty { .. }));
    }

    #[tokio::test]
    async fn test_seed_without_registration_is_noop() {
        assert!(db().seed().await.is_ok());
    }

    #[test]
    fn test_set_schema() {
        let db = db();
        db.set_schema("CREATE TABLE IF NOT EXISTS users (id int);");
        assert_eq!(db.schema(), "CREATE TABLE IF NOT EXISTS users (id int);");
    }
}
