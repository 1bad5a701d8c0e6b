//! Versioned schema migrations.
//!
//! Migrations are registered in code against a [`DB`] handle, usually from
//! generated `register` functions under the migrate directory. Applied
//! versions are tracked in the `schema_migrations` table (configurable).

use crate::db::handle::DB;
use crate::db::tx::Tx;
use crate::error::{DbError, DbResult};
use crate::models::{Adapter, MigrationState, MigrationStatus, Value};
use chrono::NaiveDateTime;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A migration step that runs directly on the database handle.
pub type MigrateFn = Arc<dyn for<'a> Fn(&'a DB) -> BoxFuture<'a, DbResult<()>> + Send + Sync>;

/// A migration step (or seed) that runs inside a transaction.
pub type TxFn = Arc<dyn for<'a> Fn(&'a mut Tx) -> BoxFuture<'a, DbResult<()>> + Send + Sync>;

#[derive(Clone)]
pub enum Procedure {
    Plain(MigrateFn),
    Tx(TxFn),
}

/// A registered migration.
#[derive(Clone)]
pub struct Migration {
    pub file: String,
    pub version: String,
    pub(crate) up: Procedure,
    pub(crate) down: Procedure,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("file", &self.file)
            .field("version", &self.version)
            .field("tx", &matches!(self.up, Procedure::Tx(_)))
            .finish()
    }
}

/// Extract the version from a migration filename.
///
/// `db/migrate/primary/20200201165238_create_users.rs` -> `20200201165238`.
pub fn migration_version(file: &str) -> DbResult<String> {
    let stem = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DbError::invalid_migration_filename(file))?;

    let mut segments = stem.split('_');
    let version = segments.next().unwrap_or_default();
    let has_suffix = segments.next().is_some_and(|s| !s.is_empty());

    let is_timestamp = version.len() == 14
        && version.chars().all(|c| c.is_ascii_digit())
        && NaiveDateTime::parse_from_str(version, "%Y%m%d%H%M%S").is_ok();

    if !has_suffix || !is_timestamp {
        return Err(DbError::invalid_migration_filename(
            Path::new(file)
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(file),
        ));
    }

    Ok(version.to_string())
}

impl DB {
    /// Register a migration whose steps run directly on the handle.
    pub fn register_migration<U, D>(&self, file: &str, up: U, down: D) -> DbResult<()>
    where
        U: for<'a> Fn(&'a DB) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
        D: for<'a> Fn(&'a DB) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
    {
        self.add_migration(
            file,
            Procedure::Plain(Arc::new(up)),
            Procedure::Plain(Arc::new(down)),
        )
    }

    /// Register a migration whose steps each run inside their own transaction.
    pub fn register_migration_tx<U, D>(&self, file: &str, up: U, down: D) -> DbResult<()>
    where
        U: for<'a> Fn(&'a mut Tx) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
        D: for<'a> Fn(&'a mut Tx) -> BoxFuture<'a, DbResult<()>> + Send + Sync + 'static,
    {
        self.add_migration(
            file,
            Procedure::Tx(Arc::new(up)),
            Procedure::Tx(Arc::new(down)),
        )
    }

    fn add_migration(&self, file: &str, up: Procedure, down: Procedure) -> DbResult<()> {
        let version = migration_version(file)?;
        let file_name = Path::new(file)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(file)
            .to_string();

        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = migrations.iter().find(|m| m.version == version) {
            return Err(DbError::DuplicateMigration {
                version,
                file: existing.file.clone(),
            });
        }

        migrations.push(Migration {
            file: file_name,
            version,
            up,
            down,
        });
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(())
    }

    /// Registered migrations in ascending version order.
    pub fn migrations(&self) -> Vec<Migration> {
        self.migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply every pending migration in version order.
    ///
    /// Stops at the first failing migration; the ones before it stay applied.
    /// Returns the versions applied by this call.
    pub async fn migrate(&self) -> DbResult<Vec<String>> {
        let _guard = self.migrate_lock.lock().await;

        self.ensure_schema_migrations_table().await?;
        let applied: HashSet<String> = self.applied_versions().await?.into_iter().collect();
        let insert_sql = tracking::insert_version(self.adapter(), &self.config().tracking_table());

        let mut migrated = Vec::new();
        for migration in self.migrations() {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                db = %self.name(),
                version = %migration.version,
                file = %migration.file,
                "Migrating"
            );
            if let Err(e) = self.run_step(&migration.up, &insert_sql, &migration.version).await {
                error!(
                    db = %self.name(),
                    version = %migration.version,
                    applied = migrated.len(),
                    error = %e,
                    "Migration failed"
                );
                return Err(e);
            }
            migrated.push(migration.version);
        }

        if migrated.is_empty() {
            info!(db = %self.name(), "No pending migrations");
        }
        Ok(migrated)
    }

    /// Revert the most recently applied migration.
    ///
    /// Returns the reverted version, or `None` when nothing is applied.
    pub async fn rollback(&self) -> DbResult<Option<String>> {
        let _guard = self.migrate_lock.lock().await;

        self.ensure_schema_migrations_table().await?;
        let Some(latest) = self.applied_versions().await?.pop() else {
            info!(db = %self.name(), "No migrations to roll back");
            return Ok(None);
        };

        let migration = self
            .migrations()
            .into_iter()
            .find(|m| m.version == latest)
            .ok_or_else(|| DbError::MigrationNotFound {
                version: latest.clone(),
            })?;

        info!(
            db = %self.name(),
            version = %migration.version,
            file = %migration.file,
            "Rolling back"
        );
        let delete_sql = tracking::delete_version(self.adapter(), &self.config().tracking_table());
        self.run_step(&migration.down, &delete_sql, &migration.version)
            .await?;

        Ok(Some(latest))
    }

    /// Applied state of every registered migration.
    pub async fn migrate_status(&self) -> DbResult<Vec<MigrationStatus>> {
        self.ensure_schema_migrations_table().await?;
        let applied: HashSet<String> = self.applied_versions().await?.into_iter().collect();

        Ok(self
            .migrations()
            .into_iter()
            .map(|m| MigrationStatus {
                status: if applied.contains(&m.version) {
                    MigrationState::Up
                } else {
                    MigrationState::Down
                },
                version: m.version,
                file: m.file,
            })
            .collect())
    }

    /// Versions recorded in the tracking table, ascending.
    pub async fn applied_versions(&self) -> DbResult<Vec<String>> {
        let sql = tracking::select_versions(&self.config().tracking_table());
        let rows = self.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<String>("version"))
            .collect()
    }

    pub(crate) async fn ensure_schema_migrations_table(&self) -> DbResult<()> {
        let config = self.config();
        for sql in tracking::create_table(
            config.adapter,
            config.tracking_schema(),
            &config.tracking_table(),
        ) {
            self.exec(&sql, &[]).await?;
        }
        Ok(())
    }

    /// Run one migration step followed by its bookkeeping statement.
    async fn run_step(&self, step: &Procedure, bookkeeping: &str, version: &str) -> DbResult<()> {
        let params = [Value::from(version)];
        match step {
            Procedure::Plain(procedure) => {
                procedure(self).await?;
                self.exec(bookkeeping, &params).await?;
                Ok(())
            }
            Procedure::Tx(procedure) => {
                let mut tx = self.begin().await?;
                let result = match procedure(&mut tx).await {
                    Ok(()) => tx.exec(bookkeeping, &params).await.map(|_| ()),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => tx.commit().await,
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(
                                db = %self.name(),
                                version = %version,
                                error = %rollback_err,
                                "Failed to roll back migration transaction"
                            );
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// SQL for the migration tracking table.
pub(crate) mod tracking {
    use super::Adapter;

    pub fn create_table(adapter: Adapter, schema: &str, table: &str) -> Vec<String> {
        match adapter {
            Adapter::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {} (version varchar(64), PRIMARY KEY (version));",
                table
            )],
            Adapter::Postgres => vec![
                format!("CREATE SCHEMA IF NOT EXISTS {};", schema),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (version VARCHAR PRIMARY KEY);",
                    table
                ),
            ],
        }
    }

    pub fn select_versions(table: &str) -> String {
        format!("SELECT version FROM {} ORDER BY version ASC;", table)
    }

    pub fn insert_version(adapter: Adapter, table: &str) -> String {
        format!(
            "INSERT INTO {} (version) VALUES ({});",
            table,
            adapter.placeholder(1)
        )
    }

    pub fn delete_version(adapter: Adapter, table: &str) -> String {
        format!(
            "DELETE FROM {} WHERE version = {};",
            table,
            adapter.placeholder(1)
        )
    }

    /// Trailing `INSERT` that marks dumped versions as applied.
    pub fn versions_insert(table: &str, versions: &[String]) -> Option<String> {
        if versions.is_empty() {
            return None;
        }
        let values: Vec<String> = versions.iter().map(|v| format!("('{}')", v)).collect();
        Some(format!(
            "INSERT INTO {} (version) VALUES\n{};",
            table,
            values.join(",\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_version() {
        assert_eq!(
            migration_version("20200201165238_create_users.rs").unwrap(),
            "20200201165238"
        );
        assert_eq!(
            migration_version("db/migrate/primary/20200201165238_add_index_to_users.rs").unwrap(),
            "20200201165238"
        );
    }

    #[test]
    fn test_migration_version_rejects_bad_names() {
        for file in [
            "create_users.rs",
            "20200201165238.rs",
            "20200201165238_.rs",
            "2020020116523_create_users.rs",
            "20201301165238_create_users.rs",
        ] {
            let err = migration_version(file).unwrap_err();
            assert!(
                matches!(err, DbError::InvalidMigrationFilename { .. }),
                "{} should be rejected",
                file
            );
        }
    }

    #[test]
    fn test_invalid_filename_message_uses_basename() {
        let err = migration_version("db/migrate/primary/create_users.rs").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid filename 'create_users.rs', a valid example: 20060102150405_create_users.rs"
        );
    }

    #[test]
    fn test_tracking_sql_mysql() {
        assert_eq!(
            tracking::create_table(Adapter::MySql, "appy", "appy.schema_migrations"),
            vec![
                "CREATE TABLE IF NOT EXISTS appy.schema_migrations (version varchar(64), PRIMARY KEY (version));"
                    .to_string()
            ]
        );
        assert_eq!(
            tracking::insert_version(Adapter::MySql, "appy.schema_migrations"),
            "INSERT INTO appy.schema_migrations (version) VALUES (?);"
        );
    }

    #[test]
    fn test_tracking_sql_postgres() {
        let sql = tracking::create_table(Adapter::Postgres, "public", "public.schema_migrations");
        assert_eq!(sql[0], "CREATE SCHEMA IF NOT EXISTS public;");
        assert_eq!(
            sql[1],
            "CREATE TABLE IF NOT EXISTS public.schema_migrations (version VARCHAR PRIMARY KEY);"
        );
        assert_eq!(
            tracking::delete_version(Adapter::Postgres, "public.schema_migrations"),
            "DELETE FROM public.schema_migrations WHERE version = $1;"
        );
    }

    #[test]
    fn test_versions_insert() {
        assert_eq!(tracking::versions_insert("public.schema_migrations", &[]), None);
        assert_eq!(
            tracking::versions_insert(
                "public.schema_migrations",
                &["20200101000000".to_string(), "20200102000000".to_string()]
            )
            .unwrap(),
            "INSERT INTO public.schema_migrations (version) VALUES\n('20200101000000'),\n('20200102000000');"
        );
    }

    #[test]
    fn test_register_rejects_duplicates_and_sorts() {
        let db = DB::new(
            "primary",
            crate::config::DbConfig::from_uri("postgres://u:p@localhost/app").unwrap(),
        );
        fn noop(_: &DB) -> BoxFuture<'_, DbResult<()>> {
            Box::pin(async { Ok(()) })
        }

        db.register_migration("20200102000000_add_email.rs", noop, noop)
            .unwrap();
        db.register_migration("20200101000000_create_users.rs", noop, noop)
            .unwrap();
        let err = db
            .register_migration("20200101000000_create_accounts.rs", noop, noop)
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateMigration { .. }));

        let versions: Vec<String> = db.migrations().into_iter().map(|m| m.version).collect();
        assert_eq!(versions, vec!["20200101000000", "20200102000000"]);
    }

    #[test]
    fn test_register_rejects_invalid_filename() {
        let db = DB::new(
            "primary",
            crate::config::DbConfig::from_uri("mysql://root@localhost/app").unwrap(),
        );
        fn noop(_: &mut Tx) -> BoxFuture<'_, DbResult<()>> {
            Box::pin(async { Ok(()) })
        }

        let err = db
            .register_migration_tx("create_users.rs", noop, noop)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidMigrationFilename { .. }));
        assert!(db.migrations().is_empty());
    }
}
