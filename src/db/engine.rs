//! The database registry.

use crate::config::{self, DbConfig};
use crate::db::handle::DB;
use crate::error::{DbError, DbResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Every configured database, keyed by name, plus the configuration errors
/// found while building them.
///
/// Databases that failed to parse are absent; the engine itself is always
/// constructed so callers decide whether errors are fatal.
#[derive(Debug, Default)]
pub struct Engine {
    databases: BTreeMap<String, Arc<DB>>,
    errors: Vec<DbError>,
}

impl Engine {
    /// Build the engine from `DB_URI_<NAME>` and related environment variables.
    pub fn from_env() -> Self {
        let (configs, errors) = config::from_env();
        Self::new(configs, errors)
    }

    pub fn new(configs: BTreeMap<String, DbConfig>, errors: Vec<DbError>) -> Self {
        let databases = configs
            .into_iter()
            .map(|(name, config)| {
                let db = Arc::new(DB::new(name.clone(), config));
                (name, db)
            })
            .collect();

        Self { databases, errors }
    }

    /// Look up a database by name.
    pub fn db(&self, name: &str) -> Option<Arc<DB>> {
        self.databases.get(name).cloned()
    }

    /// Like [`Engine::db`] but with an error naming the missing database.
    pub fn require(&self, name: &str) -> DbResult<Arc<DB>> {
        self.db(name).ok_or_else(|| {
            DbError::config(format!(
                "database '{}' is not configured, set DB_URI_{}",
                name,
                to_env_suffix(name)
            ))
        })
    }

    pub fn databases(&self) -> &BTreeMap<String, Arc<DB>> {
        &self.databases
    }

    pub fn errors(&self) -> &[DbError] {
        &self.errors
    }

    /// One-line summary for startup output: `* DBs: primary, replica`.
    pub fn info(&self) -> String {
        if self.databases.is_empty() {
            return "* DBs: none".to_string();
        }
        let names: Vec<&str> = self.databases.keys().map(String::as_str).collect();
        format!("* DBs: {}", names.join(", "))
    }

    /// Connect every database. Stops at the first failure.
    pub async fn connect_all(&self) -> DbResult<()> {
        for (name, db) in &self.databases {
            db.connect().await.inspect_err(|e| {
                warn!(db = %name, error = %e, "Failed to connect");
            })?;
        }
        info!(count = self.databases.len(), "All databases connected");
        Ok(())
    }

    /// Close every connected database.
    pub async fn close_all(&self) {
        for db in self.databases.values() {
            db.close().await;
        }
    }
}

/// `primaryReplica` -> `PRIMARY_REPLICA`.
fn to_env_suffix(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() && !out.is_empty() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_db_configs;

    fn engine(vars: &[(&str, &str)]) -> Engine {
        let (configs, errors) = parse_db_configs(vars.iter().map(|(k, v)| (*k, *v)));
        Engine::new(configs, errors)
    }

    #[test]
    fn test_engine_registers_databases() {
        let engine = engine(&[
            ("DB_URI_PRIMARY", "postgres://u:p@localhost/app"),
            ("DB_URI_PRIMARY_REPLICA", "postgres://u:p@replica/app"),
            ("DB_REPLICA_PRIMARY_REPLICA", "true"),
        ]);

        assert!(engine.errors().is_empty());
        assert_eq!(engine.info(), "* DBs: primary, primaryReplica");
        assert!(engine.db("primaryReplica").unwrap().is_replica());
        assert!(engine.db("missing").is_none());
    }

    #[test]
    fn test_engine_keeps_errors() {
        let engine = engine(&[("DB_URI_PRIMARY", "sqlite://app.db")]);
        assert_eq!(engine.errors().len(), 1);
        assert_eq!(engine.info(), "* DBs: none");
    }

    #[test]
    fn test_require_names_env_var() {
        let engine = Engine::default();
        let err = engine.require("primaryReplica").unwrap_err();
        assert!(err.to_string().contains("DB_URI_PRIMARY_REPLICA"));
    }

    #[tokio::test]
    async fn test_close_all_without_connections() {
        let engine = engine(&[("DB_URI_PRIMARY", "mysql://root@localhost/app")]);
        engine.close_all().await;
        assert!(!engine.db("primary").unwrap().is_connected().await);
    }
}
