//! Database lifecycle commands.
//!
//! The `strata` binary dispatches here. Applications that register
//! migrations, seeds or schemas in code call [`run`] from their own binary
//! after registration, so the commands see them.

use crate::config::Config;
use crate::db::{DB, Engine};
use crate::error::DbResult;
use crate::models::MigrationStatus;
use clap::{Args, Subcommand};
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    /// Database name (the `<NAME>` of `DB_URI_<NAME>`, camel-cased). Every
    /// non-replica database when omitted.
    #[arg(long)]
    pub database: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the configured databases
    #[command(name = "db:create")]
    DbCreate(DatabaseArgs),

    /// Drop the configured databases
    #[command(name = "db:drop")]
    DbDrop(DatabaseArgs),

    /// Run pending migrations
    #[command(name = "db:migrate")]
    DbMigrate(DatabaseArgs),

    /// Roll back the latest applied migration
    #[command(name = "db:rollback")]
    DbRollback(DatabaseArgs),

    /// Show which migrations are up or down
    #[command(name = "db:migrate:status")]
    DbMigrateStatus(DatabaseArgs),

    /// Dump the schema and applied versions to <migrate-dir>/<db>/schema.rs
    #[command(name = "db:schema:dump")]
    DbSchemaDump(DatabaseArgs),

    /// Load the registered schema
    #[command(name = "db:schema:load")]
    DbSchemaLoad(DatabaseArgs),

    /// Run the registered seed
    #[command(name = "db:seed")]
    DbSeed(DatabaseArgs),

    /// Generate an empty migration file
    #[command(name = "generate:migration")]
    GenerateMigration {
        /// Migration name, e.g. CreateUsers
        name: String,

        #[arg(long, default_value = "primary")]
        database: String,

        /// Run the generated steps inside a transaction
        #[arg(long)]
        tx: bool,
    },
}

/// Databases a command applies to. Replicas are skipped unless named.
fn targets(engine: &Engine, args: &DatabaseArgs) -> DbResult<Vec<Arc<DB>>> {
    match &args.database {
        Some(name) => Ok(vec![engine.require(name)?]),
        None => Ok(engine
            .databases()
            .values()
            .filter(|db| !db.is_replica())
            .cloned()
            .collect()),
    }
}

/// Run one command against the engine's databases.
pub async fn run(config: &Config, engine: &Engine) -> DbResult<()> {
    match &config.command {
        Command::DbCreate(args) => {
            for db in targets(engine, args)? {
                let database = &db.config().database;
                db.create_db(database).await?;
                println!("Created database '{}' ({})", database, db.name());
            }
        }
        Command::DbDrop(args) => {
            for db in targets(engine, args)? {
                let database = &db.config().database;
                db.drop_db(database).await?;
                println!("Dropped database '{}' ({})", database, db.name());
            }
        }
        Command::DbMigrate(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                let applied = db.migrate().await?;
                if applied.is_empty() {
                    println!("{}: nothing to migrate", db.name());
                }
                for version in applied {
                    println!("{}: migrated {}", db.name(), version);
                }
            }
        }
        Command::DbRollback(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                match db.rollback().await? {
                    Some(version) => println!("{}: rolled back {}", db.name(), version),
                    None => println!("{}: nothing to roll back", db.name()),
                }
            }
        }
        Command::DbMigrateStatus(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                let statuses = db.migrate_status().await?;
                println!("database: {}\n\n{}", db.name(), format_status(&statuses));
            }
        }
        Command::DbSchemaDump(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                let path = db.dump_schema(&config.migrate_dir).await?;
                println!("{}: schema written to {}", db.name(), path.display());
            }
        }
        Command::DbSchemaLoad(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                db.load_schema().await?;
                println!("{}: schema loaded", db.name());
            }
        }
        Command::DbSeed(args) => {
            for db in targets(engine, args)? {
                db.connect().await?;
                db.seed().await?;
                println!("{}: seeded", db.name());
            }
        }
        Command::GenerateMigration { name, database, tx } => {
            let db = engine.require(database)?;
            let path = db.generate_migration(&config.migrate_dir, name, *tx)?;
            println!("Created {}", path.display());
        }
    }

    info!(command = ?config.command, "Command finished");
    Ok(())
}

/// Status table in the familiar three-column layout.
pub fn format_status(statuses: &[MigrationStatus]) -> String {
    let mut out = String::from(" Status   Migration ID    Migration File\n");
    out.push_str(&"-".repeat(50));
    for status in statuses {
        out.push_str(&format!(
            "\n{:>6}   {:<14}  {}",
            status.status.to_string(),
            status.version,
            status.file
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_db_configs;
    use crate::models::MigrationState;
    use clap::Parser;

    fn engine(vars: &[(&str, &str)]) -> Engine {
        let (configs, errors) = parse_db_configs(vars.iter().map(|(k, v)| (*k, *v)));
        Engine::new(configs, errors)
    }

    #[test]
    fn test_parse_commands() {
        let config = Config::parse_from(["strata", "db:migrate", "--database", "primary"]);
        match config.command {
            Command::DbMigrate(args) => assert_eq!(args.database.as_deref(), Some("primary")),
            other => panic!("unexpected command {:?}", other),
        }

        let config = Config::parse_from(["strata", "generate:migration", "CreateUsers", "--tx"]);
        match config.command {
            Command::GenerateMigration { name, database, tx } => {
                assert_eq!(name, "CreateUsers");
                assert_eq!(database, "primary");
                assert!(tx);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_targets_skip_replicas() {
        let engine = engine(&[
            ("DB_URI_PRIMARY", "postgres://u:p@localhost/app"),
            ("DB_URI_PRIMARY_REPLICA", "postgres://u:p@replica/app"),
            ("DB_REPLICA_PRIMARY_REPLICA", "true"),
        ]);

        let all = targets(&engine, &DatabaseArgs::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "primary");

        let named = DatabaseArgs {
            database: Some("primaryReplica".to_string()),
        };
        assert_eq!(targets(&engine, &named).unwrap()[0].name(), "primaryReplica");

        let missing = DatabaseArgs {
            database: Some("other".to_string()),
        };
        assert!(targets(&engine, &missing).is_err());
    }

    #[test]
    fn test_format_status() {
        let out = format_status(&[MigrationStatus {
            status: MigrationState::Up,
            version: "20240101000000".to_string(),
            file: "db/migrate/primary/20240101000000_create_users.rs".to_string(),
        }]);
        let last = out.lines().last().unwrap();
        assert_eq!(
            last,
            "    up   20240101000000  db/migrate/primary/20240101000000_create_users.rs"
        );
    }

    #[tokio::test]
    async fn test_generate_migration_command() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&[("DB_URI_PRIMARY", "mysql://root@localhost/app")]);
        let config = Config::parse_from([
            "strata",
            "--migrate-dir",
            dir.path().to_str().unwrap(),
            "generate:migration",
            "AddEmailToUsers",
        ]);

        run(&config, &engine).await.unwrap();

        let generated: Vec<_> = std::fs::read_dir(dir.path().join("primary"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(generated.len(), 1);
        assert!(generated[0].ends_with("_add_email_to_users.rs"));
    }
}
