//! Schema dumps.
//!
//! SQL queries are organized in the `queries` submodule with constants for each
//! database type. The dump is rebuilt from the catalogs and rewritten so that
//! loading it into a database that already has some of the objects succeeds.

use crate::db::artifact::{render_schema, write_file};
use crate::db::handle::DB;
use crate::db::migration::tracking;
use crate::error::{DbError, DbResult};
use crate::models::{Adapter, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

impl DB {
    /// Dump the current schema plus the applied migration versions.
    ///
    /// The dump becomes this handle's schema and is written to
    /// `<dir>/<name>/schema.rs`. Returns the written path.
    pub async fn dump_schema(&self, dir: &Path) -> DbResult<PathBuf> {
        self.ensure_schema_migrations_table().await?;

        let mut statements = match self.adapter() {
            Adapter::MySql => mysql::dump(self).await?,
            Adapter::Postgres => postgres::dump(self).await?,
        };

        let versions = self.applied_versions().await?;
        if let Some(insert) =
            tracking::versions_insert(&self.config().tracking_table(), &versions)
        {
            statements.push(insert);
        }

        let schema = statements.join("\n\n");
        self.set_schema(schema.clone());

        let path = dir.join(self.name()).join("schema.rs");
        write_file(&path, &render_schema(&schema))?;

        info!(
            db = %self.name(),
            path = %path.display(),
            versions = versions.len(),
            "Dumped schema"
        );
        Ok(path)
    }
}

fn string_value(value: Value, column: &str) -> DbResult<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bytes(b) => String::from_utf8(b).map_err(|e| DbError::decode(column, e.to_string())),
        other => Err(DbError::decode(
            column,
            format!("expected text, got {}", other.type_name()),
        )),
    }
}

/// Insert `IF NOT EXISTS` after the first occurrence of `keyword`.
fn if_not_exists(statement: &str, keyword: &str) -> String {
    match statement.find(keyword) {
        Some(pos) => {
            let end = pos + keyword.len();
            format!("{}IF NOT EXISTS {}", &statement[..end], &statement[end..])
        }
        None => statement.to_string(),
    }
}

/// Drop the `AUTO_INCREMENT=<n>` table option MySQL adds to live tables.
fn strip_auto_increment(statement: &str) -> String {
    const OPTION: &str = " AUTO_INCREMENT=";
    let Some(pos) = statement.find(OPTION) else {
        return statement.to_string();
    };
    let rest = &statement[pos + OPTION.len()..];
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    format!("{}{}", &statement[..pos], &rest[digits..])
}

mod queries {
    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT TABLE_NAME AS name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;
    }

    pub mod postgres {
        pub const LIST_SEQUENCES: &str = r#"
            SELECT sequencename::text AS name,
                   data_type::text AS data_type,
                   start_value,
                   increment_by
            FROM pg_sequences
            WHERE schemaname = $1
            ORDER BY sequencename
        "#;

        /// Sequences owned by a column (serial columns), with that column.
        pub const LIST_SEQUENCE_OWNERS: &str = r#"
            SELECT s.relname::text AS name,
                   t.relname::text AS table_name,
                   a.attname::text AS column_name
            FROM pg_class s
            JOIN pg_namespace n ON n.oid = s.relnamespace
            JOIN pg_depend d ON d.objid = s.oid
                AND d.classid = 'pg_class'::regclass
                AND d.refclassid = 'pg_class'::regclass
                AND d.deptype = 'a'
            JOIN pg_class t ON t.oid = d.refobjid
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid
            WHERE s.relkind = 'S' AND n.nspname = $1
            ORDER BY s.relname
        "#;

        pub const LIST_TABLES: &str = r#"
            SELECT c.relname::text AS name
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
            ORDER BY c.relname
        "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT a.attname::text AS name,
                   format_type(a.atttypid, a.atttypmod) AS data_type,
                   pg_get_expr(d.adbin, d.adrelid) AS default_value,
                   a.attnotnull AS not_null
            FROM pg_attribute a
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped
            ORDER BY a.attnum
        "#;

        pub const DESCRIBE_CONSTRAINTS: &str = r#"
            SELECT conname::text AS name,
                   pg_get_constraintdef(oid) AS definition
            FROM pg_constraint
            WHERE conrelid = $1::regclass
            ORDER BY contype = 'f', conname
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
            SELECT i.indexdef AS definition
            FROM pg_indexes i
            WHERE i.schemaname = $1
              AND i.tablename = $2
              AND NOT EXISTS (
                  SELECT 1 FROM pg_constraint c
                  JOIN pg_namespace n ON n.oid = c.connamespace
                  WHERE c.conname = i.indexname AND n.nspname = i.schemaname
              )
            ORDER BY i.indexname
        "#;
    }
}

mod mysql {
    use super::*;

    pub async fn dump(db: &DB) -> DbResult<Vec<String>> {
        let database = db.config().database.clone();
        let tables = db
            .query(queries::mysql::LIST_TABLES, &[Value::from(&database)])
            .await?;

        let mut statements = Vec::with_capacity(tables.len());
        for row in tables.iter() {
            let table = string_value(row.value_at(0)?, "name")?;
            debug!(db = %db.name(), table = %table, "Dumping table");

            let create = db
                .query_row(&format!("SHOW CREATE TABLE {}.{};", database, table), &[])
                .await?
                .ok_or_else(|| DbError::internal(format!("SHOW CREATE TABLE {} returned no rows", table)))?;
            let definition = string_value(create.value_at(1)?, "Create Table")?;

            let definition = strip_auto_increment(&definition);
            statements.push(format!("{};", if_not_exists(&definition, "CREATE TABLE ")));
        }
        Ok(statements)
    }
}

mod postgres {
    use super::*;

    pub async fn dump(db: &DB) -> DbResult<Vec<String>> {
        let schema = db.config().schema_search_path.clone();
        let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS {};", schema)];

        let sequences = db
            .query(queries::postgres::LIST_SEQUENCES, &[Value::from(&schema)])
            .await?;
        for row in sequences.iter() {
            let name = string_value(row.get_value("name")?, "name")?;
            let data_type = string_value(row.get_value("data_type")?, "data_type")?;
            let start = row.try_get::<i64>("start_value")?;
            let increment = row.try_get::<i64>("increment_by")?;
            statements.push(format!(
                "CREATE SEQUENCE IF NOT EXISTS {}.{} AS {} START WITH {} INCREMENT BY {};",
                schema, name, data_type, start, increment
            ));
        }

        let tables = db
            .query(queries::postgres::LIST_TABLES, &[Value::from(&schema)])
            .await?;
        for row in tables.iter() {
            let table = string_value(row.get_value("name")?, "name")?;
            debug!(db = %db.name(), table = %table, "Dumping table");
            statements.push(create_table(db, &schema, &table).await?);
            statements.extend(create_indexes(db, &schema, &table).await?);
        }

        // Ownership needs the tables, so it comes last.
        let owners = db
            .query(queries::postgres::LIST_SEQUENCE_OWNERS, &[Value::from(&schema)])
            .await?;
        for row in owners.iter() {
            statements.push(owned_by(
                &schema,
                &string_value(row.get_value("name")?, "name")?,
                &string_value(row.get_value("table_name")?, "table_name")?,
                &string_value(row.get_value("column_name")?, "column_name")?,
            ));
        }
        Ok(statements)
    }

    pub(super) fn owned_by(schema: &str, sequence: &str, table: &str, column: &str) -> String {
        format!(
            "ALTER SEQUENCE {}.{} OWNED BY {}.{}.{};",
            schema, sequence, schema, table, column
        )
    }

    async fn create_table(db: &DB, schema: &str, table: &str) -> DbResult<String> {
        let qualified = format!("{}.{}", schema, table);

        let mut lines = Vec::new();
        let columns = db
            .query(queries::postgres::DESCRIBE_COLUMNS, &[Value::from(&qualified)])
            .await?;
        for row in columns.iter() {
            let mut line = format!(
                "    {} {}",
                string_value(row.get_value("name")?, "name")?,
                string_value(row.get_value("data_type")?, "data_type")?
            );
            if let Value::String(default) = row.get_value("default_value")? {
                line.push_str(&format!(" DEFAULT {}", default));
            }
            if row.try_get::<bool>("not_null")? {
                line.push_str(" NOT NULL");
            }
            lines.push(line);
        }

        let constraints = db
            .query(queries::postgres::DESCRIBE_CONSTRAINTS, &[Value::from(&qualified)])
            .await?;
        for row in constraints.iter() {
            lines.push(format!(
                "    CONSTRAINT {} {}",
                string_value(row.get_value("name")?, "name")?,
                string_value(row.get_value("definition")?, "definition")?
            ));
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
            qualified,
            lines.join(",\n")
        ))
    }

    async fn create_indexes(db: &DB, schema: &str, table: &str) -> DbResult<Vec<String>> {
        let rows = db
            .query(
                queries::postgres::DESCRIBE_INDEXES,
                &[Value::from(schema), Value::from(table)],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let definition = string_value(row.get_value("definition")?, "definition")?;
                Ok(format!("{};", if_not_exists(&definition, "INDEX ")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_if_not_exists() {
        assert_eq!(
            if_not_exists("CREATE TABLE `users` (\n  `id` int\n)", "CREATE TABLE "),
            "CREATE TABLE IF NOT EXISTS `users` (\n  `id` int\n)"
        );
        assert_eq!(
            if_not_exists(
                "CREATE UNIQUE INDEX users_email_idx ON public.users USING btree (email)",
                "INDEX "
            ),
            "CREATE UNIQUE INDEX IF NOT EXISTS users_email_idx ON public.users USING btree (email)"
        );
    }

    #[test]
    fn test_strip_auto_increment() {
        assert_eq!(
            strip_auto_increment(") ENGINE=InnoDB AUTO_INCREMENT=42 DEFAULT CHARSET=utf8mb4"),
            ") ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
        assert_eq!(
            strip_auto_increment("`id` bigint NOT NULL AUTO_INCREMENT,"),
            "`id` bigint NOT NULL AUTO_INCREMENT,"
        );
    }

    #[test]
    fn test_sequence_owned_by() {
        assert_eq!(
            postgres::owned_by("public", "users_id_seq", "users", "id"),
            "ALTER SEQUENCE public.users_id_seq OWNED BY public.users.id;"
        );
    }

    #[test]
    fn test_string_value() {
        assert_eq!(string_value(Value::from("users"), "name").unwrap(), "users");
        assert_eq!(
            string_value(Value::Bytes(b"users".to_vec()), "name").unwrap(),
            "users"
        );
        assert!(string_value(Value::Int(1), "name").is_err());
    }
}
