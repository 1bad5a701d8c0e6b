//! Generated source files: migration skeletons and schema dumps.

use crate::db::handle::DB;
use crate::error::{DbError, DbResult};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;

impl DB {
    /// Write an empty migration to `<dir>/<db>/<timestamp>_<name>.rs`.
    ///
    /// With `tx` the generated steps run inside a transaction.
    pub fn generate_migration(&self, dir: &Path, name: &str, tx: bool) -> DbResult<PathBuf> {
        let suffix = to_snake_case(name);
        if suffix.is_empty() {
            return Err(DbError::invalid_input(format!(
                "'{}' is not a valid migration name",
                name
            )));
        }

        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let path = dir
            .join(self.name())
            .join(format!("{}_{}.rs", timestamp, suffix));
        write_file(&path, &render_migration(tx))?;

        info!(db = %self.name(), path = %path.display(), "Generated migration");
        Ok(path)
    }
}

pub(crate) fn write_file(path: &Path, contents: &str) -> DbResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbError::io(parent.display().to_string(), e))?;
    }
    std::fs::write(path, contents).map_err(|e| DbError::io(path.display().to_string(), e))
}

/// Source of a generated migration file.
pub fn render_migration(tx: bool) -> String {
    let (register, arg) = if tx {
        ("register_migration_tx", "_tx")
    } else {
        ("register_migration", "_db")
    };

    format!(
        r#"use strata::{{DB, DbResult}};

pub fn register(db: &DB) -> DbResult<()> {{
    db.{register}(
        file!(),
        |{arg}| Box::pin(async move {{ Ok(()) }}),
        |{arg}| Box::pin(async move {{ Ok(()) }}),
    )
}}
"#
    )
}

/// Source of a generated `schema.rs` holding a dumped schema.
pub fn render_schema(schema: &str) -> String {
    let hashes = "#".repeat(raw_string_hashes(schema));
    format!(
        r#"//! Generated by `strata db:schema:dump`. Do not edit.

use strata::DB;

pub const SCHEMA: &str = r{hashes}"
{schema}
"{hashes};

pub fn register(db: &DB) {{
    db.set_schema(SCHEMA);
}}
"#
    )
}

/// Smallest number of `#` that lets `text` sit inside a raw string literal.
fn raw_string_hashes(text: &str) -> usize {
    let mut needed = 1;
    while text.contains(&format!("\"{}", "#".repeat(needed))) {
        needed += 1;
    }
    needed
}

/// `CreateUsers`, `create users` and `create-users` all become `create_users`.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::db::migration::migration_version;

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("CreateUsers"), "create_users");
        assert_eq!(to_snake_case("create users"), "create_users");
        assert_eq!(to_snake_case("add-email-to-users"), "add_email_to_users");
        assert_eq!(to_snake_case("AddIndexV2"), "add_index_v2");
        assert_eq!(to_snake_case("  "), "");
    }

    #[test]
    fn test_render_migration() {
        let plain = render_migration(false);
        assert!(plain.contains("db.register_migration(\n"));
        assert!(plain.contains("|_db| Box::pin"));

        let tx = render_migration(true);
        assert!(tx.contains("db.register_migration_tx("));
        assert!(tx.contains("|_tx| Box::pin"));
    }

    #[test]
    fn test_render_schema_escapes_raw_string() {
        let out = render_schema("CREATE TABLE IF NOT EXISTS users (id int);");
        assert!(out.contains("pub const SCHEMA: &str = r#\"\nCREATE TABLE"));

        let tricky = render_schema("COMMENT 'a\"#b'");
        assert!(tricky.contains("r##\""));
        assert!(tricky.contains("\"##;"));
    }

    #[test]
    fn test_generate_migration_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = DB::new(
            "primary",
            DbConfig::from_uri("postgres://u:p@localhost/app").unwrap(),
        );

        let path = db
            .generate_migration(dir.path(), "CreateUsers", true)
            .unwrap();
        assert!(path.starts_with(dir.path().join("primary")));

        let file = path.to_str().unwrap();
        assert!(file.ends_with("_create_users.rs"));
        assert!(migration_version(file).is_ok());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("register_migration_tx"));
    }

    #[test]
    fn test_generate_migration_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = DB::new(
            "primary",
            DbConfig::from_uri("mysql://root@localhost/app").unwrap(),
        );
        assert!(db.generate_migration(dir.path(), "!!", false).is_err());
    }
}
