//! Mapping metadata for entity types.

use crate::entity::Entity;
use chrono::{Local, NaiveDateTime, Utc};

/// How `created_at`, `updated_at` and `deleted_at` values are stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timezone {
    #[default]
    Utc,
    Local,
}

impl Timezone {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Timezone::Utc => Utc::now().naive_utc(),
            Timezone::Local => Local::now().naive_local(),
        }
    }
}

/// A mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Filled by the database; never written by the mapper.
    pub auto_increment: bool,
    /// Present on the entity but not in the table.
    pub ignored: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_increment: false,
            ignored: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }
}

/// What happens to the owner when an owned row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dependent {
    #[default]
    None,
    /// Delete the owner through the mapper, running its hooks.
    Delete,
    /// Delete the owner row with a single statement.
    DeleteWithoutCallbacks,
}

/// A belongs-to association: this entity's `foreign_key` column references
/// the owner's `primary_key` column.
#[derive(Clone)]
pub struct BelongsTo {
    pub name: String,
    pub foreign_key: String,
    pub primary_key: String,
    pub optional: bool,
    pub touch: bool,
    pub dependent: Dependent,
    new_owner: fn() -> Box<dyn Entity>,
}

impl std::fmt::Debug for BelongsTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BelongsTo")
            .field("name", &self.name)
            .field("foreign_key", &self.foreign_key)
            .field("primary_key", &self.primary_key)
            .field("optional", &self.optional)
            .field("touch", &self.touch)
            .field("dependent", &self.dependent)
            .finish_non_exhaustive()
    }
}

fn boxed_default<O: Entity + Default + 'static>() -> Box<dyn Entity> {
    Box::new(O::default())
}

impl BelongsTo {
    /// Association `name` to owner type `O`, with foreign key `<name>_id`.
    pub fn new<O: Entity + Default + 'static>(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            foreign_key: format!("{}_id", name),
            name,
            primary_key: "id".to_string(),
            optional: false,
            touch: false,
            dependent: Dependent::None,
            new_owner: boxed_default::<O>,
        }
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = column.into();
        self
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn touch(mut self) -> Self {
        self.touch = true;
        self
    }

    pub fn dependent(mut self, dependent: Dependent) -> Self {
        self.dependent = dependent;
        self
    }

    /// A fresh owner value.
    pub fn new_owner(&self) -> Box<dyn Entity> {
        (self.new_owner)()
    }

    pub fn owner_schema(&self) -> &'static Schema {
        self.new_owner().schema()
    }
}

/// Table-level mapping for an entity type. Build it once, typically in a
/// `static LazyLock<Schema>`.
#[derive(Debug, Clone)]
pub struct Schema {
    table: String,
    primary_keys: Vec<String>,
    columns: Vec<Column>,
    masters: Vec<String>,
    replicas: Vec<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    deleted_at: Option<String>,
    timezone: Timezone,
    belongs_to: Vec<BelongsTo>,
}

impl Schema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_keys: vec!["id".to_string()],
            columns: Vec::new(),
            masters: vec!["primary".to_string()],
            replicas: Vec::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            timezone: Timezone::Utc,
            belongs_to: Vec::new(),
        }
    }

    /// Replace the primary key columns. An empty list disables key-based
    /// filtering.
    pub fn primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn column(mut self, column: impl Into<Column>) -> Self {
        self.columns.push(column.into());
        self
    }

    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns
            .extend(names.into_iter().map(|n| Column::new(n)));
        self
    }

    pub fn masters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.masters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn replicas<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replicas = names.into_iter().map(Into::into).collect();
        self
    }

    /// Stamped on create. Added as a column if not declared yet.
    pub fn created_at(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.ensure_column(&column);
        self.created_at = Some(column);
        self
    }

    /// Stamped on update. Added as a column if not declared yet.
    pub fn updated_at(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.ensure_column(&column);
        self.updated_at = Some(column);
        self
    }

    /// Enables soft delete: deletes stamp this column and reads skip rows
    /// where it is set.
    pub fn soft_delete(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.ensure_column(&column);
        self.deleted_at = Some(column);
        self
    }

    pub fn timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn belongs_to(mut self, association: BelongsTo) -> Self {
        self.belongs_to.push(association);
        self
    }

    fn ensure_column(&mut self, name: &str) {
        if !self.columns.iter().any(|c| c.name == name) {
            self.columns.push(Column::new(name));
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn all_columns(&self) -> &[Column] {
        &self.columns
    }

    /// Columns that exist in the table.
    pub fn mapped_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| !c.ignored)
            .map(|c| c.name.as_str())
    }

    /// Columns written by INSERT and UPDATE.
    pub fn writable_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| !c.ignored && !c.auto_increment)
            .map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.mapped_columns().any(|c| c == name)
    }

    pub fn auto_increment_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.auto_increment && !c.ignored)
            .map(|c| c.name.as_str())
    }

    pub fn master_names(&self) -> &[String] {
        &self.masters
    }

    pub fn replica_names(&self) -> &[String] {
        &self.replicas
    }

    pub fn created_at_column(&self) -> Option<&str> {
        self.created_at.as_deref()
    }

    pub fn updated_at_column(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }

    pub fn soft_delete_column(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }

    pub fn tz(&self) -> Timezone {
        self.timezone
    }

    pub fn associations(&self) -> &[BelongsTo] {
        &self.belongs_to
    }
}

impl From<&str> for Column {
    fn from(name: &str) -> Self {
        Column::new(name)
    }
}

impl From<String> for Column {
    fn from(name: String) -> Self {
        Column::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_defaults() {
        let schema = Schema::new("users");
        assert_eq!(schema.table(), "users");
        assert_eq!(schema.primary_key_columns(), ["id"]);
        assert_eq!(schema.master_names(), ["primary"]);
        assert!(schema.replica_names().is_empty());
        assert_eq!(schema.tz(), Timezone::Utc);
        assert!(schema.soft_delete_column().is_none());
    }

    #[test]
    fn test_column_sets() {
        let schema = Schema::new("users")
            .column(Column::new("id").auto_increment())
            .columns(["name", "email"])
            .column(Column::new("password").ignored())
            .created_at("created_at")
            .soft_delete("deleted_at");

        let mapped: Vec<&str> = schema.mapped_columns().collect();
        assert_eq!(mapped, ["id", "name", "email", "created_at", "deleted_at"]);

        let writable: Vec<&str> = schema.writable_columns().collect();
        assert_eq!(writable, ["name", "email", "created_at", "deleted_at"]);

        assert_eq!(schema.auto_increment_column(), Some("id"));
        assert!(!schema.has_column("password"));
    }

    #[test]
    fn test_timestamp_column_not_duplicated() {
        let schema = Schema::new("users")
            .columns(["updated_at"])
            .updated_at("updated_at");
        assert_eq!(schema.mapped_columns().count(), 1);
    }
}
