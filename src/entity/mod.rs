//! Entity mapping.
//!
//! An entity is a Rust value mapped onto one table row. Types opt in by
//! implementing [`Entity`] (column access plus a static [`Schema`]) and
//! [`Hooks`] (lifecycle callbacks, all optional). [`Model`] then builds and
//! runs the statements, routes them to master or replica databases and
//! drives the hooks.

pub mod hooks;
pub mod model;
pub mod schema;
pub mod sql;

pub use hooks::{Action, Hooks};
pub use model::Model;
pub use schema::{BelongsTo, Column, Dependent, Schema, Timezone};
pub use sql::Statement;

use crate::error::DbResult;
use crate::models::Value;

/// A value mapped onto a table row.
pub trait Entity: Hooks + Send + Sync {
    fn schema(&self) -> &'static Schema;

    /// Current value of `column`. Unknown columns read as NULL.
    fn get(&self, column: &str) -> Value;

    /// Store a decoded value. Unknown columns should be ignored.
    fn set(&mut self, column: &str, value: Value) -> DbResult<()>;

    /// The loaded owner for a belongs-to association, if any.
    fn owner_mut(&mut self, _association: &str) -> Option<&mut dyn Entity> {
        None
    }
}

/// Primary key columns paired with their current values.
pub(crate) fn key_values(item: &dyn Entity) -> Vec<(String, Value)> {
    item.schema()
        .primary_key_columns()
        .iter()
        .map(|column| (column.clone(), item.get(column)))
        .collect()
}
