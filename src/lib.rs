//! strata
//!
//! Named MySQL and PostgreSQL databases configured from the environment,
//! schema migrations written in Rust, schema dumps, seeds and a small entity
//! mapper with lifecycle hooks and master/replica routing.

pub mod cli;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod models;

pub use config::{Config, DbConfig};
pub use db::{DB, Engine, Row, Rows, Stmt, Tx};
pub use entity::{BelongsTo, Column, Dependent, Entity, Hooks, Model, Schema, Timezone};
pub use error::{DbError, DbResult, ModelError};
pub use models::{Adapter, ExecOptions, ExecResult, Value};
