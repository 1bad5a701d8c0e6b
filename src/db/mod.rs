//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management
//! - Statement and transaction wrappers with query logging
//! - The per-database handle and the engine that owns every handle
//! - Migrations, schema dumps and generated files
//! - Type mappings

pub mod artifact;
pub mod engine;
pub mod handle;
pub mod migration;
pub mod params;
pub mod pool;
pub mod row;
pub mod schema;
pub mod stmt;
pub mod tx;
pub mod types;

pub use engine::Engine;
pub use handle::DB;
pub use migration::{Migration, migration_version};
pub use pool::DbPool;
pub use row::{Row, Rows};
pub use stmt::{Stmt, format_params, format_query};
pub use tx::Tx;
