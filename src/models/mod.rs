//! Data models shared across strata.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod migration;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use connection::Adapter;
pub use migration::{MigrationState, MigrationStatus};
pub use query::{ExecOptions, ExecResult};
pub use value::Value;
