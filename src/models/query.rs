//! Query-related data models.

use serde::Serialize;

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Only reported by MySQL.
    pub last_insert_id: Option<u64>,
}

/// Options for a single model execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Upper bound for the whole operation, hooks included.
    pub timeout: Option<std::time::Duration>,
    /// Route the statement to a replica instead of a master.
    pub use_replica: bool,
    /// Skip `before_validate`/`validate`/`after_validate`.
    pub skip_validate: bool,
}
