//! Error types for strata.
//!
//! Every fallible operation returns [`DbResult`]. Configuration parsing
//! collects errors instead of failing fast, and model operations wrap the
//! errors they collect in [`ModelError`] together with the affected-row count.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("adapter '{adapter}' for database '{database}' is not supported")]
    UnsupportedAdapter { database: String, adapter: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Database '{database}' is not connected")]
    NotConnected { database: String },

    #[error("invalid filename '{filename}', a valid example: 20060102150405_create_users.rs")]
    InvalidMigrationFilename { filename: String },

    #[error("Migration version {version} is already registered ({file})")]
    DuplicateMigration { version: String, file: String },

    #[error("Migration version {version} is applied but not registered")]
    MigrationNotFound { version: String },

    #[error("Schema for database '{database}' is empty, dump or register it first")]
    SchemaEmpty { database: String },

    #[error("model is missing a master database")]
    MissingMasterDb,

    #[error("model is missing a replica database")]
    MissingReplicaDb,

    #[error("model query builder is empty")]
    EmptyQuery,

    #[error("Cannot {action} a row of '{table}' without a primary key value")]
    MissingPrimaryKey { action: String, table: String },

    #[error("{association} owner cannot be nil")]
    OwnerNil { association: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to decode column '{column}': {message}")]
    Decode { column: String, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an unsupported adapter error.
    pub fn unsupported_adapter(database: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self::UnsupportedAdapter {
            database: database.into(),
            adapter: adapter.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn not_connected(database: impl Into<String>) -> Self {
        Self::NotConnected {
            database: database.into(),
        }
    }

    pub fn invalid_migration_filename(filename: impl Into<String>) -> Self {
        Self::InvalidMigrationFilename {
            filename: filename.into(),
        }
    }

    /// Create a validation error, typically returned from `Hooks::validate`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn owner_nil(association: impl Into<String>) -> Self {
        Self::OwnerNil {
            association: association.into(),
        }
    }

    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::decode(col, "column not found"),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => DbError::decode(index, source.to_string()),
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors collected by a model operation.
///
/// Hooks run once per element, so a batch operation can fail in several
/// places at once. `rows_affected` is non-zero when the SQL already ran and
/// only an after-hook failed.
#[derive(Error, Debug)]
#[error("{}", summarize(.errors))]
pub struct ModelError {
    pub rows_affected: u64,
    pub errors: Vec<DbError>,
}

impl ModelError {
    pub fn new(rows_affected: u64, errors: Vec<DbError>) -> Self {
        Self {
            rows_affected,
            errors,
        }
    }

    /// The first collected error, if any.
    pub fn first(&self) -> Option<&DbError> {
        self.errors.first()
    }
}

impl From<DbError> for ModelError {
    fn from(err: DbError) -> Self {
        Self::new(0, vec![err])
    }
}

fn summarize(errors: &[DbError]) -> String {
    match errors {
        [] => "model operation failed".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(DbError::MissingMasterDb.suggestion(), None);
    }

    #[test]
    fn test_unsupported_adapter_message() {
        let err = DbError::unsupported_adapter("primary", "sqlite");
        assert_eq!(
            err.to_string(),
            "adapter 'sqlite' for database 'primary' is not supported"
        );
    }

    #[test]
    fn test_invalid_migration_filename_message() {
        let err = DbError::invalid_migration_filename("create_users.rs");
        assert_eq!(
            err.to_string(),
            "invalid filename 'create_users.rs', a valid example: 20060102150405_create_users.rs"
        );
    }

    #[test]
    fn test_owner_nil_names_association() {
        let err = DbError::owner_nil("user");
        assert_eq!(err.to_string(), "user owner cannot be nil");
    }

    #[test]
    fn test_model_error_summary() {
        let single = ModelError::from(DbError::EmptyQuery);
        assert_eq!(single.to_string(), "model query builder is empty");
        assert_eq!(single.rows_affected, 0);

        let many = ModelError::new(
            3,
            vec![DbError::validation("a"), DbError::validation("b")],
        );
        assert_eq!(many.to_string(), "Validation failed: a (and 1 more)");
        assert!(matches!(many.first(), Some(DbError::Validation { .. })));
    }
}
