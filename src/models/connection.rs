//! Connection-related data models.

use serde::{Deserialize, Serialize};

/// Supported database adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// Includes MariaDB
    MySql,
    Postgres,
}

impl Adapter {
    /// Parse an adapter from a URI scheme. `postgresql` is an alias of `postgres`.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "mysql" => Some(Self::MySql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Adapter name as used in configuration and log output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Get the display name for this adapter.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }

    /// Database used for bootstrap connections (create/drop).
    pub fn bootstrap_database(&self) -> Option<&'static str> {
        match self {
            Self::MySql => None,
            Self::Postgres => Some("postgres"),
        }
    }

    /// Whether INSERT/UPDATE can hand generated keys back with `RETURNING`.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::MySql => "?".to_string(),
            Self::Postgres => format!("${}", n),
        }
    }
}

impl std::fmt::Display for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_scheme() {
        assert_eq!(Adapter::from_scheme("mysql"), Some(Adapter::MySql));
        assert_eq!(Adapter::from_scheme("postgres"), Some(Adapter::Postgres));
        assert_eq!(Adapter::from_scheme("postgresql"), Some(Adapter::Postgres));
        assert_eq!(Adapter::from_scheme("sqlite"), None);
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(Adapter::MySql.placeholder(3), "?");
        assert_eq!(Adapter::Postgres.placeholder(3), "$3");
    }

    #[test]
    fn test_display() {
        assert_eq!(Adapter::Postgres.to_string(), "postgres");
        assert_eq!(Adapter::MySql.display_name(), "MySQL");
    }
}
