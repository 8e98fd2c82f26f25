/// Error Module
///
/// This module defines the error type shared by every layer of dblayer.
/// Driver failures are classified once, at the lowest layer, into one of four
/// categories; everything above the driver only ever sees those categories.
use std::fmt;
use thiserror::Error;

/// The four failure categories every database error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed SQL, constraint violation, quoting failure. Never retried.
    Query,
    /// Local resource or configuration fault. Marks the connection dead.
    System,
    /// Remote connectivity fault. Triggers the reconnection loop.
    Network,
    /// The current transaction must be discarded and replayed from its start.
    Rollback,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Query => "query",
            ErrorCategory::System => "system",
            ErrorCategory::Network => "network",
            ErrorCategory::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Error type for every dblayer operation.
///
/// The first four variants correspond one-to-one with [`ErrorCategory`]. The
/// remaining variants are raised by the layers above the driver and still
/// report one of the four categories through [`DbError::category`].
#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed SQL, constraint violations and values that cannot be quoted
    #[error("Query error: {message}")]
    Query {
        message: String,
        code: Option<String>,
    },

    /// Local resource or configuration faults
    #[error("System error: {message}")]
    System {
        message: String,
        code: Option<String>,
    },

    /// Remote connectivity faults
    #[error("Network error: {message}")]
    Network {
        message: String,
        code: Option<String>,
    },

    /// The transaction was lost and has to be retried from the start
    #[error("Rollback required: {message}")]
    Rollback {
        message: String,
        code: Option<String>,
    },

    /// Connection URI or configuration file problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller's deadline passed or its cancel token fired
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Module dependency graph contains a cycle
    #[error("Dependency cycle between modules: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A module id was requested that nobody registered
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// A version step of a module failed; the whole run is aborted
    #[error("Migration of {module} from version {from} to {to} failed: {source}")]
    Migration {
        module: String,
        from: u32,
        to: u32,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Creates a query error without a native code.
    pub fn query(message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a system error without a native code.
    pub fn system(message: impl Into<String>) -> Self {
        DbError::System {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a network error without a native code.
    pub fn network(message: impl Into<String>) -> Self {
        DbError::Network {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a rollback error without a native code.
    pub fn rollback(message: impl Into<String>) -> Self {
        DbError::Rollback {
            message: message.into(),
            code: None,
        }
    }

    /// Builds the error variant for `category`, keeping the native code.
    pub fn categorized(
        category: ErrorCategory,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        let message = message.into();
        match category {
            ErrorCategory::Query => DbError::Query { message, code },
            ErrorCategory::System => DbError::System { message, code },
            ErrorCategory::Network => DbError::Network { message, code },
            ErrorCategory::Rollback => DbError::Rollback { message, code },
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DbError::Query { .. } => ErrorCategory::Query,
            DbError::System { .. } => ErrorCategory::System,
            DbError::Network { .. } => ErrorCategory::Network,
            DbError::Rollback { .. } => ErrorCategory::Rollback,
            DbError::Config(_)
            | DbError::Cancelled(_)
            | DbError::DependencyCycle(_)
            | DbError::UnknownModule(_) => ErrorCategory::System,
            DbError::Migration { source, .. } => source.category(),
        }
    }

    /// Returns the backend-native error code, if the driver supplied one.
    pub fn native_code(&self) -> Option<&str> {
        match self {
            DbError::Query { code, .. }
            | DbError::System { code, .. }
            | DbError::Network { code, .. }
            | DbError::Rollback { code, .. } => code.as_deref(),
            DbError::Migration { source, .. } => source.native_code(),
            _ => None,
        }
    }

    /// Only rollback errors may be retried by library callers.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Rollback
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::system(err.to_string())
    }
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

/// Type alias for Result to use DbError as the error type.
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let query_err = DbError::query("Syntax error");
        assert!(query_err.to_string().contains("Query error"));

        let cycle = DbError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(cycle.to_string(), "Dependency cycle between modules: a -> b -> a");

        let migration = DbError::Migration {
            module: "com.example.widgets".to_string(),
            from: 1,
            to: 2,
            source: Box::new(DbError::query("duplicate column")),
        };
        let text = migration.to_string();
        assert!(text.contains("com.example.widgets"));
        assert!(text.contains("from version 1 to 2"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(DbError::network("gone").category(), ErrorCategory::Network);
        assert_eq!(DbError::Config("bad".into()).category(), ErrorCategory::System);
        assert_eq!(DbError::Cancelled("deadline".into()).category(), ErrorCategory::System);

        let wrapped = DbError::Migration {
            module: "m".to_string(),
            from: 0,
            to: 1,
            source: Box::new(DbError::rollback("deadlock")),
        };
        assert_eq!(wrapped.category(), ErrorCategory::Rollback);
        assert!(wrapped.is_retryable());
        assert!(!DbError::query("x").is_retryable());
    }

    #[test]
    fn test_categorized_keeps_code() {
        let err = DbError::categorized(ErrorCategory::Rollback, "deadlock", Some("1213".into()));
        match &err {
            DbError::Rollback { code, .. } => assert_eq!(code.as_deref(), Some("1213")),
            _ => panic!("Expected Rollback error"),
        }
        assert_eq!(err.native_code(), Some("1213"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let db_err: DbError = io_err.into();
        match db_err {
            DbError::System { .. } => {}
            _ => panic!("Expected System error"),
        }

        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let db_err: DbError = toml_err.into();
        match db_err {
            DbError::Config(_) => {}
            _ => panic!("Expected Config error"),
        }
    }
}
