/// Core Module for dblayer
///
/// Connection handling, query execution, transactions and schema catalog
/// live under [`db`]; the shared error type under [`error`].
pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{DbError, ErrorCategory, Result};
