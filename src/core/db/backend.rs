/// Backend Module
///
/// This module describes the database engines dblayer knows how to talk to,
/// the traits a native driver has to implement, and the registry that maps
/// connection URI schemes to driver factories.
///
/// ## Architecture
///
/// - [`BackendKind`] carries everything that differs per SQL dialect:
///   identifier and literal quoting, transaction statements, savepoint support.
///   Column DDL rendering lives next to the column types in `schema.rs`.
/// - [`Driver`] is one live native connection. It only executes SQL text and
///   reports failures as [`NativeError`]s; classification happens in the
///   connection layer through the taxonomy table.
/// - [`Connector`] opens drivers, and [`DriverRegistry`] indexes connectors by
///   URI scheme.
use crate::core::db::params::ConnectionParams;
use crate::core::db::query::Value;
use crate::core::db::sqlite::SqliteConnector;
use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The SQL dialects dblayer can render for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Sqlite,
    Mysql,
    Postgres,
}

impl BackendKind {
    /// Maps a connection URI scheme onto a dialect.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(BackendKind::Sqlite),
            "mysql" | "mysqli" | "mariadb" => Some(BackendKind::Mysql),
            "pgsql" | "postgres" | "postgresql" => Some(BackendKind::Postgres),
            _ => None,
        }
    }

    /// Human readable name
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Mysql => "mysql",
            BackendKind::Postgres => "postgres",
        }
    }

    /// Whether nested `begin()` calls map onto real savepoints.
    ///
    /// MySQL nesting is kept flat: nested levels are purely logical and only
    /// the outermost level talks to the server.
    pub fn supports_savepoints(&self) -> bool {
        !matches!(self, BackendKind::Mysql)
    }

    /// Statement that opens a transaction.
    ///
    /// SQLite takes the write lock up front so that reads inside the
    /// transaction cannot go stale before its first write.
    pub fn begin_sql(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "BEGIN IMMEDIATE",
            BackendKind::Mysql => "START TRANSACTION",
            BackendKind::Postgres => "BEGIN",
        }
    }

    /// Quotes a table, column or index name.
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self {
            BackendKind::Mysql => format!("`{}`", ident.replace('`', "``")),
            BackendKind::Sqlite | BackendKind::Postgres => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }

    /// Escapes `text` as a string literal in this dialect.
    pub fn quote_string(&self, text: &str) -> String {
        match self {
            BackendKind::Mysql => {
                let mut out = String::with_capacity(text.len() + 2);
                out.push('\'');
                for ch in text.chars() {
                    match ch {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\0' => out.push_str("\\0"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\u{1a}' => out.push_str("\\Z"),
                        _ => out.push(ch),
                    }
                }
                out.push('\'');
                out
            }
            BackendKind::Sqlite | BackendKind::Postgres => {
                format!("'{}'", text.replace('\'', "''"))
            }
        }
    }

    /// Renders binary data as a literal.
    pub fn quote_blob(&self, bytes: &[u8]) -> String {
        let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        match self {
            BackendKind::Postgres => format!("'\\x{}'::bytea", hex),
            BackendKind::Sqlite | BackendKind::Mysql => format!("X'{}'", hex),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure exactly as the native driver reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeError {
    /// Native error code, as text (`"1213"`, `"40P01"`, `"5"`)
    pub code: String,
    pub message: String,
}

impl NativeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        NativeError {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for NativeError {}

/// Result type used at the driver boundary, before classification.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Rows of one statement, produced as they are asked for.
///
/// A stream owns whatever it needs to keep stepping; it never borrows the
/// driver that opened it. Drivers that cannot keep a statement open while
/// running another one end the earlier stream instead.
pub trait RowStream: Send {
    /// Column names in select-list order
    fn columns(&self) -> &[String];

    /// Steps to the next row; `None` once the statement is exhausted.
    fn next_row(&mut self) -> NativeResult<Option<Vec<Value>>>;
}

/// Rows already held in memory, e.g. scripted or fully fetched results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names in select-list order
    pub columns: Vec<String>,
    /// One vector of values per row, aligned with `columns`
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Streams the rows in order.
    pub fn into_stream(self) -> Box<dyn RowStream> {
        Box::new(BufferedRows {
            columns: self.columns,
            rows: self.rows.into_iter(),
        })
    }
}

#[derive(Debug)]
struct BufferedRows {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl RowStream for BufferedRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> NativeResult<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }
}

/// One live native connection.
pub trait Driver: Send {
    /// Runs a statement that does not produce rows; returns affected rows.
    fn execute(&mut self, sql: &str) -> NativeResult<u64>;

    /// Starts a statement and returns a stream over its rows.
    ///
    /// Failures to prepare or start the statement are reported here; later
    /// failures come back from [`RowStream::next_row`].
    fn query(&mut self, sql: &str) -> NativeResult<Box<dyn RowStream>>;

    /// Id generated by the most recent insert, if the backend tracks one.
    fn last_insert_id(&mut self) -> Option<i64>;
}

/// Factory for native connections of one backend kind.
pub trait Connector: Send + Sync {
    /// Dialect the drivers produced by this connector speak.
    fn kind(&self) -> BackendKind;

    /// Opens a new native connection.
    fn connect(&self, params: &ConnectionParams) -> NativeResult<Box<dyn Driver>>;
}

/// Registry of connectors indexed by URI scheme.
///
/// Populated once at startup and then only read.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl DriverRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        DriverRegistry::default()
    }

    /// Creates a registry with the built-in SQLite driver registered.
    pub fn with_defaults() -> Self {
        let mut registry = DriverRegistry::new();
        let sqlite: Arc<dyn Connector> = Arc::new(SqliteConnector::default());
        registry.register("sqlite", Arc::clone(&sqlite));
        registry.register("sqlite3", sqlite);
        registry
    }

    /// Registers `connector` under `scheme`, replacing any earlier entry.
    pub fn register(&mut self, scheme: &str, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(scheme.to_ascii_lowercase(), connector);
    }

    /// Finds the connector for `scheme`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` when nothing is registered for the scheme.
    pub fn connector(&self, scheme: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                DbError::Config(format!("no driver registered for scheme '{}'", scheme))
            })
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
