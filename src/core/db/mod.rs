/// Database Module
///
/// This module provides the database access layer, organized into focused
/// submodules.
///
/// ## Architecture
///
/// - **Error taxonomy** (`taxonomy.rs`): native error codes to error categories
/// - **Backends** (`backend.rs`, `sqlite.rs`): dialects, the driver traits and the driver registry
/// - **Connection management** (`params.rs`, `connection.rs`): URI parsing, connect/reconnect state machine
/// - **Query execution** (`query.rs`): templates, quoting, row cursors
/// - **Transactions** (`transaction.rs`): depth tracking and the `perform` retry combinator
/// - **Schema catalog** (`schema.rs`): table specs, introspection and DDL
///
/// ## Error Handling
///
/// All database operations return [`DbError`](crate::core::DbError); driver
/// codes are classified once in `taxonomy.rs` and never seen above it.
pub mod backend;
pub mod cancel;
pub mod connection;
pub mod params;
pub mod query;
pub mod schema;
pub mod sqlite;
pub mod taxonomy;
pub mod transaction;

pub use backend::{
    BackendKind, Connector, Driver, DriverRegistry, NativeError, NativeResult, RowSet, RowStream,
};
pub use cancel::{CancelToken, Deadline};
pub use connection::{ConnectionHandle, ConnectionRegistry, ConnectionState, SharedHandle};
pub use params::{ConnectionContext, ConnectionOptions, ConnectionParams};
pub use query::{quote, Cursor, Query, Row, TableNames, Value};
pub use schema::{
    ColumnDefault, ColumnFlags, ColumnSpec, ColumnType, CreationMode, IndexKind, IndexSpec,
    SchemaCatalog, TableSpec,
};
pub use sqlite::SqliteConnector;
pub use transaction::{Outcome, TransactionState};
