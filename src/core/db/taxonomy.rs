/// Error Taxonomy Module
///
/// Classifies backend-native error codes into the four [`ErrorCategory`]
/// values. The table is plain data keyed by (backend, native code); adding a
/// backend means adding rows, not code paths. Codes that are not listed are
/// treated as query errors.
use crate::core::db::backend::{BackendKind, NativeError};
use crate::core::error::{DbError, ErrorCategory};
use once_cell::sync::Lazy;
use std::collections::HashMap;

use BackendKind::{Mysql, Postgres, Sqlite};
use ErrorCategory::{Network, Rollback, System};

/// (backend, native code, category) rows.
///
/// SQLite codes are primary result codes, MySQL codes are server/client error
/// numbers and PostgreSQL codes are SQLSTATE values.
pub const ERROR_CODES: &[(BackendKind, &str, ErrorCategory)] = &[
    // SQLite
    (Sqlite, "3", System),  // SQLITE_PERM
    (Sqlite, "5", Rollback), // SQLITE_BUSY
    (Sqlite, "6", Rollback), // SQLITE_LOCKED
    (Sqlite, "7", System),  // SQLITE_NOMEM
    (Sqlite, "8", System),  // SQLITE_READONLY
    (Sqlite, "10", System), // SQLITE_IOERR
    (Sqlite, "11", System), // SQLITE_CORRUPT
    (Sqlite, "13", System), // SQLITE_FULL
    (Sqlite, "14", System), // SQLITE_CANTOPEN
    (Sqlite, "21", System), // SQLITE_MISUSE
    (Sqlite, "23", System), // SQLITE_AUTH
    (Sqlite, "26", System), // SQLITE_NOTADB
    // MySQL / MariaDB
    (Mysql, "1205", Rollback), // lock wait timeout
    (Mysql, "1213", Rollback), // deadlock
    (Mysql, "1021", System),   // disk full
    (Mysql, "1030", System),   // storage engine error
    (Mysql, "1044", System),   // database access denied
    (Mysql, "1045", System),   // access denied
    (Mysql, "1049", System),   // unknown database
    (Mysql, "2001", System),   // cannot create unix socket
    (Mysql, "1040", Network),  // too many connections
    (Mysql, "1053", Network),  // server shutdown in progress
    (Mysql, "1927", Network),  // connection killed
    (Mysql, "2002", Network),  // cannot connect through socket
    (Mysql, "2003", Network),  // cannot connect to host
    (Mysql, "2005", Network),  // unknown host
    (Mysql, "2006", Network),  // server has gone away
    (Mysql, "2013", Network),  // lost connection during query
    (Mysql, "2026", Network),  // SSL connection error
    (Mysql, "2055", Network),  // lost connection at system error
    // PostgreSQL
    (Postgres, "40001", Rollback), // serialization_failure
    (Postgres, "40P01", Rollback), // deadlock_detected
    (Postgres, "55P03", Rollback), // lock_not_available
    (Postgres, "28000", System),   // invalid_authorization_specification
    (Postgres, "28P01", System),   // invalid_password
    (Postgres, "3D000", System),   // invalid_catalog_name
    (Postgres, "53100", System),   // disk_full
    (Postgres, "53200", System),   // out_of_memory
    (Postgres, "58030", System),   // io_error
    (Postgres, "08000", Network),  // connection_exception
    (Postgres, "08001", Network),  // sqlclient_unable_to_establish_sqlconnection
    (Postgres, "08003", Network),  // connection_does_not_exist
    (Postgres, "08004", Network),  // sqlserver_rejected_establishment_of_sqlconnection
    (Postgres, "08006", Network),  // connection_failure
    (Postgres, "53300", Network),  // too_many_connections
    (Postgres, "57P01", Network),  // admin_shutdown
    (Postgres, "57P02", Network),  // crash_shutdown
    (Postgres, "57P03", Network),  // cannot_connect_now
];

/// Unique-key violations. SQLite reports every constraint failure as
/// SQLITE_CONSTRAINT.
pub const UNIQUE_VIOLATIONS: &[(BackendKind, &str)] = &[
    (Sqlite, "19"),
    (Mysql, "1062"),    // duplicate entry
    (Postgres, "23505"), // unique_violation
];

static TABLE: Lazy<HashMap<BackendKind, HashMap<&'static str, ErrorCategory>>> = Lazy::new(|| {
    let mut table: HashMap<BackendKind, HashMap<&'static str, ErrorCategory>> = HashMap::new();
    for (kind, code, category) in ERROR_CODES {
        table.entry(*kind).or_default().insert(*code, *category);
    }
    table
});

/// Looks up the category for a native code on the given backend.
pub fn classify(kind: BackendKind, code: &str) -> ErrorCategory {
    TABLE
        .get(&kind)
        .and_then(|codes| codes.get(code))
        .copied()
        .unwrap_or(ErrorCategory::Query)
}

/// Whether `code` reports a duplicate key on the given backend.
pub fn is_unique_violation(kind: BackendKind, code: &str) -> bool {
    UNIQUE_VIOLATIONS.iter().any(|(k, c)| *k == kind && *c == code)
}

/// Converts a raw driver failure into a categorized [`DbError`].
pub fn classify_error(kind: BackendKind, err: NativeError) -> DbError {
    let category = classify(kind, &err.code);
    DbError::categorized(
        category,
        format!("[{} {}] {}", kind, err.code, err.message),
        Some(err.code),
    )
}
