/// SQLite Driver Module
///
/// The built-in native driver, backed by rusqlite. Other backends plug in
/// through the same [`Connector`]/[`Driver`] traits.
///
/// Each connection lives on its own thread so that a statement can stay open
/// while the caller pulls rows from it. The driver talks to that thread over
/// channels; rows travel through a rendezvous channel, so the statement is
/// stepped only when the next row is asked for.
use crate::core::db::backend::{BackendKind, Connector, Driver, NativeError, NativeResult, RowStream};
use crate::core::db::params::{ConnectionContext, ConnectionOptions, ConnectionParams};
use crate::core::db::query::Value;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// SQLITE_ERROR, used when rusqlite fails without an engine result code
const GENERIC_ERROR: &str = "1";
/// SQLITE_NOMEM
const NOMEM: &str = "7";
/// SQLITE_MISUSE
const MISUSE: &str = "21";

type RowResult = NativeResult<Vec<Value>>;

/// Receiving end of the rows of the statement currently streaming. The
/// driver empties the slot to end that stream before it sends anything else.
type RowSlot = Arc<Mutex<Option<Receiver<RowResult>>>>;

/// Work sent to a connection thread.
enum Command {
    Execute {
        sql: String,
        reply: Sender<NativeResult<u64>>,
    },
    Query {
        sql: String,
        /// Column names, or the failure to start the statement
        reply: Sender<NativeResult<Vec<String>>>,
        rows: SyncSender<RowResult>,
    },
    LastInsertId {
        reply: Sender<i64>,
    },
}

/// Opens rusqlite connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn connect(&self, params: &ConnectionParams) -> NativeResult<Box<dyn Driver>> {
        if params.database.is_empty() {
            return Err(NativeError::new(MISUSE, "sqlite URI does not name a database file"));
        }
        let busy_timeout = ConnectionOptions::resolve(params, ConnectionContext::default())
            .map(|o| o.busy_timeout)
            .map_err(|e| NativeError::new(MISUSE, e.to_string()))?;

        debug!("Opening sqlite database {}", params.database);
        let conn = Connection::open(&params.database).map_err(native_error)?;
        conn.busy_timeout(busy_timeout).map_err(native_error)?;

        // Initialize connection with common pragmas
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(native_error)?;
        let journal = if params.database == ":memory:" { "MEMORY" } else { "WAL" };
        conn.pragma_update_and_check(None, "journal_mode", journal, |row| row.get::<_, String>(0))
            .map_err(native_error)?;

        let (commands, inbox) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("dblayer-sqlite".to_string())
            .spawn(move || serve(conn, inbox))
            .map_err(|e| NativeError::new(NOMEM, format!("failed to spawn sqlite connection thread: {}", e)))?;

        Ok(Box::new(SqliteDriver {
            commands: Some(commands),
            worker: Some(worker),
            open_rows: None,
        }))
    }
}

/// One rusqlite connection, owned by its connection thread.
///
/// Only one statement streams at a time: starting another statement ends
/// the rows of the previous query.
#[derive(Debug)]
pub struct SqliteDriver {
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    open_rows: Option<RowSlot>,
}

impl SqliteDriver {
    fn close_rows(&mut self) {
        if let Some(slot) = self.open_rows.take() {
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }

    fn send(&mut self, command: Command) -> NativeResult<()> {
        self.close_rows();
        self.commands
            .as_ref()
            .ok_or_else(thread_gone)?
            .send(command)
            .map_err(|_| thread_gone())
    }
}

impl Driver for SqliteDriver {
    fn execute(&mut self, sql: &str) -> NativeResult<u64> {
        let (reply, answer) = mpsc::channel();
        self.send(Command::Execute {
            sql: sql.to_string(),
            reply,
        })?;
        answer.recv().map_err(|_| thread_gone())?
    }

    fn query(&mut self, sql: &str) -> NativeResult<Box<dyn RowStream>> {
        let (reply, answer) = mpsc::channel();
        let (rows, inbox) = mpsc::sync_channel(0);
        self.send(Command::Query {
            sql: sql.to_string(),
            reply,
            rows,
        })?;
        let columns = answer.recv().map_err(|_| thread_gone())??;

        let slot: RowSlot = Arc::new(Mutex::new(Some(inbox)));
        self.open_rows = Some(Arc::clone(&slot));
        Ok(Box::new(SqliteRows {
            columns,
            slot,
            done: false,
        }))
    }

    fn last_insert_id(&mut self) -> Option<i64> {
        let (reply, answer) = mpsc::channel();
        self.send(Command::LastInsertId { reply }).ok()?;
        answer.recv().ok()
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        self.close_rows();
        // closing the command channel stops the thread
        self.commands = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!("sqlite connection thread panicked");
            }
        }
    }
}

/// Rows of one SQLite statement, stepped as they are fetched.
struct SqliteRows {
    columns: Vec<String>,
    slot: RowSlot,
    done: bool,
}

impl RowStream for SqliteRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> NativeResult<Option<Vec<Value>>> {
        if self.done {
            return Ok(None);
        }
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = slot.as_ref() else {
            self.done = true;
            return Err(NativeError::new(
                GENERIC_ERROR,
                "cursor was closed by a later statement on the same connection",
            ));
        };
        match rows.recv() {
            Ok(Ok(values)) => Ok(Some(values)),
            Ok(Err(e)) => {
                self.done = true;
                Err(e)
            }
            Err(_) => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

impl Drop for SqliteRows {
    fn drop(&mut self) {
        // lets the connection thread finalize the statement right away
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn thread_gone() -> NativeError {
    NativeError::new(MISUSE, "sqlite connection thread has stopped")
}

/// Connection thread main loop; ends when the driver is dropped.
fn serve(conn: Connection, inbox: Receiver<Command>) {
    for command in inbox {
        match command {
            Command::Execute { sql, reply } => {
                let _ = reply.send(execute(&conn, &sql));
            }
            Command::Query { sql, reply, rows } => stream_rows(&conn, &sql, reply, rows),
            Command::LastInsertId { reply } => {
                let _ = reply.send(conn.last_insert_rowid());
            }
        }
    }
}

/// Runs `sql` exactly once, stepping past any rows it produces.
fn execute(conn: &Connection, sql: &str) -> NativeResult<u64> {
    let mut stmt = conn.prepare(sql).map_err(native_error)?;
    let readonly = stmt.readonly();
    let mut rows = stmt.query([]).map_err(native_error)?;
    while rows.next().map_err(native_error)?.is_some() {}
    // sqlite3_changes() still holds the count of the last write
    Ok(if readonly { 0 } else { conn.changes() as u64 })
}

/// Streams the rows of `sql` into `out`, one step per row taken.
fn stream_rows(
    conn: &Connection,
    sql: &str,
    reply: Sender<NativeResult<Vec<String>>>,
    out: SyncSender<RowResult>,
) {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = reply.send(Err(native_error(e)));
            return;
        }
    };
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = reply.send(Err(native_error(e)));
            return;
        }
    };

    // The first step runs the statement, so its failure is the query's failure
    let mut pending = match read_row(rows.next(), width) {
        Ok(first) => first,
        Err(e) => {
            let _ = reply.send(Err(e));
            return;
        }
    };
    if reply.send(Ok(columns)).is_err() {
        return;
    }

    while let Some(values) = pending {
        // fails once the cursor is dropped or superseded
        if out.send(Ok(values)).is_err() {
            return;
        }
        pending = match read_row(rows.next(), width) {
            Ok(next) => next,
            Err(e) => {
                let _ = out.send(Err(e));
                return;
            }
        };
    }
}

fn read_row(step: rusqlite::Result<Option<&rusqlite::Row<'_>>>, width: usize) -> NativeResult<Option<Vec<Value>>> {
    let Some(row) = step.map_err(native_error)? else {
        return Ok(None);
    };
    (0..width)
        .map(|i| row.get_ref(i).map(to_value))
        .collect::<rusqlite::Result<Vec<_>>>()
        .map(Some)
        .map_err(native_error)
}

/// Converts a SQLite value into a dblayer value
fn to_value(value: ValueRef) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Extracts the primary result code from a rusqlite error.
pub(crate) fn native_error(err: rusqlite::Error) -> NativeError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => NativeError::new(
            (failure.extended_code & 0xff).to_string(),
            message.clone().unwrap_or_else(|| failure.to_string()),
        ),
        _ => NativeError::new(GENERIC_ERROR, err.to_string()),
    }
}
