/// Test Support Module
///
/// A scriptable in-memory [`Connector`] for exercising reconnect and
/// transaction-retry behaviour without a live server. Every statement the
/// handle sends is recorded, and connect or statement failures can be
/// injected by substring.
///
/// Only built for tests and with the `testing` feature.
use crate::core::db::backend::{BackendKind, Connector, Driver, NativeError, NativeResult, RowSet, RowStream};
use crate::core::db::connection::ConnectionHandle;
use crate::core::db::params::{ConnectionContext, ConnectionOptions, ConnectionParams};
use crate::core::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// MySQL "server has gone away"
pub fn network_error() -> NativeError {
    NativeError::new("2006", "MySQL server has gone away")
}

#[derive(Debug)]
struct StatementFault {
    pattern: String,
    remaining: u32,
    error: NativeError,
}

#[derive(Debug)]
struct ScriptedRows {
    pattern: String,
    /// `None` answers forever
    remaining: Option<u32>,
    rows: RowSet,
}

#[derive(Debug)]
struct ScriptedCount {
    pattern: String,
    remaining: u32,
    affected: u64,
}

#[derive(Debug, Default)]
struct MockState {
    statements: Vec<String>,
    connect_attempts: u32,
    connect_faults: Vec<NativeError>,
    statement_faults: Vec<StatementFault>,
    responses: Vec<ScriptedRows>,
    counts: Vec<ScriptedCount>,
    next_insert_id: i64,
}

/// Connector whose drivers share one recorded, scriptable state.
#[derive(Debug, Clone)]
pub struct MockConnector {
    kind: BackendKind,
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(kind: BackendKind) -> Self {
        MockConnector {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// URI the mock pretends to serve
    pub fn uri(&self) -> &'static str {
        match self.kind {
            BackendKind::Sqlite => "sqlite:///:memory:",
            BackendKind::Mysql => "mysql://app@db/shop",
            BackendKind::Postgres => "pgsql://app@db/shop",
        }
    }

    /// A connected batch-context handle with no reconnect delay.
    pub fn batch_handle(&self) -> Result<ConnectionHandle> {
        let params = ConnectionParams::parse(self.uri())?;
        let mut options = ConnectionOptions::defaults(ConnectionContext::Batch);
        options.reconnect_delay = Duration::ZERO;
        options.reconnect_quietly = true;
        let mut handle = ConnectionHandle::new(params, options, Arc::new(self.clone()));
        handle.connect()?;
        Ok(handle)
    }

    /// The next `times` connection attempts fail with `error`.
    pub fn fail_connects(&self, times: u32, error: NativeError) {
        let mut state = self.state();
        for _ in 0..times {
            state.connect_faults.push(error.clone());
        }
    }

    /// The next `times` statements containing `pattern` fail with `error`.
    pub fn fail_statement(&self, pattern: &str, times: u32, error: NativeError) {
        self.state().statement_faults.push(StatementFault {
            pattern: pattern.to_string(),
            remaining: times,
            error,
        });
    }

    /// Queries containing `pattern` return `rows`; later scripts win.
    pub fn respond(&self, pattern: &str, rows: RowSet) {
        self.script(pattern, None, rows);
    }

    /// Like [`respond`](Self::respond), for the next `times` matching queries only.
    pub fn respond_times(&self, pattern: &str, times: u32, rows: RowSet) {
        self.script(pattern, Some(times), rows);
    }

    /// The next `times` statements containing `pattern` report `affected` rows.
    ///
    /// Unscripted statements affect no rows.
    pub fn affect(&self, pattern: &str, times: u32, affected: u64) {
        self.state().counts.push(ScriptedCount {
            pattern: pattern.to_string(),
            remaining: times,
            affected,
        });
    }

    fn script(&self, pattern: &str, remaining: Option<u32>, rows: RowSet) {
        self.state().responses.insert(
            0,
            ScriptedRows {
                pattern: pattern.to_string(),
                remaining,
                rows,
            },
        );
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Every statement sent so far, failed ones included
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn statements_matching(&self, pattern: &str) -> usize {
        self.state()
            .statements
            .iter()
            .filter(|sql| sql.contains(pattern))
            .count()
    }

    pub fn commit_count(&self) -> usize {
        self.state()
            .statements
            .iter()
            .filter(|sql| sql.as_str() == "COMMIT")
            .count()
    }
}

impl Connector for MockConnector {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connect(&self, _params: &ConnectionParams) -> NativeResult<Box<dyn Driver>> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if !state.connect_faults.is_empty() {
            return Err(state.connect_faults.remove(0));
        }
        Ok(Box::new(MockDriver {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Driver handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    fn record(&self, sql: &str) -> NativeResult<MutexGuard<'_, MockState>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.statements.push(sql.to_string());

        let fault = state
            .statement_faults
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern));
        if let Some(fault) = fault {
            fault.remaining -= 1;
            return Err(fault.error.clone());
        }
        Ok(state)
    }
}

impl Driver for MockDriver {
    fn execute(&mut self, sql: &str) -> NativeResult<u64> {
        let mut state = self.record(sql)?;
        if sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
            state.next_insert_id += 1;
        }
        let count = state
            .counts
            .iter_mut()
            .find(|c| c.remaining > 0 && sql.contains(&c.pattern));
        Ok(match count {
            Some(count) => {
                count.remaining -= 1;
                count.affected
            }
            None => 0,
        })
    }

    fn query(&mut self, sql: &str) -> NativeResult<Box<dyn RowStream>> {
        let mut state = self.record(sql)?;
        let script = state
            .responses
            .iter_mut()
            .find(|r| r.remaining != Some(0) && sql.contains(&r.pattern));
        let rows = match script {
            Some(script) => {
                if let Some(remaining) = script.remaining.as_mut() {
                    *remaining -= 1;
                }
                script.rows.clone()
            }
            None => RowSet::default(),
        };
        Ok(rows.into_stream())
    }

    fn last_insert_id(&mut self) -> Option<i64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.next_insert_id)
    }
}
