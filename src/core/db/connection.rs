/// Connection Management Module
///
/// This module owns the lifecycle of one native connection: connecting,
/// detecting severed connections, the reconnection loop, and the translation
/// of driver failures into the four error categories.
///
/// ## State machine
///
/// ```text
/// Disconnected -> Connecting -> Connected
///                     |             |
///                     v             v
///               Disconnected   Reconnecting -> Connected
///                                   |
///                                   v
///                              Disconnected (attempts exhausted)
/// ```
///
/// A connected handle can also drop straight back to `Disconnected` when it
/// is closed or hits a local system fault.
use crate::core::db::backend::{BackendKind, Connector, Driver, DriverRegistry, NativeResult};
use crate::core::db::cancel::Deadline;
use crate::core::db::params::{ConnectionContext, ConnectionOptions, ConnectionParams};
use crate::core::db::query::TableNames;
use crate::core::db::taxonomy::classify_error;
use crate::core::db::transaction::TransactionState;
use crate::core::{DbError, ErrorCategory, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a [`ConnectionHandle`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }
}

/// Reconnect progress is logged on attempts 10, 20, ... 90, then every 100th.
pub fn is_progress_attempt(attempt: u32) -> bool {
    if attempt < 100 {
        attempt % 10 == 0
    } else {
        attempt % 100 == 0
    }
}

/// One logical database session.
///
/// The handle exclusively owns its native connection and transaction depth.
/// Methods take `&mut self`; share a handle between threads only through a
/// `Mutex`, as [`ConnectionRegistry`] does.
pub struct ConnectionHandle {
    id: Uuid,
    params: ConnectionParams,
    options: ConnectionOptions,
    kind: BackendKind,
    connector: Arc<dyn Connector>,
    driver: Option<Box<dyn Driver>>,
    state: ConnectionState,
    reconnect_attempts: u32,
    tables: TableNames,
    deadline: Deadline,
    pub(crate) txn: TransactionState,
}

impl ConnectionHandle {
    /// Opens a handle for `uri` using the connectors in `registry`.
    ///
    /// # Arguments
    ///
    /// * `uri` - Connection URI, see [`ConnectionParams::parse`]
    /// * `context` - Selects the reconnect defaults
    /// * `registry` - Scheme to connector mapping
    ///
    /// # Returns
    ///
    /// A handle that is already connected unless `autoconnect` is off.
    ///
    /// # Errors
    ///
    /// `DbError::Config` for bad URIs or unknown schemes, otherwise the
    /// categorized connect failure.
    pub fn open(uri: &str, context: ConnectionContext, registry: &DriverRegistry) -> Result<Self> {
        let params = ConnectionParams::parse(uri)?;
        let options = ConnectionOptions::resolve(&params, context)?;
        let connector = registry.connector(&params.scheme)?;
        let mut handle = ConnectionHandle::new(params, options, connector);
        if handle.options.autoconnect {
            handle.connect()?;
        }
        Ok(handle)
    }

    /// Creates a disconnected handle around an explicit connector.
    pub fn new(
        params: ConnectionParams,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let tables = TableNames {
            prefix: options.prefix.clone(),
            suffix: options.suffix.clone(),
            aliases: options.aliases.clone(),
        };
        ConnectionHandle {
            id: Uuid::new_v4(),
            kind: connector.kind(),
            params,
            options,
            connector,
            driver: None,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            tables,
            deadline: Deadline::none(),
            txn: TransactionState::default(),
        }
    }

    /// Session id used in log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Attempts made by the most recent connect/reconnect loop
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Deadline applied to reconnect loops and transaction retries
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Replaces the deadline, returning the previous one.
    pub fn set_deadline(&mut self, deadline: Deadline) -> Deadline {
        std::mem::replace(&mut self.deadline, deadline)
    }

    /// Makes a single connection attempt.
    ///
    /// A no-op when already connected.
    ///
    /// # Errors
    ///
    /// `DbError::System` for local misconfiguration, `DbError::Network` when
    /// the server cannot be reached.
    pub fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.sever();
        self.transition(ConnectionState::Connecting);
        self.reconnect_attempts = 1;
        match self.attempt_connect() {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Closes the native connection. Any open transaction is lost.
    pub fn disconnect(&mut self) {
        if self.txn.depth > 0 {
            warn!(session = %self.id, depth = self.txn.depth, "Disconnecting with an open transaction");
        }
        self.sever();
        self.transition(ConnectionState::Disconnected);
    }

    /// Makes sure the handle is connected, reconnecting if needed.
    pub fn ensure_connected(&mut self) -> Result<()> {
        let deadline = self.deadline.clone();
        self.ensure_connected_within(&deadline)
    }

    /// [`ensure_connected`](Self::ensure_connected) bounded by an explicit deadline.
    ///
    /// Runs the reconnection loop: the handle is severed, its transaction
    /// depth reset to 0, and connection attempts are made until one succeeds
    /// or `maxreconnectattempts` is reached. With `autoreconnect` off a single
    /// attempt is made.
    ///
    /// # Errors
    ///
    /// A fatal `DbError::Network` once the attempts are exhausted,
    /// `DbError::Cancelled` when the deadline expires, or any non-network
    /// connect failure unchanged.
    pub fn ensure_connected_within(&mut self, deadline: &Deadline) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => {
                self.sever();
                self.transition(ConnectionState::Connecting);
                self.connect_loop(deadline)
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.sever();
                self.connect_loop(deadline)
            }
        }
    }

    fn attempt_connect(&mut self) -> Result<()> {
        debug!(session = %self.id, uri = %self.params.masked(), "Connecting");
        let driver = self
            .connector
            .connect(&self.params)
            .map_err(|e| classify_error(self.kind, e))?;
        self.driver = Some(driver);
        info!(session = %self.id, backend = %self.kind, "Connected to {}", self.params.masked());
        Ok(())
    }

    /// Attempt loop shared by first connects and reconnects.
    fn connect_loop(&mut self, deadline: &Deadline) -> Result<()> {
        let limit = if self.options.autoreconnect {
            self.options.max_reconnect_attempts
        } else {
            1
        };
        self.reconnect_attempts = 0;

        loop {
            if let Err(err) = deadline.check("connect") {
                self.transition(ConnectionState::Disconnected);
                return Err(err);
            }

            self.reconnect_attempts += 1;
            let attempt = self.reconnect_attempts;
            let err = match self.attempt_connect() {
                Ok(()) => {
                    self.transition(ConnectionState::Connected);
                    return Ok(());
                }
                Err(err) => err,
            };

            if err.category() != ErrorCategory::Network {
                self.transition(ConnectionState::Disconnected);
                return Err(err);
            }

            if !self.options.reconnect_quietly && is_progress_attempt(attempt) {
                warn!(session = %self.id, attempt, "Still unable to connect to {}: {}", self.params.masked(), err);
            }

            if limit != 0 && attempt >= limit {
                self.transition(ConnectionState::Disconnected);
                error!(session = %self.id, attempts = attempt, "Giving up on {}", self.params.masked());
                return Err(DbError::Network {
                    message: format!("giving up after {} connection attempts: {}", attempt, err),
                    code: err.native_code().map(String::from),
                });
            }

            if let Err(cancelled) = deadline.sleep(self.options.reconnect_delay, "reconnect") {
                self.transition(ConnectionState::Disconnected);
                return Err(cancelled);
            }
        }
    }

    /// Drops the native connection; any transaction is necessarily lost.
    fn sever(&mut self) {
        self.driver = None;
        self.txn.reset();
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid connection state change {:?} -> {:?}",
            self.state,
            next
        );
        debug!(session = %self.id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }

    pub(crate) fn driver_mut(&mut self) -> Option<&mut (dyn Driver + 'static)> {
        self.driver.as_deref_mut()
    }

    /// Sends one statement through the driver and categorizes the outcome.
    fn dispatch<T, F>(&mut self, sql: &str, op: &mut F) -> Result<T>
    where
        F: FnMut(&mut dyn Driver, &str) -> NativeResult<T>,
    {
        let kind = self.kind;
        let driver = self
            .driver
            .as_deref_mut()
            .ok_or_else(|| DbError::network("connection is not open"))?;
        debug!(session = %self.id, sql, "Executing");
        op(driver, sql).map_err(|e| classify_error(kind, e))
    }

    /// Runs one statement with the full failure policy applied.
    ///
    /// - Network faults sever the connection. With `autoreconnect` on, the
    ///   handle reconnects; if a transaction was open the failure comes back
    ///   as `DbError::Rollback`, otherwise the statement is re-attempted once.
    /// - System faults mark the connection dead.
    /// - Rollback faults abandon the open transaction.
    pub(crate) fn run<T, F>(&mut self, sql: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn Driver, &str) -> NativeResult<T>,
    {
        self.ensure_connected()?;

        let err = match self.dispatch(sql, &mut op) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.category() != ErrorCategory::Network {
            return Err(self.settle(err));
        }

        let in_transaction = self.txn.depth > 0;
        self.sever();
        if !self.options.autoreconnect {
            self.transition(ConnectionState::Disconnected);
            return Err(err);
        }

        warn!(session = %self.id, in_transaction, "Connection lost, reconnecting: {}", err);
        self.transition(ConnectionState::Reconnecting);
        let deadline = self.deadline.clone();
        self.connect_loop(&deadline)?;

        if in_transaction {
            return Err(DbError::Rollback {
                message: format!("connection lost during transaction: {}", err),
                code: err.native_code().map(String::from),
            });
        }

        match self.dispatch(sql, &mut op) {
            Ok(value) => Ok(value),
            Err(retry_err) if retry_err.category() == ErrorCategory::Network => {
                self.sever();
                self.transition(ConnectionState::Disconnected);
                Err(retry_err)
            }
            Err(retry_err) => Err(self.settle(retry_err)),
        }
    }

    /// Applies the side effects of a non-network failure.
    fn settle(&mut self, err: DbError) -> DbError {
        match err.category() {
            ErrorCategory::System => {
                error!(session = %self.id, "Connection marked dead: {}", err);
                self.sever();
                self.transition(ConnectionState::Disconnected);
            }
            ErrorCategory::Rollback if self.txn.depth > 0 => self.abandon_transaction(),
            _ => {}
        }
        err
    }

    /// Best-effort `ROLLBACK` after the backend already discarded our work.
    pub(crate) fn abandon_transaction(&mut self) {
        if let Some(driver) = self.driver.as_deref_mut() {
            if let Err(e) = driver.execute("ROLLBACK") {
                debug!(session = %self.id, "Ignoring failed ROLLBACK: {}", e);
            }
        }
        self.txn.reset();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("uri", &self.params.masked())
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("txn", &self.txn)
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.txn.depth > 0 {
            warn!(session = %self.id, "Dropping handle with an open transaction; it will be rolled back");
            self.abandon_transaction();
        }
    }
}

/// A handle shared between workers.
pub type SharedHandle = Arc<Mutex<ConnectionHandle>>;

/// Explicit cache of shared handles keyed by (backend kind, connection URI).
///
/// Owned by the application and passed by reference; nothing here is global.
#[derive(Debug)]
pub struct ConnectionRegistry {
    drivers: DriverRegistry,
    context: ConnectionContext,
    handles: HashMap<(BackendKind, String), SharedHandle>,
}

impl ConnectionRegistry {
    pub fn new(drivers: DriverRegistry, context: ConnectionContext) -> Self {
        ConnectionRegistry {
            drivers,
            context,
            handles: HashMap::new(),
        }
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Returns the cached handle for `uri`, opening it on first use.
    pub fn get_or_open(&mut self, uri: &str) -> Result<SharedHandle> {
        let params = ConnectionParams::parse(uri)?;
        let connector = self.drivers.connector(&params.scheme)?;
        let key = (connector.kind(), uri.to_string());
        if let Some(handle) = self.handles.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(Mutex::new(ConnectionHandle::open(
            uri,
            self.context,
            &self.drivers,
        )?));
        self.handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Removes and returns a cached handle
    pub fn remove(&mut self, kind: BackendKind, uri: &str) -> Option<SharedHandle> {
        self.handles.remove(&(kind, uri.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
