/// Transaction Module
///
/// Depth-tracked transactions on top of a [`ConnectionHandle`], and the
/// [`perform`](ConnectionHandle::perform) combinator that replays a whole
/// transaction when the backend reports a deadlock, lock timeout or lost
/// connection.
///
/// Only the outermost `begin()`/`commit()`/`rollback()` talk to the server
/// with `BEGIN`/`COMMIT`/`ROLLBACK`. Nested levels become savepoints on
/// backends that support them and are purely logical elsewhere.
use crate::core::db::cancel::Deadline;
use crate::core::db::connection::ConnectionHandle;
use crate::core::{DbError, ErrorCategory, Result};
use tracing::{debug, warn};

/// Transaction depth owned by one connection handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    /// Number of open `begin()` calls
    pub depth: u32,
    /// Set when a nested level rolled back on a backend without savepoints
    pub rollback_only: bool,
}

impl TransactionState {
    pub(crate) fn reset(&mut self) {
        self.depth = 0;
        self.rollback_only = false;
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }
}

/// What a transaction body wants done with its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Commit(T),
    /// Discard the work but report success to the caller
    Rollback(T),
}

fn savepoint_name(depth: u32) -> String {
    format!("dblayer_sp_{}", depth)
}

impl ConnectionHandle {
    /// Current transaction depth
    pub fn transaction_depth(&self) -> u32 {
        self.txn.depth
    }

    /// Whether nested levels use real savepoints on this handle
    pub fn uses_savepoints(&self) -> bool {
        self.options()
            .savepoints
            .unwrap_or_else(|| self.kind().supports_savepoints())
    }

    fn run_control(&mut self, sql: &str) -> Result<()> {
        self.run(sql, |driver, sql| driver.execute(sql)).map(|_| ())
    }

    /// Opens a transaction level.
    ///
    /// Depth 0 -> 1 issues a real `BEGIN`; deeper levels issue `SAVEPOINT`
    /// where supported.
    pub fn begin(&mut self) -> Result<()> {
        let next = self.txn.depth + 1;
        if next == 1 {
            let sql = self.kind().begin_sql();
            self.run_control(sql)?;
        } else if self.uses_savepoints() {
            self.run_control(&format!("SAVEPOINT {}", savepoint_name(next)))?;
        }
        self.txn.depth = next;
        debug!(session = %self.id(), depth = next, "Transaction level opened");
        Ok(())
    }

    /// Closes the innermost transaction level, keeping its work.
    ///
    /// # Errors
    ///
    /// At the outermost level a deadlock or lock-wait timeout during `COMMIT`
    /// comes back as `DbError::Rollback`; the depth is reset to 0 whatever
    /// the outcome. Committing without a transaction is a query error.
    pub fn commit(&mut self) -> Result<()> {
        match self.txn.depth {
            0 => Err(DbError::query("commit without an open transaction")),
            1 => {
                if self.txn.rollback_only {
                    self.abandon_transaction();
                    return Err(DbError::query(
                        "transaction was rolled back by a nested level and cannot be committed",
                    ));
                }
                // Lock-wait and deadlock codes are classified as Rollback by
                // the taxonomy table, so they surface here already converted.
                let result = self.run_control("COMMIT");
                if let Err(err) = &result {
                    if self.txn.depth > 0 {
                        debug!(session = %self.id(), "COMMIT failed: {}", err);
                        self.abandon_transaction();
                    }
                }
                self.txn.reset();
                result
            }
            depth => {
                if self.uses_savepoints() {
                    self.run_control(&format!("RELEASE SAVEPOINT {}", savepoint_name(depth)))?;
                }
                self.txn.depth = depth - 1;
                Ok(())
            }
        }
    }

    /// Closes the innermost transaction level, discarding its work.
    ///
    /// On backends without savepoints a nested rollback marks the whole
    /// transaction rollback-only; the outer `commit()` will then refuse.
    pub fn rollback(&mut self) -> Result<()> {
        match self.txn.depth {
            0 => Err(DbError::query("rollback without an open transaction")),
            1 => {
                let result = self.run_control("ROLLBACK");
                self.txn.reset();
                match result {
                    // The server already threw the transaction away
                    Err(err)
                        if matches!(
                            err.category(),
                            ErrorCategory::Network | ErrorCategory::Rollback
                        ) =>
                    {
                        debug!(session = %self.id(), "ROLLBACK after lost transaction: {}", err);
                        Ok(())
                    }
                    other => other,
                }
            }
            depth => {
                if self.uses_savepoints() {
                    let name = savepoint_name(depth);
                    self.run_control(&format!("ROLLBACK TO SAVEPOINT {}", name))?;
                    self.run_control(&format!("RELEASE SAVEPOINT {}", name))?;
                } else {
                    self.txn.rollback_only = true;
                }
                self.txn.depth = depth - 1;
                Ok(())
            }
        }
    }

    /// Rolls back every level above `base`, ignoring failures.
    fn unwind_to(&mut self, base: u32) {
        while self.txn.depth > base {
            if let Err(err) = self.rollback() {
                debug!(session = %self.id(), "Unwinding transaction failed: {}", err);
                if self.txn.depth > base {
                    self.abandon_transaction();
                }
                break;
            }
        }
    }

    /// Runs `action` inside a transaction, replaying it on rollback errors.
    ///
    /// Each attempt is `begin(); action(); commit()`. If the action fails the
    /// transaction is rolled back and the error returned. If the action or
    /// the commit fails with `DbError::Rollback`, the whole cycle starts over,
    /// up to `max_retries` attempts in total; after that the rollback error
    /// is returned.
    ///
    /// The action may run several times and must not have side effects
    /// outside the database before the commit.
    pub fn perform<T, F>(&mut self, max_retries: u32, mut action: F) -> Result<T>
    where
        F: FnMut(&mut ConnectionHandle) -> Result<T>,
    {
        self.perform_outcome(max_retries, |handle| action(handle).map(Outcome::Commit))
    }

    /// [`perform`](Self::perform) for bodies that may decide to roll back.
    ///
    /// `Outcome::Rollback(value)` discards the work and returns `Ok(value)`.
    pub fn perform_outcome<T, F>(&mut self, max_retries: u32, mut action: F) -> Result<T>
    where
        F: FnMut(&mut ConnectionHandle) -> Result<Outcome<T>>,
    {
        // Inside an outer transaction a replay has to restart the outer one,
        // so rollback errors are passed up instead.
        let base = self.txn.depth;
        let attempts = if base > 0 { 1 } else { max_retries.max(1) };
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.deadline().check("transaction")?;

            let err = match self.attempt_transaction(base, &mut action) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.category() != ErrorCategory::Rollback || attempt >= attempts {
                return Err(err);
            }
            warn!(session = %self.id(), attempt, attempts, "Transaction rolled back, retrying: {}", err);
        }
    }

    /// [`perform`](Self::perform) bounded by an explicit deadline.
    pub fn perform_within<T, F>(&mut self, deadline: Deadline, max_retries: u32, action: F) -> Result<T>
    where
        F: FnMut(&mut ConnectionHandle) -> Result<T>,
    {
        let previous = self.set_deadline(deadline);
        let result = self.perform(max_retries, action);
        self.set_deadline(previous);
        result
    }

    fn attempt_transaction<T, F>(&mut self, base: u32, action: &mut F) -> Result<T>
    where
        F: FnMut(&mut ConnectionHandle) -> Result<Outcome<T>>,
    {
        self.begin()?;
        match action(self) {
            Ok(Outcome::Commit(value)) => {
                self.commit()?;
                Ok(value)
            }
            Ok(Outcome::Rollback(value)) => {
                self.rollback()?;
                Ok(value)
            }
            Err(err) => {
                self.unwind_to(base);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::backend::{BackendKind, NativeError};
    use crate::testing::{network_error, MockConnector};

    fn connected(kind: BackendKind) -> (MockConnector, ConnectionHandle) {
        let mock = MockConnector::new(kind);
        let handle = mock.batch_handle().unwrap();
        (mock, handle)
    }

    fn deadlock() -> NativeError {
        NativeError::new("1213", "Deadlock found when trying to get lock")
    }

    #[test]
    fn test_nested_commit_collapses_on_flat_backend() {
        let (mock, mut handle) = connected(BackendKind::Mysql);

        handle.begin().unwrap();
        handle.begin().unwrap();
        assert_eq!(handle.transaction_depth(), 2);
        handle.commit().unwrap();
        handle.commit().unwrap();

        assert_eq!(handle.transaction_depth(), 0);
        assert_eq!(mock.statements(), vec!["START TRANSACTION", "COMMIT"]);
        assert_eq!(mock.commit_count(), 1);
    }

    #[test]
    fn test_nested_levels_use_savepoints() {
        let (mock, mut handle) = connected(BackendKind::Postgres);

        handle.begin().unwrap();
        handle.begin().unwrap();
        handle.rollback().unwrap();
        handle.commit().unwrap();

        assert_eq!(
            mock.statements(),
            vec![
                "BEGIN",
                "SAVEPOINT dblayer_sp_2",
                "ROLLBACK TO SAVEPOINT dblayer_sp_2",
                "RELEASE SAVEPOINT dblayer_sp_2",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_nested_rollback_on_flat_backend_poisons_commit() {
        let (mock, mut handle) = connected(BackendKind::Mysql);

        handle.begin().unwrap();
        handle.begin().unwrap();
        handle.rollback().unwrap();
        assert!(handle.commit().is_err());
        assert_eq!(handle.transaction_depth(), 0);
        assert_eq!(mock.commit_count(), 0);
        assert_eq!(mock.statements_matching("ROLLBACK"), 1);
    }

    #[test]
    fn test_commit_without_transaction() {
        let (_mock, mut handle) = connected(BackendKind::Sqlite);
        match handle.commit() {
            Err(DbError::Query { .. }) => {}
            other => panic!("Expected Query error, got {:?}", other),
        }
        assert!(handle.rollback().is_err());
    }

    #[test]
    fn test_commit_deadlock_becomes_rollback_and_resets_depth() {
        let (mock, mut handle) = connected(BackendKind::Mysql);
        mock.fail_statement("COMMIT", 1, deadlock());

        handle.begin().unwrap();
        match handle.commit() {
            Err(DbError::Rollback { code, .. }) => assert_eq!(code.as_deref(), Some("1213")),
            other => panic!("Expected Rollback error, got {:?}", other),
        }
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_perform_commits_on_success() {
        let (mock, mut handle) = connected(BackendKind::Sqlite);

        let value = handle
            .perform(3, |h| {
                h.execute("INSERT INTO widgets (name) VALUES ('bolt')")?;
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(mock.commit_count(), 1);
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_perform_gives_up_after_max_retries() {
        let (mock, mut handle) = connected(BackendKind::Mysql);
        mock.fail_statement("COMMIT", u32::MAX, deadlock());

        let mut calls = 0;
        let result: Result<()> = handle.perform(3, |_| {
            calls += 1;
            Ok(())
        });

        assert_eq!(calls, 3);
        match result {
            Err(DbError::Rollback { .. }) => {}
            other => panic!("Expected Rollback error, got {:?}", other),
        }
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_perform_replays_after_deadlock_in_body() {
        let (mock, mut handle) = connected(BackendKind::Mysql);
        mock.fail_statement("UPDATE", 1, deadlock());

        let mut calls = 0;
        handle
            .perform(5, |h| {
                calls += 1;
                h.execute("UPDATE widgets SET size = 2")
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(mock.commit_count(), 1);
    }

    #[test]
    fn test_perform_does_not_retry_query_errors() {
        let (mock, mut handle) = connected(BackendKind::Sqlite);

        let mut calls = 0;
        let result: Result<()> = handle.perform(5, |_| {
            calls += 1;
            Err(DbError::query("constraint failed"))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert_eq!(mock.statements(), vec!["BEGIN IMMEDIATE", "ROLLBACK"]);
    }

    #[test]
    fn test_lost_connection_mid_transaction_replays_whole_body() {
        let (mock, mut handle) = connected(BackendKind::Mysql);
        mock.fail_statement("INSERT", 1, network_error());

        let mut calls = 0;
        handle
            .perform(3, |h| {
                calls += 1;
                h.execute("INSERT INTO widgets (name) VALUES ('bolt')")
            })
            .unwrap();

        // the first attempt lost its connection and must not be reported as done
        assert_eq!(calls, 2);
        assert_eq!(mock.connect_attempts(), 2);
        assert_eq!(mock.commit_count(), 1);
    }

    #[test]
    fn test_outcome_rollback_is_success() {
        let (mock, mut handle) = connected(BackendKind::Sqlite);

        let value = handle
            .perform_outcome(3, |_| Ok(Outcome::Rollback("skipped")))
            .unwrap();

        assert_eq!(value, "skipped");
        assert_eq!(mock.commit_count(), 0);
        assert_eq!(mock.statements(), vec!["BEGIN IMMEDIATE", "ROLLBACK"]);
    }

    #[test]
    fn test_perform_inside_outer_transaction_does_not_retry() {
        let (mock, mut handle) = connected(BackendKind::Mysql);
        mock.fail_statement("UPDATE", 1, deadlock());

        handle.begin().unwrap();
        let mut calls = 0;
        let result = handle.perform(5, |h| {
            calls += 1;
            h.execute("UPDATE widgets SET size = 3")
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        // the deadlock discarded the outer transaction too
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_perform_within_expired_deadline() {
        let (_mock, mut handle) = connected(BackendKind::Sqlite);
        let deadline = Deadline::after(std::time::Duration::ZERO);

        let result: Result<()> = handle.perform_within(deadline, 3, |_| Ok(()));
        match result {
            Err(DbError::Cancelled(_)) => {}
            other => panic!("Expected Cancelled error, got {:?}", other),
        }
    }
}
