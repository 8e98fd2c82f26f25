/// Cancellation Module
///
/// Deadlines and cancel tokens threaded through reconnection and transaction
/// retry loops, the two places where dblayer can block for a long time.
use crate::core::{DbError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared flag another thread can raise to stop a blocking loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An optional point in time plus an optional cancel token.
///
/// The default deadline never expires.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: Option<CancelToken>,
}

impl Deadline {
    /// A deadline that never expires
    pub fn none() -> Self {
        Deadline::default()
    }

    /// Expires `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Some(Instant::now() + timeout),
            token: None,
        }
    }

    /// Also expire when `token` is cancelled.
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// True once the deadline passed or the token fired.
    pub fn expired(&self) -> bool {
        let cancelled = self.token.as_ref().map_or(false, CancelToken::is_cancelled);
        let late = self.at.map_or(false, |at| Instant::now() >= at);
        cancelled || late
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fails with `DbError::Cancelled` once expired.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.expired() {
            Err(DbError::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early and failing when the deadline expires.
    pub fn sleep(&self, duration: Duration, operation: &str) -> Result<()> {
        let wake = Instant::now() + duration;
        loop {
            self.check(operation)?;
            let now = Instant::now();
            if now >= wake {
                return Ok(());
            }
            let mut slice = (wake - now).min(SLEEP_SLICE);
            if let Some(left) = self.remaining() {
                slice = slice.min(left);
            }
            thread::sleep(slice);
        }
    }
}
