// Core infrastructure modules
pub mod core;

// Setup tooling
pub mod config;
pub mod migrate;

// Fault-injecting driver for tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::core::{DbError, ErrorCategory, Result};
