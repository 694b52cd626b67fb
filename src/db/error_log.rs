//! Per-target log of recent connect failures.
//!
//! Physical connects happen inside the pool, far from the caller that eventually times
//! out waiting for one. Failures are recorded here by details hash and drained into the
//! timeout error the caller sees.

use crate::error::DbError;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Most distinct messages kept per target.
const MAX_ERRORS_PER_TARGET: usize = 16;

/// Receives connect-time failures from a connection factory.
pub trait ErrorSink: Send + Sync {
    fn record_connection_error(&self, details_hash: &str, error: &DbError);
}

/// Deduplicated, bounded, cleared-on-read connect errors keyed by details hash.
#[derive(Debug, Default)]
pub struct ConnectionErrorLog {
    errors: Mutex<HashMap<String, Vec<String>>>,
}

impl ConnectionErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, details_hash: &str, message: impl Into<String>) {
        let message = message.into();
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = errors.entry(details_hash.to_string()).or_default();
        if entry.contains(&message) || entry.len() >= MAX_ERRORS_PER_TARGET {
            return;
        }
        entry.push(message);
    }

    /// Remove and return the recorded messages for a target, oldest first.
    pub fn take(&self, details_hash: &str) -> Vec<String> {
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.remove(details_hash).unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.clear();
    }
}

impl ErrorSink for ConnectionErrorLog {
    fn record_connection_error(&self, details_hash: &str, error: &DbError) {
        warn!(details_hash = %details_hash, error = %error, "Connection attempt failed");
        self.record(details_hash, error.to_string());
    }
}
