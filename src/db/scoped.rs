//! Scoped access to a pooled connection.
//!
//! A [`ScopedConnection`] obtains its connection lazily from a [`ConnectionLease`] and
//! hands it back exactly once. Whether the connection then goes back to the pool or
//! stays with its owner is the lease's decision.
//!
//! # Runtime Shutdown Behavior
//!
//! Dropping an acquired scope without calling [`ScopedConnection::release`] spawns a
//! task that performs the release. If the runtime is shutting down the task may never
//! run; the physical connection is then closed when the last reference goes away.
//! Prefer `release().await` or [`ScopedConnection::run`].

use crate::db::server_connection::ServerConnection;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Capability to obtain a connection and give it back.
#[async_trait]
pub trait ConnectionLease: Send + Sync {
    async fn get(&self) -> DbResult<Arc<ServerConnection>>;

    async fn put(&self, conn: Arc<ServerConnection>) -> DbResult<()>;
}

enum ScopeState {
    Ready,
    Acquired(Arc<ServerConnection>),
    Closed,
}

pub struct ScopedConnection {
    lease: Arc<dyn ConnectionLease>,
    state: ScopeState,
}

impl ScopedConnection {
    pub fn new(lease: Arc<dyn ConnectionLease>) -> Self {
        Self {
            lease,
            state: ScopeState::Ready,
        }
    }

    /// Obtain the connection, on first call from the lease.
    pub async fn acquire(&mut self) -> DbResult<Arc<ServerConnection>> {
        match &self.state {
            ScopeState::Acquired(conn) => Ok(conn.clone()),
            ScopeState::Closed => Err(DbError::ScopeClosed),
            ScopeState::Ready => match self.lease.get().await {
                Ok(conn) => {
                    self.state = ScopeState::Acquired(conn.clone());
                    Ok(conn)
                }
                Err(e) => {
                    self.state = ScopeState::Closed;
                    Err(e)
                }
            },
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self.state, ScopeState::Acquired(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ScopeState::Closed)
    }

    /// Give the connection back and close the scope. Further calls are no-ops.
    pub async fn release(&mut self) -> DbResult<()> {
        match std::mem::replace(&mut self.state, ScopeState::Closed) {
            ScopeState::Acquired(conn) => self.lease.put(conn).await,
            ScopeState::Ready | ScopeState::Closed => Ok(()),
        }
    }

    /// Acquire, run `f`, and release whether `f` succeeded or not.
    pub async fn run<T, F, Fut>(mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(Arc<ServerConnection>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let conn = self.acquire().await?;
        let result = f(conn).await;
        let released = self.release().await;
        let value = result?;
        released?;
        Ok(value)
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        let ScopeState::Acquired(conn) = std::mem::replace(&mut self.state, ScopeState::Closed)
        else {
            return;
        };

        // Spawn a task to handle async release - this is for panic safety
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                backend_pid = conn.backend_pid(),
                "Scoped connection dropped outside a runtime; connection not released"
            );
            return;
        };
        let lease = Arc::clone(&self.lease);
        handle.spawn(async move {
            let backend_pid = conn.backend_pid();
            if let Err(e) = lease.put(conn).await {
                warn!(backend_pid, error = %e, "Failed to release scoped connection");
            }
            warn!(
                backend_pid,
                "Scoped connection released via Drop - consider using explicit release()"
            );
        });
    }
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            ScopeState::Ready => "ready",
            ScopeState::Acquired(_) => "acquired",
            ScopeState::Closed => "closed",
        };
        f.debug_struct("ScopedConnection")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}
