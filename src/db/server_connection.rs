//! Wrapper around one physical connection handed out by the manager.
//!
//! The wrapper is shared as `Arc<ServerConnection>`; the physical connection sits
//! behind an async mutex so statements from different tasks are serialized. Once the
//! physical connection has been returned or closed, every operation fails with
//! [`DbError::ConnectionReleased`].

use crate::db::driver::{ConnectionParameters, TransactionStatus};
use crate::db::pool::{ConnectionPool, PhysicalConnection};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const LIST_DATABASES_SQL: &str = "SELECT datname FROM pg_database WHERE datistemplate = false";

const SET_APPLICATION_NAME_SQL: &str = "SELECT set_config('application_name', $1, false)";

pub struct ServerConnection {
    conn: Mutex<Option<PhysicalConnection>>,
    /// Set for dedicated connections that return to their pool themselves.
    pool: Option<Arc<ConnectionPool>>,
    parameters: ConnectionParameters,
    application_name: std::sync::Mutex<Option<String>>,
    server_version_num: u32,
    backend_pid: i32,
    user_transaction: AtomicBool,
    in_error: AtomicBool,
}

impl ServerConnection {
    pub fn new(conn: PhysicalConnection, pool: Option<Arc<ConnectionPool>>) -> Self {
        let parameters = conn.parameters().clone();
        let application_name = parameters.application_name.clone();
        Self {
            server_version_num: conn.server_version_num(),
            backend_pid: conn.backend_pid(),
            conn: Mutex::new(Some(conn)),
            pool,
            parameters,
            application_name: std::sync::Mutex::new(application_name),
            user_transaction: AtomicBool::new(false),
            in_error: AtomicBool::new(false),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.parameters.host
    }

    pub fn port(&self) -> u16 {
        self.parameters.port
    }

    pub fn database_name(&self) -> &str {
        &self.parameters.dbname
    }

    pub fn user_name(&self) -> &str {
        &self.parameters.user
    }

    pub fn application_name(&self) -> Option<String> {
        match self.application_name.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn cache_application_name(&self, name: &str) {
        let mut slot = match self.application_name.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(name.to_string());
    }

    /// `(major, minor, patch)` decoded from the numeric server version.
    pub fn server_version(&self) -> (u32, u32, u32) {
        let v = self.server_version_num;
        (v / 10000, (v / 100) % 100, v % 100)
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Statement that cancels whatever this session is running, for use on a
    /// different connection.
    pub fn cancellation_query(&self) -> String {
        format!("SELECT pg_cancel_backend ({})", self.backend_pid)
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Whether the current transaction was opened by the user rather than implicitly.
    pub fn user_transaction(&self) -> bool {
        self.user_transaction.load(Ordering::SeqCst)
    }

    pub fn set_user_transaction(&self, value: bool) {
        self.user_transaction.store(value, Ordering::SeqCst);
    }

    async fn lock(&self) -> MutexGuard<'_, Option<PhysicalConnection>> {
        self.conn.lock().await
    }

    pub async fn is_released(&self) -> bool {
        self.lock().await.is_none()
    }

    pub async fn autocommit(&self) -> DbResult<bool> {
        let guard = self.lock().await;
        let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
        Ok(conn.autocommit())
    }

    pub async fn set_autocommit(&self, autocommit: bool) -> DbResult<()> {
        let mut guard = self.lock().await;
        let conn = guard.as_mut().ok_or(DbError::ConnectionReleased)?;
        conn.set_autocommit(autocommit)
    }

    /// Driver-reported status; `Unknown` once released.
    pub async fn transaction_status(&self) -> TransactionStatus {
        match self.lock().await.as_ref() {
            Some(conn) => conn.transaction_status(),
            None => TransactionStatus::Unknown,
        }
    }

    pub async fn transaction_in_trans(&self) -> bool {
        self.transaction_status().await == TransactionStatus::InTransaction
    }

    pub async fn transaction_in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
            || self.transaction_status().await == TransactionStatus::InError
    }

    pub async fn transaction_is_idle(&self) -> bool {
        self.transaction_status().await == TransactionStatus::Idle
    }

    pub async fn execute_statement(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut guard = self.lock().await;
        let conn = guard.as_mut().ok_or(DbError::ConnectionReleased)?;
        let before = conn.transaction_status();
        let explicit = conn.autocommit();
        let result = conn.execute(sql, params).await;
        self.observe(before, conn.transaction_status(), explicit, result.is_err());
        result
    }

    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut guard = self.lock().await;
        let conn = guard.as_mut().ok_or(DbError::ConnectionReleased)?;
        let before = conn.transaction_status();
        let explicit = conn.autocommit();
        let result = conn.fetch_all(sql, params).await;
        self.observe(before, conn.transaction_status(), explicit, result.is_err());
        result
    }

    pub async fn fetch_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    /// Update the sticky flags after a statement. `explicit` is true when the session
    /// was in autocommit mode, so a transaction opened by the statement was user-issued.
    fn observe(
        &self,
        before: TransactionStatus,
        after: TransactionStatus,
        explicit: bool,
        failed: bool,
    ) {
        match after {
            TransactionStatus::Idle => {
                self.user_transaction.store(false, Ordering::SeqCst);
                self.in_error.store(false, Ordering::SeqCst);
            }
            TransactionStatus::InTransaction if explicit && before == TransactionStatus::Idle => {
                self.user_transaction.store(true, Ordering::SeqCst);
            }
            TransactionStatus::InError => self.in_error.store(true, Ordering::SeqCst),
            _ => {}
        }
        if failed && after != TransactionStatus::Idle {
            self.in_error.store(true, Ordering::SeqCst);
        }
    }

    /// Names of the non-template databases on the server.
    pub async fn list_databases(&self) -> DbResult<Vec<String>> {
        let rows = self.fetch_all(LIST_DATABASES_SQL, &[]).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.get("datname") {
                Some(JsonValue::String(name)) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.execute_statement("COMMIT", &[]).await.map(|_| ())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.execute_statement("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Round-trip to prove the session is alive.
    pub async fn check(&self) -> DbResult<()> {
        let mut guard = self.lock().await;
        let conn = guard.as_mut().ok_or(DbError::ConnectionReleased)?;
        conn.ping().await
    }

    pub async fn set_application_name(&self, name: &str) -> DbResult<()> {
        self.fetch_all(SET_APPLICATION_NAME_SQL, &[QueryParam::from(name)])
            .await?;
        self.cache_application_name(name);
        Ok(())
    }

    /// Close the physical connection. A dedicated connection is then handed to its
    /// pool, which frees the slot.
    pub async fn close(&self) -> DbResult<()> {
        let Some(mut conn) = self.take_physical().await else {
            return Ok(());
        };
        let result = conn.close().await;
        match &self.pool {
            Some(pool) => pool.put(conn).await,
            None => drop(conn),
        }
        debug!(backend_pid = self.backend_pid, "Closed server connection");
        result
    }

    /// Close the physical connection and let `pool` free its slot.
    pub(crate) async fn discard_to(&self, pool: &ConnectionPool) {
        if let Some(mut conn) = self.take_physical().await {
            if let Err(e) = conn.close().await {
                debug!(
                    backend_pid = self.backend_pid,
                    error = %e,
                    "Error closing discarded connection"
                );
            }
            pool.put(conn).await;
        }
    }

    /// Hand a dedicated connection back to its pool unclosed.
    pub async fn return_to_pool(&self) -> DbResult<()> {
        let Some(pool) = &self.pool else {
            return Err(DbError::invalid_input(
                "Connection is not bound to a pool",
            ));
        };
        let conn = self
            .take_physical()
            .await
            .ok_or(DbError::ConnectionReleased)?;
        pool.put(conn).await;
        Ok(())
    }

    /// Return the physical connection to `pool`. No-op when already released.
    pub(crate) async fn release_to(&self, pool: &ConnectionPool) {
        if let Some(conn) = self.take_physical().await {
            pool.put(conn).await;
        }
    }

    pub(crate) async fn take_physical(&self) -> Option<PhysicalConnection> {
        self.lock().await.take()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if self.conn.get_mut().is_some() {
            warn!(
                backend_pid = self.backend_pid,
                "Server connection dropped without being released"
            );
        }
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("host", &self.parameters.host)
            .field("database", &self.parameters.dbname)
            .field("backend_pid", &self.backend_pid)
            .field("has_pool", &self.has_pool())
            .finish_non_exhaustive()
    }
}
