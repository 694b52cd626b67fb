//! Connection manager: owners, pools and dedicated connections.
//!
//! # Architecture
//!
//! An *owner* is an opaque key (an editor document, a session, a tool call) that holds
//! at most one set of connection details. Owners whose details hash alike share one
//! [`ConnectionPool`]; the pool is closed when its last owner disconnects.
//!
//! ```text
//! owner_uri ──> OwnerEntry { details, details_hash, pool } ──> ConnectionPool (per hash)
//!           ──> ConnectionInfo
//!           ──> active transaction connection (at most one)
//!           ──> orphaned connections (one per ConnectionType)
//! ```
//!
//! `connect`, `disconnect` and `transfer_connection` are queued to a single worker task
//! and run in submission order. Everything else runs in the caller's task. The state
//! lock is never held across pool creation, checkout or any other I/O.
//!
//! # Returning connections
//!
//! A connection handed out by [`ConnectionManager::get_pooled_connection`] is given
//! back when its scope is released:
//!
//! - inside a transaction, or failed with autocommit off: kept as the owner's active
//!   transaction connection, and the next scope for that owner resumes it;
//! - otherwise: autocommit is switched back on and the connection returns to the pool.
//!
//! A kept connection whose owner has meanwhile disconnected is closed instead.

use crate::config::{ConnectConfig, DEFAULT_APPLICATION_NAME, ManagerOptions};
use crate::db::credentials::{TokenFetcher, TokenRefresher};
use crate::db::driver::Connector;
use crate::db::error_log::ConnectionErrorLog;
use crate::db::factory::{ConnectionFactory, SharedDetails, read_details, shared_details};
use crate::db::pool::{ConnectionPool, PhysicalConnection, PoolConfig, PoolError, PoolStats};
use crate::db::scoped::{ConnectionLease, ScopedConnection};
use crate::db::server_connection::ServerConnection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionDetails, ConnectionInfo, ConnectionSummary, ConnectionType, ServerInfo,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct OwnerEntry {
    details: SharedDetails,
    details_hash: String,
    pool: Arc<ConnectionPool>,
}

#[derive(Default)]
struct ManagerState {
    closed: bool,
    /// Pools by details hash.
    pools: HashMap<String, Arc<ConnectionPool>>,
    /// Owners registered on each pool, by details hash.
    pool_owners: HashMap<String, HashSet<String>>,
    owners: HashMap<String, OwnerEntry>,
    infos: HashMap<String, ConnectionInfo>,
    active_tx: HashMap<String, Arc<ServerConnection>>,
    orphans: HashMap<String, HashMap<ConnectionType, Arc<ServerConnection>>>,
}

impl ManagerState {
    /// Owners of the pool for `details_hash` that currently hold a transaction open.
    fn active_transactions(&self, details_hash: &str) -> usize {
        self.active_tx
            .keys()
            .filter(|owner| {
                self.owners
                    .get(*owner)
                    .is_some_and(|entry| entry.details_hash == details_hash)
            })
            .count()
    }
}

enum ManagerTask {
    Connect {
        owner_uri: String,
        details: ConnectionDetails,
        config: Option<ConnectConfig>,
        reply: oneshot::Sender<DbResult<ConnectionInfo>>,
    },
    Disconnect {
        owner_uri: String,
        reply: oneshot::Sender<DbResult<bool>>,
    },
    Transfer {
        old_owner_uri: String,
        new_owner_uri: String,
        reply: oneshot::Sender<DbResult<bool>>,
    },
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    error_log: Arc<ConnectionErrorLog>,
    refresher: Arc<TokenRefresher>,
}

/// Owns every pool and owner registration of one client.
///
/// Cheap to clone. The worker task stops once every clone has been dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    tasks: mpsc::Sender<ManagerTask>,
}

impl ConnectionManager {
    /// Create a manager and spawn its worker. Must be called inside a tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, options: ManagerOptions) -> Self {
        let (tasks, rx) = mpsc::channel(options.worker_queue_capacity_or_default());
        let inner = Arc::new(ManagerInner {
            connector,
            options,
            state: Mutex::new(ManagerState::default()),
            error_log: Arc::new(ConnectionErrorLog::new()),
            refresher: Arc::new(TokenRefresher::new()),
        });
        tokio::spawn(run_worker(inner.clone(), rx));
        Self { inner, tasks }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Connect `owner_uri` with `details`.
    ///
    /// Connecting again with details that hash alike returns the stored info
    /// unchanged. Different details disconnect the owner first.
    pub async fn connect(
        &self,
        owner_uri: &str,
        details: ConnectionDetails,
        config: Option<ConnectConfig>,
    ) -> DbResult<ConnectionInfo> {
        let (reply, rx) = oneshot::channel();
        self.submit(ManagerTask::Connect {
            owner_uri: owner_uri.to_string(),
            details,
            config,
            reply,
        })
        .await?;
        rx.await.map_err(|_| worker_stopped())?
    }

    /// Release everything held by `owner_uri`. Returns `false` when the owner had no
    /// connection info.
    pub async fn disconnect(&self, owner_uri: &str) -> DbResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(ManagerTask::Disconnect {
            owner_uri: owner_uri.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| worker_stopped())?
    }

    /// Move the connection of `old_owner_uri` to `new_owner_uri`, disconnecting the
    /// latter first. Returns `false` when the old owner had no connection info.
    pub async fn transfer_connection(
        &self,
        old_owner_uri: &str,
        new_owner_uri: &str,
    ) -> DbResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(ManagerTask::Transfer {
            old_owner_uri: old_owner_uri.to_string(),
            new_owner_uri: new_owner_uri.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| worker_stopped())?
    }

    async fn submit(&self, task: ManagerTask) -> DbResult<()> {
        self.tasks.send(task).await.map_err(|_| worker_stopped())
    }

    /// A scope over a connection from the owner's pool.
    ///
    /// When the owner holds an open transaction the scope resumes that connection
    /// instead of checking out a new one. `None` for unknown owners.
    pub async fn get_pooled_connection(&self, owner_uri: &str) -> Option<ScopedConnection> {
        let state = self.inner.state.lock().await;
        let entry = state.owners.get(owner_uri)?;
        let lease = PooledLease {
            manager: self.inner.clone(),
            owner_uri: owner_uri.to_string(),
            pool: entry.pool.clone(),
            resume: state.active_tx.get(owner_uri).cloned(),
        };
        Some(ScopedConnection::new(Arc::new(lease)))
    }

    /// The owner's dedicated connection of `connection_type`, created on first use.
    ///
    /// A cached connection that is not inside a transaction is checked for liveness
    /// first and replaced when the check fails.
    pub async fn get_orphaned_connection(
        &self,
        owner_uri: &str,
        connection_type: ConnectionType,
    ) -> DbResult<Option<Arc<ServerConnection>>> {
        self.inner
            .get_orphaned_connection(owner_uri, connection_type)
            .await
    }

    /// Close the owner's dedicated connection of `connection_type`. Returns `false`
    /// when there was none.
    pub async fn close_orphaned_connection(
        &self,
        owner_uri: &str,
        connection_type: ConnectionType,
    ) -> DbResult<bool> {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let removed = state
                .orphans
                .get_mut(owner_uri)
                .and_then(|orphans| orphans.remove(&connection_type));
            if state.orphans.get(owner_uri).is_some_and(HashMap::is_empty) {
                state.orphans.remove(owner_uri);
            }
            removed
        };
        let Some(conn) = removed else {
            return Ok(false);
        };
        if let Err(e) = conn.close().await {
            warn!(
                owner_uri = %owner_uri,
                connection_type = %connection_type,
                error = %e,
                "Error closing orphaned connection"
            );
        }
        Ok(true)
    }

    pub async fn get_connection_info(&self, owner_uri: &str) -> Option<ConnectionInfo> {
        self.inner.state.lock().await.infos.get(owner_uri).cloned()
    }

    /// The details the owner's pool currently connects with, including a refreshed
    /// access token.
    pub async fn get_connection_details(&self, owner_uri: &str) -> Option<ConnectionDetails> {
        let state = self.inner.state.lock().await;
        state
            .owners
            .get(owner_uri)
            .map(|entry| read_details(&entry.details).clone())
    }

    /// Stats of every open pool, keyed by pool name.
    pub async fn get_pool_stats(&self) -> HashMap<String, PoolStats> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .values()
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect()
    }

    /// Install the capability used to renew expired access tokens.
    pub fn set_fetch_azure_token(&self, fetcher: Arc<dyn TokenFetcher>) {
        self.inner.refresher.set_fetcher(fetcher);
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Release every connection and close every pool. The manager refuses new
    /// connects afterwards.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

fn worker_stopped() -> DbError {
    DbError::internal("connection manager worker has stopped")
}

async fn run_worker(inner: Arc<ManagerInner>, mut rx: mpsc::Receiver<ManagerTask>) {
    while let Some(task) = rx.recv().await {
        match task {
            ManagerTask::Connect {
                owner_uri,
                details,
                config,
                reply,
            } => {
                let result = inner.connect_inner(&owner_uri, details, config).await;
                let _ = reply.send(result);
            }
            ManagerTask::Disconnect { owner_uri, reply } => {
                let result = inner.disconnect_inner(&owner_uri).await;
                let _ = reply.send(result);
            }
            ManagerTask::Transfer {
                old_owner_uri,
                new_owner_uri,
                reply,
            } => {
                let result = inner.transfer_inner(&old_owner_uri, &new_owner_uri).await;
                let _ = reply.send(result);
            }
        }
    }
    debug!("Connection manager worker stopped");
}

impl ManagerInner {
    async fn connect_inner(
        &self,
        owner_uri: &str,
        details: ConnectionDetails,
        config: Option<ConnectConfig>,
    ) -> DbResult<ConnectionInfo> {
        let details_hash = details.to_hash();
        let registered = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(DbError::ManagerClosed);
            }
            match state.owners.get(owner_uri) {
                Some(entry) if entry.details_hash == details_hash => {
                    if let Some(info) = state.infos.get(owner_uri) {
                        debug!(owner_uri = %owner_uri, "Already connected with the same details");
                        return Ok(info.clone());
                    }
                    true
                }
                Some(_) => true,
                None => state.infos.contains_key(owner_uri),
            }
        };
        if registered {
            self.disconnect_inner(owner_uri).await?;
        }

        let config = config.unwrap_or_default();
        let existing = self.state.lock().await.pools.get(&details_hash).cloned();
        let (pool, created) = match existing {
            Some(pool) => (pool, false),
            None => {
                let shared = shared_details(details.clone());
                (self.create_pool(shared, &details_hash, &config).await?, true)
            }
        };

        {
            let mut state = self.state.lock().await;
            if state.closed {
                drop(state);
                if created {
                    pool.close().await;
                }
                return Err(DbError::ManagerClosed);
            }
            state
                .pools
                .entry(details_hash.clone())
                .or_insert_with(|| pool.clone());
            state
                .pool_owners
                .entry(details_hash.clone())
                .or_default()
                .insert(owner_uri.to_string());
            state.owners.insert(
                owner_uri.to_string(),
                OwnerEntry {
                    details: pool.factory().details().clone(),
                    details_hash: details_hash.clone(),
                    pool: pool.clone(),
                },
            );
        }

        let info = match self.describe(owner_uri, &details, &pool).await {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    owner_uri = %owner_uri,
                    error = %e,
                    "Connect failed after registration, rolling back"
                );
                self.disconnect_inner(owner_uri).await?;
                return Err(e);
            }
        };

        self.state
            .lock()
            .await
            .infos
            .insert(owner_uri.to_string(), info.clone());
        info!(
            owner_uri = %owner_uri,
            details_hash = %details_hash,
            connection_id = %info.connection_id,
            "Connected"
        );
        Ok(info)
    }

    async fn create_pool(
        &self,
        details: SharedDetails,
        details_hash: &str,
        config: &ConnectConfig,
    ) -> DbResult<Arc<ConnectionPool>> {
        let (timeout, target) = {
            let current = read_details(&details);
            (
                self.options.pool_timeout(&current),
                current.user_facing_target(),
            )
        };
        let factory = ConnectionFactory::new(
            self.connector.clone(),
            details,
            self.error_log.clone(),
        )
        .with_credential_refresh(self.refresher.clone());
        let pool_config = PoolConfig::new(
            details_hash,
            self.options.max_pool_size_or(config),
            timeout,
        )
        .with_min_size(self.options.min_pool_size_or_default())
        .with_max_idle(self.options.max_idle_or_default())
        .with_max_lifetime(self.options.max_lifetime_or_default())
        .with_check(self.options.check_on_checkout_or_default());
        info!(
            details_hash = %details_hash,
            max_size = pool_config.max_size,
            timeout_ms = timeout.as_millis() as u64,
            "Creating connection pool"
        );
        let pool = Arc::new(ConnectionPool::new(pool_config, factory));

        match pool.open(timeout).await {
            Ok(()) => {
                // Failures that were retried away are no longer interesting.
                self.error_log.take(details_hash);
                Ok(pool)
            }
            Err(PoolError::Timeout { .. }) => {
                pool.close().await;
                let errors = self.error_log.take(details_hash);
                warn!(
                    details_hash = %details_hash,
                    errors = errors.len(),
                    "Pool initialization timed out"
                );
                Err(DbError::connect_timeout(target, errors))
            }
            Err(e) => {
                pool.close().await;
                self.error_log.take(details_hash);
                Err(DbError::from(e).with_target(target))
            }
        }
    }

    /// Check out one connection to build the owner's connection info.
    async fn describe(
        &self,
        owner_uri: &str,
        details: &ConnectionDetails,
        pool: &Arc<ConnectionPool>,
    ) -> DbResult<ConnectionInfo> {
        let conn = ServerConnection::new(self.checkout(pool).await?, None);
        let info = ConnectionInfo {
            owner_uri: owner_uri.to_string(),
            connection_id: Uuid::new_v4().simple().to_string(),
            connection_summary: ConnectionSummary {
                server_name: details.host.clone(),
                database_name: conn.database_name().to_string(),
                user_name: conn.user_name().to_string(),
            },
            server_info: ServerInfo::postgres(conn.server_version(), details.is_cloud_host()),
            connection_details: details.clone(),
        };
        conn.release_to(pool).await;
        Ok(info)
    }

    async fn checkout(&self, pool: &ConnectionPool) -> DbResult<PhysicalConnection> {
        match pool.get().await {
            Ok(conn) => Ok(conn),
            Err(PoolError::Timeout { .. }) => Err(self.checkout_timeout(pool).await),
            Err(PoolError::Closed { .. }) => Err(DbError::PoolClosed {
                target: pool.factory().user_facing_target(),
            }),
            Err(PoolError::Connect(e)) => {
                Err(e.with_target(pool.factory().user_facing_target()))
            }
        }
    }

    async fn checkout_timeout(&self, pool: &ConnectionPool) -> DbError {
        let stats = pool.stats();
        let target = pool.factory().user_facing_target();
        let errors = self.error_log.take(pool.name());
        if stats.pool_size == 0 {
            return DbError::unreachable(target, errors);
        }
        let active_tx = self.state.lock().await.active_transactions(pool.name());
        warn!(
            details_hash = %pool.name(),
            pool_size = stats.pool_size,
            active_tx,
            "Timed out checking out a connection"
        );
        DbError::CheckoutTimeout {
            target,
            pool_size: stats.pool_size,
            pool_max: stats.pool_max,
            active_tx,
            errors,
        }
    }

    async fn disconnect_inner(&self, owner_uri: &str) -> DbResult<bool> {
        let (had_info, entry, active, orphans, pool_to_close) = {
            let mut state = self.state.lock().await;
            let had_info = state.infos.remove(owner_uri).is_some();
            let entry = state.owners.remove(owner_uri);
            let active = state.active_tx.remove(owner_uri);
            let orphans = state.orphans.remove(owner_uri).unwrap_or_default();
            let mut pool_to_close = None;
            if let Some(entry) = &entry {
                let last_owner = match state.pool_owners.get_mut(&entry.details_hash) {
                    Some(owners) => {
                        owners.remove(owner_uri);
                        owners.is_empty()
                    }
                    None => true,
                };
                if last_owner {
                    state.pool_owners.remove(&entry.details_hash);
                    pool_to_close = state.pools.remove(&entry.details_hash);
                }
            }
            (had_info, entry, active, orphans, pool_to_close)
        };

        if let (Some(conn), Some(entry)) = (active, &entry) {
            debug!(owner_uri = %owner_uri, "Closing open transaction connection");
            conn.discard_to(&entry.pool).await;
        }
        for (connection_type, conn) in orphans {
            if let Err(e) = conn.close().await {
                warn!(
                    owner_uri = %owner_uri,
                    connection_type = %connection_type,
                    error = %e,
                    "Error closing orphaned connection"
                );
            }
        }
        if let Some(pool) = pool_to_close {
            pool.close().await;
            self.error_log.take(pool.name());
            info!(details_hash = %pool.name(), "Closed pool after last owner disconnected");
        }

        if had_info {
            info!(owner_uri = %owner_uri, "Disconnected");
        }
        Ok(had_info)
    }

    async fn transfer_inner(&self, old_owner_uri: &str, new_owner_uri: &str) -> DbResult<bool> {
        if old_owner_uri == new_owner_uri {
            return Ok(self.state.lock().await.infos.contains_key(old_owner_uri));
        }
        let new_registered = {
            let state = self.state.lock().await;
            state.owners.contains_key(new_owner_uri) || state.infos.contains_key(new_owner_uri)
        };
        if new_registered {
            self.disconnect_inner(new_owner_uri).await?;
        }

        let mut state = self.state.lock().await;
        let Some(mut info) = state.infos.remove(old_owner_uri) else {
            return Ok(false);
        };
        info.owner_uri = new_owner_uri.to_string();
        state.infos.insert(new_owner_uri.to_string(), info);

        if let Some(entry) = state.owners.remove(old_owner_uri) {
            if let Some(owners) = state.pool_owners.get_mut(&entry.details_hash) {
                owners.remove(old_owner_uri);
                owners.insert(new_owner_uri.to_string());
            }
            state.owners.insert(new_owner_uri.to_string(), entry);
        }
        if let Some(conn) = state.active_tx.remove(old_owner_uri) {
            state.active_tx.insert(new_owner_uri.to_string(), conn);
        }
        if let Some(orphans) = state.orphans.remove(old_owner_uri) {
            state.orphans.insert(new_owner_uri.to_string(), orphans);
        }
        info!(
            old_owner_uri = %old_owner_uri,
            new_owner_uri = %new_owner_uri,
            "Transferred connection"
        );
        Ok(true)
    }

    /// Apply the return policy to a connection released by a scope.
    async fn put_connection(
        &self,
        owner_uri: &str,
        conn: Arc<ServerConnection>,
        pool: &Arc<ConnectionPool>,
    ) -> DbResult<()> {
        let retain = conn.transaction_in_trans().await
            || (conn.transaction_in_error().await && !conn.autocommit().await.unwrap_or(true));

        if retain {
            let previous = {
                let mut state = self.state.lock().await;
                let owned = state
                    .owners
                    .get(owner_uri)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.pool, pool));
                if !owned {
                    drop(state);
                    warn!(
                        owner_uri = %owner_uri,
                        "Owner is gone, closing its transaction connection"
                    );
                    conn.discard_to(pool).await;
                    return Ok(());
                }
                state
                    .active_tx
                    .insert(owner_uri.to_string(), conn.clone())
            };
            if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &conn)) {
                warn!(owner_uri = %owner_uri, "Replacing open transaction connection");
                previous.discard_to(pool).await;
            }
            debug!(owner_uri = %owner_uri, "Keeping connection with open transaction");
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if state
                .active_tx
                .get(owner_uri)
                .is_some_and(|current| Arc::ptr_eq(current, &conn))
            {
                state.active_tx.remove(owner_uri);
            }
        }
        if let Err(e) = conn.set_autocommit(true).await {
            debug!(
                owner_uri = %owner_uri,
                error = %e,
                "Could not restore autocommit before returning connection"
            );
        }
        conn.release_to(pool).await;
        Ok(())
    }

    async fn get_orphaned_connection(
        &self,
        owner_uri: &str,
        connection_type: ConnectionType,
    ) -> DbResult<Option<Arc<ServerConnection>>> {
        let (pool, cached) = {
            let state = self.state.lock().await;
            let Some(entry) = state.owners.get(owner_uri) else {
                return Ok(None);
            };
            let cached = state
                .orphans
                .get(owner_uri)
                .and_then(|orphans| orphans.get(&connection_type))
                .cloned();
            (entry.pool.clone(), cached)
        };

        if let Some(conn) = cached {
            if conn.transaction_in_trans().await || conn.transaction_in_error().await {
                return Ok(Some(conn));
            }
            match conn.check().await {
                Ok(()) => return Ok(Some(conn)),
                Err(e) => {
                    warn!(
                        owner_uri = %owner_uri,
                        connection_type = %connection_type,
                        error = %e,
                        "Orphaned connection failed liveness check, replacing it"
                    );
                    conn.release_to(&pool).await;
                    let mut state = self.state.lock().await;
                    if let Some(orphans) = state.orphans.get_mut(owner_uri) {
                        if orphans
                            .get(&connection_type)
                            .is_some_and(|current| Arc::ptr_eq(current, &conn))
                        {
                            orphans.remove(&connection_type);
                        }
                    }
                }
            }
        }

        let conn = Arc::new(ServerConnection::new(
            self.checkout(&pool).await?,
            Some(pool.clone()),
        ));
        if let Err(e) = self.prepare_orphan(&conn, connection_type).await {
            conn.release_to(&pool).await;
            return Err(e);
        }

        let existing = {
            let mut state = self.state.lock().await;
            let owned = !state.closed
                && state
                    .owners
                    .get(owner_uri)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.pool, &pool));
            if !owned {
                None
            } else {
                match state
                    .orphans
                    .entry(owner_uri.to_string())
                    .or_default()
                    .entry(connection_type)
                {
                    Entry::Occupied(current) => Some(Some(current.get().clone())),
                    Entry::Vacant(slot) => {
                        slot.insert(conn.clone());
                        Some(None)
                    }
                }
            }
        };

        match existing {
            // Owner disconnected while the connection was being prepared.
            None => {
                conn.release_to(&pool).await;
                Ok(None)
            }
            // Another caller cached one first.
            Some(Some(current)) => {
                conn.release_to(&pool).await;
                Ok(Some(current))
            }
            Some(None) => {
                debug!(
                    owner_uri = %owner_uri,
                    connection_type = %connection_type,
                    backend_pid = conn.backend_pid(),
                    "Created orphaned connection"
                );
                Ok(Some(conn))
            }
        }
    }

    async fn prepare_orphan(
        &self,
        conn: &ServerConnection,
        connection_type: ConnectionType,
    ) -> DbResult<()> {
        conn.set_autocommit(true).await?;
        let base = conn
            .application_name()
            .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string());
        conn.set_application_name(&format!("{base} - {connection_type}"))
            .await
    }

    async fn close(&self) {
        let (owners, active, orphans, pools) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.infos.clear();
            state.pool_owners.clear();
            let owners = std::mem::take(&mut state.owners);
            let active = std::mem::take(&mut state.active_tx);
            let orphans = std::mem::take(&mut state.orphans);
            let pools = std::mem::take(&mut state.pools);
            (owners, active, orphans, pools)
        };

        for (owner_uri, conn) in active {
            match owners.get(&owner_uri) {
                Some(entry) => conn.discard_to(&entry.pool).await,
                None => {
                    let _ = conn.take_physical().await;
                }
            }
        }
        for (owner_uri, conns) in orphans {
            for (connection_type, conn) in conns {
                if let Err(e) = conn.close().await {
                    warn!(
                        owner_uri = %owner_uri,
                        connection_type = %connection_type,
                        error = %e,
                        "Error closing orphaned connection"
                    );
                }
            }
        }
        let pool_count = pools.len();
        join_all(pools.into_values().map(|pool| async move { pool.close().await })).await;
        self.error_log.clear();
        info!(pools = pool_count, "Connection manager closed");
    }
}

/// Lease backing the scopes handed out by `get_pooled_connection`.
struct PooledLease {
    manager: Arc<ManagerInner>,
    owner_uri: String,
    pool: Arc<ConnectionPool>,
    /// The owner's open transaction connection, resumed instead of checking out.
    resume: Option<Arc<ServerConnection>>,
}

#[async_trait]
impl ConnectionLease for PooledLease {
    async fn get(&self) -> DbResult<Arc<ServerConnection>> {
        if let Some(conn) = &self.resume {
            return Ok(conn.clone());
        }
        let conn = ServerConnection::new(self.manager.checkout(&self.pool).await?, None);
        if let Err(e) = conn.set_autocommit(true).await {
            conn.release_to(&self.pool).await;
            return Err(e);
        }
        Ok(Arc::new(conn))
    }

    async fn put(&self, conn: Arc<ServerConnection>) -> DbResult<()> {
        self.manager
            .put_connection(&self.owner_uri, conn, &self.pool)
            .await
    }
}
