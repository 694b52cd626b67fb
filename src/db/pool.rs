//! Bounded pool of physical connections for one target.
//!
//! # Design
//!
//! - A semaphore with `max_size` permits bounds connections handed out. A permit is
//!   detached from the semaphore at checkout and travels with the connection as a
//!   [`Checkout`] until the connection is returned with [`ConnectionPool::put`].
//!   Connections held outside the pool (open transactions, dedicated connections)
//!   therefore keep counting against `max_size`.
//! - Idle connections live in a FIFO queue. At checkout they are dropped when older
//!   than `max_lifetime` or idle longer than `max_idle`, and pinged when `check` is
//!   set.
//! - New connections come from the [`ConnectionFactory`]. Failed attempts are retried
//!   with capped exponential backoff until the checkout deadline, except for errors
//!   that [`DbError::is_fatal_for_connect`] reports as fatal.
//! - A connection dropped without being returned gives back its permit and its slot
//!   in `size`, so a cancelled caller cannot shrink the pool.

use crate::db::driver::{DriverConnection, TransactionStatus};
use crate::db::factory::ConnectionFactory;
use crate::error::DbError;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// First delay between failed connect attempts.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Upper bound for the delay between failed connect attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Configuration for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name; the manager uses the connection details hash.
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    /// How long a checkout, or opening the pool, may wait.
    pub timeout: Duration,
    pub max_idle: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    /// Ping idle connections before handing them out.
    pub check: bool,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_size: usize, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            min_size: 0,
            max_size: max_size.max(1),
            timeout,
            max_idle: None,
            max_lifetime: None,
            check: true,
        }
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size.min(self.max_size);
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = Some(max_lifetime);
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a connection from pool {pool}")]
    Timeout { pool: String },

    #[error("pool {pool} is closed")]
    Closed { pool: String },

    #[error(transparent)]
    Connect(#[from] DbError),
}

impl From<PoolError> for DbError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Connect(e) => e,
            PoolError::Closed { .. } => {
                DbError::connection(err.to_string(), "Reconnect to the database")
            }
            PoolError::Timeout { .. } => DbError::connection(
                err.to_string(),
                "Retry once open transactions have finished",
            ),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Connections currently open, idle or checked out.
    pub pool_size: usize,
    /// Idle connections ready for checkout.
    pub pool_available: usize,
    pub requests_waiting: usize,
    pub requests_num: usize,
    /// Checkouts that failed, mostly timeouts.
    pub requests_errors: usize,
    pub connections_num: usize,
    pub connections_errors: usize,
    /// Idle connections found broken at checkout.
    pub connections_lost: usize,
}

/// A checkout slot travelling with a connection outside the pool.
struct Checkout {
    slots: Arc<Semaphore>,
    size: Arc<AtomicUsize>,
    /// Whether a live connection is accounted in `size` for this slot.
    counted: bool,
    finished: bool,
}

impl Checkout {
    fn new(slots: Arc<Semaphore>, size: Arc<AtomicUsize>) -> Self {
        Self {
            slots,
            size,
            counted: false,
            finished: false,
        }
    }

    fn finish(mut self, keep: bool) {
        if self.counted && !keep {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        self.slots.add_permits(1);
        self.finished = true;
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.counted {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        self.slots.add_permits(1);
    }
}

/// A physical connection owned by a pool.
///
/// Dereferences to the driver connection. Hand it back with
/// [`ConnectionPool::put`]; dropping it instead closes the session.
pub struct PhysicalConnection {
    conn: Box<dyn DriverConnection>,
    created_at: Instant,
    checkout: Option<Checkout>,
}

impl PhysicalConnection {
    fn new(conn: Box<dyn DriverConnection>) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
            checkout: None,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl Deref for PhysicalConnection {
    type Target = dyn DriverConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PhysicalConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("backend_pid", &self.conn.backend_pid())
            .field("status", &self.conn.transaction_status())
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

struct IdleEntry {
    conn: PhysicalConnection,
    idle_since: Instant,
}

#[derive(Debug, Default)]
struct PoolCounters {
    requests_waiting: AtomicUsize,
    requests_num: AtomicUsize,
    requests_errors: AtomicUsize,
    connections_num: AtomicUsize,
    connections_errors: AtomicUsize,
    connections_lost: AtomicUsize,
}

/// Decrements the waiting counter even if the checkout future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: ConnectionFactory,
    idle: Mutex<VecDeque<IdleEntry>>,
    slots: Arc<Semaphore>,
    size: Arc<AtomicUsize>,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: ConnectionFactory) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_size));
        Self {
            config,
            factory,
            idle: Mutex::new(VecDeque::new()),
            slots,
            size: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open the pool and wait until `max(min_size, 1)` connections are live.
    pub async fn open(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let target = self.config.min_size.max(1);
        while self.size.load(Ordering::SeqCst) < target {
            let mut conn = self.open_connection(deadline).await?;
            conn.checkout = None;
            self.push_idle(conn);
        }
        info!(
            pool = %self.config.name,
            size = self.size.load(Ordering::SeqCst),
            max_size = self.config.max_size,
            "Connection pool opened"
        );
        Ok(())
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub async fn get(&self) -> Result<PhysicalConnection, PoolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.counters.requests_num.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.config.timeout;

        let permit = {
            let _waiting = WaitingGuard::enter(&self.counters.requests_waiting);
            tokio::time::timeout_at(deadline, self.slots.acquire()).await
        };
        match permit {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                self.counters.requests_errors.fetch_add(1, Ordering::SeqCst);
                return Err(self.timeout_error());
            }
        }

        let mut checkout = Checkout::new(self.slots.clone(), self.size.clone());
        match self.take_or_open(deadline, &mut checkout).await {
            Ok(mut conn) => {
                conn.checkout = Some(checkout);
                Ok(conn)
            }
            Err(e) => {
                self.counters.requests_errors.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn take_or_open(
        &self,
        deadline: tokio::time::Instant,
        checkout: &mut Checkout,
    ) -> Result<PhysicalConnection, PoolError> {
        loop {
            let Some(entry) = self.lock_idle().pop_front() else {
                break;
            };
            checkout.counted = true;
            let expired = self.is_expired(&entry);
            let mut conn = entry.conn;

            if expired {
                debug!(pool = %self.config.name, "Closing expired idle connection");
                self.discard(conn).await;
                checkout.counted = false;
                continue;
            }
            if self.config.check {
                if let Err(e) = conn.ping().await {
                    warn!(
                        pool = %self.config.name,
                        error = %e,
                        "Discarding broken idle connection"
                    );
                    self.counters.connections_lost.fetch_add(1, Ordering::SeqCst);
                    self.discard(conn).await;
                    checkout.counted = false;
                    continue;
                }
            }
            return Ok(conn);
        }

        let conn = self.open_connection(deadline).await?;
        checkout.counted = true;
        Ok(conn)
    }

    async fn open_connection(
        &self,
        deadline: tokio::time::Instant,
    ) -> Result<PhysicalConnection, PoolError> {
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }
            match tokio::time::timeout_at(deadline, self.factory.connect()).await {
                Ok(Ok(conn)) => {
                    self.size.fetch_add(1, Ordering::SeqCst);
                    self.counters.connections_num.fetch_add(1, Ordering::SeqCst);
                    return Ok(PhysicalConnection::new(conn));
                }
                Ok(Err(e)) => {
                    self.counters
                        .connections_errors
                        .fetch_add(1, Ordering::SeqCst);
                    if e.is_fatal_for_connect() {
                        return Err(PoolError::Connect(e));
                    }
                    debug!(
                        pool = %self.config.name,
                        error = %e,
                        "Connect attempt failed, retrying"
                    );
                }
                Err(_) => return Err(self.timeout_error()),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(self.timeout_error());
            }
            tokio::time::sleep_until((now + delay).min(deadline)).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Return a checked-out connection.
    ///
    /// Connections left inside a transaction are rolled back. Connections that are
    /// broken, cannot be reset, have outlived `max_lifetime`, or come back after the
    /// pool closed are closed instead of being kept.
    pub async fn put(&self, mut conn: PhysicalConnection) {
        let Some(checkout) = conn.checkout.take() else {
            warn!(pool = %self.config.name, "Closing connection that was not checked out");
            self.close_connection(&mut conn).await;
            return;
        };
        if !Arc::ptr_eq(&checkout.slots, &self.slots) {
            warn!(pool = %self.config.name, "Closing connection returned to the wrong pool");
            self.close_connection(&mut conn).await;
            drop(checkout);
            return;
        }

        let too_old = self
            .config
            .max_lifetime
            .is_some_and(|lifetime| conn.age() >= lifetime);
        let keep = !self.is_closed() && !too_old && self.reset(&mut conn).await;
        if keep {
            self.push_idle(conn);
        } else {
            self.close_connection(&mut conn).await;
        }
        checkout.finish(keep);
    }

    async fn reset(&self, conn: &mut PhysicalConnection) -> bool {
        if conn.is_closed() {
            return false;
        }
        match conn.transaction_status() {
            TransactionStatus::Idle => {}
            TransactionStatus::InTransaction | TransactionStatus::InError => {
                warn!(
                    pool = %self.config.name,
                    backend_pid = conn.backend_pid(),
                    "Rolling back connection returned inside a transaction"
                );
                if conn.execute("ROLLBACK", &[]).await.is_err()
                    || conn.transaction_status() != TransactionStatus::Idle
                {
                    return false;
                }
            }
            TransactionStatus::Unknown => return false,
        }
        conn.set_autocommit(true).is_ok()
    }

    /// Close idle connections and refuse further checkouts. Connections still checked
    /// out are closed when they come back.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.close();
        let drained: Vec<IdleEntry> = self.lock_idle().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            self.discard(entry.conn).await;
        }
        info!(pool = %self.config.name, closed_idle = count, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_name: self.config.name.clone(),
            pool_min: self.config.min_size,
            pool_max: self.config.max_size,
            pool_size: self.size.load(Ordering::SeqCst),
            pool_available: self.lock_idle().len(),
            requests_waiting: self.counters.requests_waiting.load(Ordering::SeqCst),
            requests_num: self.counters.requests_num.load(Ordering::SeqCst),
            requests_errors: self.counters.requests_errors.load(Ordering::SeqCst),
            connections_num: self.counters.connections_num.load(Ordering::SeqCst),
            connections_errors: self.counters.connections_errors.load(Ordering::SeqCst),
            connections_lost: self.counters.connections_lost.load(Ordering::SeqCst),
        }
    }

    fn push_idle(&self, conn: PhysicalConnection) {
        self.lock_idle().push_back(IdleEntry {
            conn,
            idle_since: Instant::now(),
        });
    }

    async fn close_connection(&self, conn: &mut PhysicalConnection) {
        if let Err(e) = conn.close().await {
            debug!(
                pool = %self.config.name,
                backend_pid = conn.backend_pid(),
                error = %e,
                "Error closing connection"
            );
        }
    }

    /// Close a connection that holds no checkout slot and forget it.
    async fn discard(&self, mut conn: PhysicalConnection) {
        self.close_connection(&mut conn).await;
        self.size.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_expired(&self, entry: &IdleEntry) -> bool {
        let too_old = self
            .config
            .max_lifetime
            .is_some_and(|lifetime| entry.conn.age() >= lifetime);
        let idle_too_long = self
            .config
            .max_idle
            .is_some_and(|max_idle| entry.idle_since.elapsed() >= max_idle);
        too_old || idle_too_long
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleEntry>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn timeout_error(&self) -> PoolError {
        PoolError::Timeout {
            pool: self.config.name.clone(),
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.config.name.clone(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
