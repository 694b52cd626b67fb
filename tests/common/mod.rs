//! In-memory driver shared by the integration tests.
//!
//! `MockConnector` hands out `MockConnection`s whose transaction status follows the
//! statements they run, like the PostgreSQL driver does. Statements containing `FAIL`
//! fail with a server error; connections can be broken by backend pid.

#![allow(dead_code)]

use async_trait::async_trait;
use dbtools_service::config::ManagerOptions;
use dbtools_service::db::{
    ConnectParams, ConnectionManager, ConnectionParameters, Connector, DriverConnection,
    TransactionStatus, TransactionTracker,
};
use dbtools_service::error::{DbError, DbResult};
use dbtools_service::models::{ConnectionDetails, QueryParam, Row};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SERVER_VERSION_NUM: u32 = 160002;

#[derive(Debug)]
pub struct MockState {
    pub connects: AtomicUsize,
    pub closed: AtomicUsize,
    fail_close: AtomicBool,
    next_pid: AtomicI32,
    failure: Mutex<Option<DbError>>,
    connect_delay: Mutex<Option<Duration>>,
    passwords: Mutex<Vec<Option<String>>>,
    statements: Mutex<Vec<(i32, String)>>,
    broken: Mutex<HashSet<i32>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            next_pid: AtomicI32::new(1000),
            failure: Mutex::new(None),
            connect_delay: Mutex::new(None),
            passwords: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            broken: Mutex::new(HashSet::new()),
        }
    }
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following connect attempt fail with a connection error.
    pub fn refuse_connections(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(DbError::connection(message, ""));
    }

    pub fn fail_connections_with(&self, error: DbError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn accept_connections(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Make closing a session report an error. The session is still closed.
    pub fn fail_closes(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn passwords(&self) -> Vec<Option<String>> {
        self.passwords.lock().unwrap().clone()
    }

    /// Statements run on the session with `pid`, including implicit `BEGIN`s.
    pub fn statements_for(&self, pid: i32) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Make the session with `pid` behave as if the server went away.
    pub fn break_connection(&self, pid: i32) {
        self.broken.lock().unwrap().insert(pid);
    }

    fn is_broken(&self, pid: i32) -> bool {
        self.broken.lock().unwrap().contains(&pid)
    }

    fn record(&self, pid: i32, sql: &str) {
        self.statements.lock().unwrap().push((pid, sql.to_string()));
    }
}

pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(state: Arc<MockState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectParams) -> DbResult<Box<dyn DriverConnection>> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state
            .passwords
            .lock()
            .unwrap()
            .push(params.password.clone());

        let failure = self.state.failure.lock().unwrap().as_ref().map(clone_error);
        if let Some(error) = failure {
            return Err(error);
        }

        let pid = self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            parameters: ConnectionParameters {
                host: params.host.clone(),
                port: params.port,
                dbname: params.dbname.clone(),
                user: params.user.clone(),
                application_name: params.application_name.clone(),
            },
            pid,
            tracker: TransactionTracker::new(),
            closed: false,
        }))
    }
}

fn clone_error(error: &DbError) -> DbError {
    match error {
        DbError::Connection { message, suggestion } => {
            DbError::connection(message.clone(), suggestion.clone())
        }
        DbError::Configuration { message, .. } => DbError::configuration(message.clone()),
        DbError::CredentialRefresh { message } => DbError::credential_refresh(message.clone()),
        other => DbError::internal(other.to_string()),
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    parameters: ConnectionParameters,
    pid: i32,
    tracker: TransactionTracker,
    closed: bool,
}

impl MockConnection {
    fn run(&mut self, sql: &str) -> DbResult<()> {
        if self.closed || self.state.is_broken(self.pid) {
            self.tracker.mark_broken();
            return Err(DbError::connection(
                "server closed the connection unexpectedly",
                "",
            ));
        }
        if self.tracker.needs_implicit_begin(sql) {
            self.state.record(self.pid, "BEGIN");
            self.tracker.observe_success("BEGIN");
        }
        self.state.record(self.pid, sql);

        let upper = sql.trim().to_ascii_uppercase();
        let ends_transaction = upper.starts_with("ROLLBACK") || upper.starts_with("COMMIT");
        let error = if upper.contains("FAIL") {
            Some(DbError::database(
                "syntax error at or near \"FAIL\"",
                Some("42601".to_string()),
                "",
            ))
        } else if self.tracker.status() == TransactionStatus::InError && !ends_transaction {
            Some(DbError::database(
                "current transaction is aborted, commands ignored until end of transaction block",
                Some("25P02".to_string()),
                "",
            ))
        } else {
            None
        };

        match error {
            Some(e) => {
                self.tracker.observe_failure(sql, &e);
                Err(e)
            }
            None => {
                self.tracker.observe_success(sql);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    fn server_version_num(&self) -> u32 {
        SERVER_VERSION_NUM
    }

    fn backend_pid(&self) -> i32 {
        self.pid
    }

    fn autocommit(&self) -> bool {
        self.tracker.autocommit()
    }

    fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        self.tracker.set_autocommit(autocommit)
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.closed {
            return TransactionStatus::Unknown;
        }
        self.tracker.status()
    }

    fn is_closed(&self) -> bool {
        self.transaction_status() == TransactionStatus::Unknown
    }

    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        self.run(sql).map(|_| 1)
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.run(sql)?;
        if sql.contains("pg_database") {
            return Ok(["postgres", "sales"]
                .iter()
                .map(|name| row(json!({ "datname": name })))
                .collect());
        }
        let value = if sql.contains("set_config") {
            match params.first() {
                Some(QueryParam::String(name)) => json!({ "set_config": name }),
                _ => json!({ "set_config": null }),
            }
        } else {
            json!({ "?column?": 1 })
        };
        Ok(vec![row(value)])
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.closed || self.state.is_broken(self.pid) {
            self.tracker.mark_broken();
            return Err(DbError::connection(
                "server closed the connection unexpectedly",
                "",
            ));
        }
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if !self.closed {
            self.closed = true;
            self.tracker.mark_broken();
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(DbError::connection("could not send terminate message", ""));
        }
        Ok(())
    }
}

fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub fn details(host: &str, dbname: &str) -> ConnectionDetails {
    let mut details = ConnectionDetails::new(host, dbname, "alice");
    details.password = Some("secret".to_string());
    details
}

/// Small pool and short timeouts so exhaustion tests finish quickly.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        max_pool_size: Some(2),
        timeout_override_ms: Some(300),
        ..ManagerOptions::default()
    }
}

pub fn manager(state: &Arc<MockState>, options: ManagerOptions) -> ConnectionManager {
    ConnectionManager::new(MockConnector::new(state.clone()), options)
}
