//! Driver contract consumed by the pool and the connection wrapper.
//!
//! A [`Connector`] opens physical connections; a [`DriverConnection`] is one open
//! session. Drivers report transaction status the way libpq does, and the
//! [`TransactionTracker`] gives drivers without native status reporting a shared
//! way to derive it from the statements they run.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDetails, QueryParam, Row};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Server-side transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Not inside a transaction block.
    #[default]
    Idle,
    /// Inside a healthy transaction block.
    InTransaction,
    /// Inside a failed transaction block; only ROLLBACK is accepted.
    InError,
    /// The session is broken or closed.
    Unknown,
}

/// Session parameters reported by the server after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub application_name: Option<String>,
}

/// Everything a [`Connector`] needs to open one physical connection.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    /// Either the user's password or a cloud access token.
    pub password: Option<String>,
    pub application_name: Option<String>,
    pub connect_timeout: Duration,
    pub options: BTreeMap<String, String>,
}

impl From<&ConnectionDetails> for ConnectParams {
    fn from(details: &ConnectionDetails) -> Self {
        Self {
            host: details.host.clone(),
            port: details.port_or_default(),
            dbname: details.dbname.clone(),
            user: details.user.clone(),
            password: details.effective_password().map(String::from),
            application_name: details.application_name.clone(),
            connect_timeout: details.connect_timeout(),
            options: details.options.clone(),
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// One open database session.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    fn parameters(&self) -> &ConnectionParameters;

    /// Server version as an integer, e.g. `170004` for 17.4.
    fn server_version_num(&self) -> u32;

    fn backend_pid(&self) -> i32;

    fn autocommit(&self) -> bool;

    /// Fails when switching modes inside a transaction block.
    fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()>;

    fn transaction_status(&self) -> TransactionStatus;

    fn is_closed(&self) -> bool;

    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    /// Round-trip to the server to prove the session is alive.
    async fn ping(&mut self) -> DbResult<()>;

    async fn close(&mut self) -> DbResult<()>;
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> DbResult<Box<dyn DriverConnection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionControl {
    Begin,
    Commit,
    Rollback,
    RollbackToSavepoint,
}

fn classify_statement(statement: &str) -> Option<TransactionControl> {
    let mut words = statement
        .split_whitespace()
        .map(|w| w.trim_end_matches(';').to_ascii_uppercase());
    let first = words.next()?;
    match first.as_str() {
        "BEGIN" => Some(TransactionControl::Begin),
        "START" => match words.next().as_deref() {
            Some("TRANSACTION") => Some(TransactionControl::Begin),
            _ => None,
        },
        "COMMIT" | "END" => match words.next().as_deref() {
            Some("PREPARED") => None,
            _ => Some(TransactionControl::Commit),
        },
        "ROLLBACK" | "ABORT" => {
            let rest: Vec<String> = words.collect();
            if rest.first().map(String::as_str) == Some("PREPARED") {
                None
            } else if rest.iter().any(|w| w == "TO") {
                Some(TransactionControl::RollbackToSavepoint)
            } else {
                Some(TransactionControl::Rollback)
            }
        }
        _ => None,
    }
}

/// Derives transaction status and autocommit behavior from executed statements.
///
/// Statements are split on `;` without regard for quoting, so a semicolon inside a
/// string literal can misclassify a batch. Status only moves on control statements
/// and failures, which matches what the server reports for ordinary batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTracker {
    status: TransactionStatus,
    autocommit: bool,
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            status: TransactionStatus::Idle,
            autocommit: true,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        if autocommit == self.autocommit {
            return Ok(());
        }
        if self.status != TransactionStatus::Idle {
            return Err(DbError::invalid_input(
                "autocommit cannot be changed inside a transaction",
            ));
        }
        self.autocommit = autocommit;
        Ok(())
    }

    /// With autocommit off, the first statement outside a transaction block opens one.
    pub fn needs_implicit_begin(&self, sql: &str) -> bool {
        if self.autocommit || self.status != TransactionStatus::Idle {
            return false;
        }
        match sql.split(';').find(|s| !s.trim().is_empty()) {
            Some(first) => classify_statement(first).is_none(),
            None => false,
        }
    }

    pub fn observe_success(&mut self, sql: &str) {
        if self.status == TransactionStatus::Unknown {
            return;
        }
        for statement in sql.split(';') {
            match classify_statement(statement) {
                Some(TransactionControl::Begin) => self.status = TransactionStatus::InTransaction,
                Some(TransactionControl::Commit) | Some(TransactionControl::Rollback) => {
                    self.status = TransactionStatus::Idle
                }
                Some(TransactionControl::RollbackToSavepoint) => {
                    if self.status == TransactionStatus::InError {
                        self.status = TransactionStatus::InTransaction;
                    }
                }
                None => {}
            }
        }
    }

    pub fn observe_failure(&mut self, sql: &str, err: &DbError) {
        match err {
            DbError::Database { .. } => {
                let opened = sql
                    .split(';')
                    .any(|s| classify_statement(s) == Some(TransactionControl::Begin));
                if self.status == TransactionStatus::InTransaction || opened {
                    self.status = TransactionStatus::InError;
                }
            }
            DbError::Connection { .. } => self.status = TransactionStatus::Unknown,
            _ => {}
        }
    }

    pub fn mark_broken(&mut self) {
        self.status = TransactionStatus::Unknown;
    }
}
