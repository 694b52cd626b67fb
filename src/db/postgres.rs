//! PostgreSQL driver backed by a single `sqlx::PgConnection`.
//!
//! sqlx does not surface the server's transaction status, so the session tracks it
//! with a [`TransactionTracker`] and issues `BEGIN` itself when autocommit is off.

use crate::db::driver::{
    ConnectParams, ConnectionParameters, Connector, DriverConnection, TransactionStatus,
    TransactionTracker,
};
use crate::db::params::bound_query;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor, Row as _};
use std::fmt;
use tracing::debug;

/// Session facts read once, right after the connection is established.
const SESSION_INFO_SQL: &str = "SELECT pg_backend_pid() AS pid, \
    current_setting('server_version_num')::int4 AS version, \
    current_database()::text AS dbname, \
    current_user::text AS usr, \
    current_setting('application_name') AS app";

/// Opens PostgreSQL sessions with sqlx.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, params: &ConnectParams) -> DbResult<Box<dyn DriverConnection>> {
        let options = connect_options(params)?;
        let connect = PgConnection::connect_with(&options);
        let conn = tokio::time::timeout(params.connect_timeout, connect)
            .await
            .map_err(|_| {
                DbError::connection(
                    format!(
                        "connection timeout expired after {}s",
                        params.connect_timeout.as_secs()
                    ),
                    "Check that the server is reachable and that firewall settings allow the connection",
                )
            })??;
        let session = PgSession::open(conn, params).await?;
        debug!(
            host = %params.host,
            backend_pid = session.backend_pid,
            "Opened PostgreSQL session"
        );
        Ok(Box::new(session))
    }
}

fn connect_options(params: &ConnectParams) -> DbResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .database(&params.dbname);
    if let Some(password) = &params.password {
        options = options.password(password);
    }
    if let Some(application_name) = &params.application_name {
        options = options.application_name(application_name);
    }
    for (key, value) in &params.options {
        options = match key.as_str() {
            "sslmode" => options.ssl_mode(value.parse::<PgSslMode>().map_err(|_| {
                DbError::invalid_input(format!("Invalid sslmode: {value}"))
            })?),
            "sslrootcert" => options.ssl_root_cert(value.as_str()),
            "sslcert" => options.ssl_client_cert(value.as_str()),
            "sslkey" => options.ssl_client_key(value.as_str()),
            // Anything else is sent to the server as a runtime parameter.
            _ => options.options([(key.as_str(), value.as_str())]),
        };
    }
    Ok(options)
}

pub struct PgSession {
    conn: Option<PgConnection>,
    parameters: ConnectionParameters,
    server_version_num: u32,
    backend_pid: i32,
    tracker: TransactionTracker,
}

impl PgSession {
    async fn open(mut conn: PgConnection, params: &ConnectParams) -> DbResult<Self> {
        let row = sqlx::query(SESSION_INFO_SQL).fetch_one(&mut conn).await?;
        let version: i32 = row.try_get("version")?;
        let application_name: String = row.try_get("app")?;
        Ok(Self {
            parameters: ConnectionParameters {
                host: params.host.clone(),
                port: params.port,
                dbname: row.try_get("dbname")?,
                user: row.try_get("usr")?,
                application_name: Some(application_name).filter(|a| !a.is_empty()),
            },
            server_version_num: u32::try_from(version).unwrap_or_default(),
            backend_pid: row.try_get("pid")?,
            tracker: TransactionTracker::new(),
            conn: Some(conn),
        })
    }

    fn conn_mut(&mut self) -> DbResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connection("connection is closed", "Reconnect to the database"))
    }

    async fn begin_if_needed(&mut self, sql: &str) -> DbResult<()> {
        if !self.tracker.needs_implicit_begin(sql) {
            return Ok(());
        }
        let result = self
            .conn_mut()?
            .execute(sqlx::raw_sql("BEGIN"))
            .await
            .map(|_| ())
            .map_err(DbError::from);
        self.track("BEGIN", &result);
        result
    }

    fn track<T>(&mut self, sql: &str, result: &DbResult<T>) {
        match result {
            Ok(_) => self.tracker.observe_success(sql),
            Err(e) => self.tracker.observe_failure(sql, e),
        }
    }
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("parameters", &self.parameters)
            .field("backend_pid", &self.backend_pid)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DriverConnection for PgSession {
    fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    fn server_version_num(&self) -> u32 {
        self.server_version_num
    }

    fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    fn autocommit(&self) -> bool {
        self.tracker.autocommit()
    }

    fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        self.tracker.set_autocommit(autocommit)
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.conn.is_none() {
            return TransactionStatus::Unknown;
        }
        self.tracker.status()
    }

    fn is_closed(&self) -> bool {
        self.transaction_status() == TransactionStatus::Unknown
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.begin_if_needed(sql).await?;
        let conn = self.conn_mut()?;
        let result = if params.is_empty() {
            conn.execute(sqlx::raw_sql(sql)).await
        } else {
            conn.execute(bound_query(sql, params)).await
        }
        .map(|done| done.rows_affected())
        .map_err(DbError::from);
        self.track(sql, &result);
        result
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.begin_if_needed(sql).await?;
        let conn = self.conn_mut()?;
        let result = if params.is_empty() {
            conn.fetch_all(sqlx::raw_sql(sql)).await
        } else {
            conn.fetch_all(bound_query(sql, params)).await
        }
        .map(|rows| rows.iter().map(RowToJson::to_json_map).collect())
        .map_err(DbError::from);
        self.track(sql, &result);
        result
    }

    async fn ping(&mut self) -> DbResult<()> {
        let result = self.conn_mut()?.ping().await.map_err(DbError::from);
        if result.is_err() {
            self.tracker.mark_broken();
        }
        result
    }

    async fn close(&mut self) -> DbResult<()> {
        self.tracker.mark_broken();
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(DbError::from),
            None => Ok(()),
        }
    }
}
