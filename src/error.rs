//! Error types for the connection service.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors raised by the connection manager embed the redacted connection target so the
//! client can show the user what was being connected to, never the password.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Configuration error{}: {message}", format_target(.target))]
    Configuration {
        message: String,
        /// Redacted target, once known.
        target: Option<String>,
    },

    #[error("Could not connect to {target}. Pool initialization timed out.{}", format_connection_errors(.errors))]
    ConnectTimeout { target: String, errors: Vec<String> },

    #[error("Could not connect to {target}.{}", format_connection_errors(.errors))]
    Unreachable { target: String, errors: Vec<String> },

    #[error(
        "Timed out getting a connection to {target} (pool size: {pool_size}, pool max: {pool_max}, open transactions: {active_tx}). Commit or roll back open transactions to free connections.{}",
        format_connection_errors(.errors)
    )]
    CheckoutTimeout {
        target: String,
        pool_size: usize,
        pool_max: usize,
        /// Owners of the same pool currently holding an open transaction
        active_tx: usize,
        errors: Vec<String>,
    },

    #[error("Connection pool for {target} is closed")]
    PoolClosed { target: String },

    #[error("Failed to refresh access token: {message}")]
    CredentialRefresh { message: String },

    #[error("Connection has already been returned to its pool")]
    ConnectionReleased,

    #[error("Scoped connection has already been released")]
    ScopeClosed,

    #[error("Connection manager is closed")]
    ManagerClosed,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration error. These are never retried.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            target: None,
        }
    }

    /// Attach the redacted connection target to errors that do not carry one yet.
    pub fn with_target(self, target: impl Into<String>) -> Self {
        match self {
            Self::Configuration {
                message,
                target: None,
            } => Self::Configuration {
                message,
                target: Some(target.into()),
            },
            other => other,
        }
    }

    pub fn connect_timeout(target: impl Into<String>, errors: Vec<String>) -> Self {
        Self::ConnectTimeout {
            target: target.into(),
            errors,
        }
    }

    pub fn unreachable(target: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Unreachable {
            target: target.into(),
            errors,
        }
    }

    /// Create a credential refresh error.
    pub fn credential_refresh(message: impl Into<String>) -> Self {
        Self::CredentialRefresh {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolClosed { .. } => Some("Reconnect to the database"),
            Self::ConnectTimeout { .. } | Self::Unreachable { .. } => {
                Some("Check that the server is running and that firewall settings allow the connection")
            }
            Self::CheckoutTimeout { .. } => {
                Some("Commit or roll back open transactions, or raise the maximum pool size")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectTimeout { .. }
                | Self::Unreachable { .. }
                | Self::CheckoutTimeout { .. }
        )
    }

    /// Whether a physical connect attempt failing with this error must abort instead of
    /// being retried until the pool deadline.
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

fn format_target(target: &Option<String>) -> String {
    match target {
        Some(target) => format!(" for {target}"),
        None => String::new(),
    }
}

/// Render captured low-level connect errors the way they are appended to timeout
/// messages. Empty input renders as an empty string.
pub fn format_connection_errors(errors: &[String]) -> String {
    match errors {
        [] => String::new(),
        [single] => format!("\nConnection error:\n{single}"),
        many => format!("\nConnection errors:\n{}", many.join("\n")),
    }
}

/// Suggestion for a server error, by SQLSTATE class.
fn server_error_suggestion(code: &str) -> &'static str {
    match code.get(..2) {
        Some("28") => "Check the user name and password",
        Some("08") | Some("57") => "Reconnect once the server is accepting connections again",
        Some("25") => "Roll back the current transaction before running more statements",
        Some("42") => "Check the SQL syntax and referenced objects",
        Some("53") => "The server is out of resources; close idle connections and retry",
        _ => "",
    }
}

/// Whether a server error ends the session rather than just the statement.
fn is_session_fatal(code: &str) -> bool {
    matches!(code.get(..2), Some("28") | Some("08") | Some("57")) || code == "3D000"
}

/// Map driver errors. Server errors keep their original message so callers can match
/// on well-known texts such as authentication failures.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db_err.message().to_string();
                if code == "3D000" {
                    return DbError::connection(message, "Check that the database exists");
                }
                let suggestion = server_error_suggestion(&code);
                if is_session_fatal(&code) {
                    DbError::connection(message, suggestion)
                } else {
                    DbError::database(message, (!code.is_empty()).then_some(code), suggestion)
                }
            }
            sqlx::Error::Configuration(source) => DbError::connection(
                source.to_string(),
                "Check the connection details format and credentials",
            ),
            sqlx::Error::Io(source) => DbError::connection(
                source.to_string(),
                "Check that the host and port are correct and reachable",
            ),
            sqlx::Error::Tls(source) => DbError::connection(
                format!("TLS handshake failed: {source}"),
                "Check the sslmode setting and server certificates",
            ),
            sqlx::Error::Protocol(message) => DbError::connection(message, ""),
            sqlx::Error::WorkerCrashed => {
                DbError::connection("Driver worker crashed", "Reconnect to the server")
            }
            sqlx::Error::RowNotFound => DbError::database("Query returned no rows", None, ""),
            other => DbError::internal(format!("Driver error: {other}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
