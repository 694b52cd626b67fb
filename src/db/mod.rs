//! Database connection layer.
//!
//! This module provides:
//! - The driver contract and the PostgreSQL driver
//! - Connection factories with access-token refresh
//! - Bounded connection pools, one per set of connection details
//! - The connection manager tying owners to pools
//! - Row decoding and parameter binding for PostgreSQL

pub mod credentials;
pub mod driver;
pub mod error_log;
pub mod factory;
pub mod manager;
pub mod params;
pub mod pool;
pub mod postgres;
pub mod scoped;
pub mod server_connection;
pub mod types;

pub use credentials::{CredentialRefresh, TokenFetcher, TokenRefresher};
pub use driver::{
    ConnectParams, ConnectionParameters, Connector, DriverConnection, TransactionStatus,
    TransactionTracker,
};
pub use error_log::{ConnectionErrorLog, ErrorSink};
pub use factory::{ConnectionFactory, SharedDetails, shared_details};
pub use manager::ConnectionManager;
pub use pool::{ConnectionPool, PhysicalConnection, PoolConfig, PoolError, PoolStats};
pub use postgres::PgConnector;
pub use scoped::{ConnectionLease, ScopedConnection};
pub use server_connection::ServerConnection;
