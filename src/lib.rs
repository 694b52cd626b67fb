//! dbtools service library
//!
//! Connection lifecycle and pooling for database tooling clients: owners connect with
//! connection details, share one pool per distinct target, and borrow scoped,
//! transaction-aware connections from it.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use config::Config;
pub use db::ConnectionManager;
pub use error::DbError;
pub use service::{ConnectListener, ConnectionService};
