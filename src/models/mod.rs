//! Data models for the connection service.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    AzureToken, ConnectionDetails, ConnectionInfo, ConnectionSummary, ConnectionType, ServerInfo,
};
pub use query::{QueryParam, Row};
