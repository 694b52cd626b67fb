//! Request-facing connection service.
//!
//! Translates connection requests from a tooling client into manager calls and shapes
//! the responses. Connect never fails at this level: errors are reported inside the
//! response, with hints for the usual causes appended.

use crate::config::ConnectConfig;
use crate::db::manager::ConnectionManager;
use crate::db::pool::PoolStats;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionDetails, ConnectionInfo, ConnectionSummary, ConnectionType, ServerInfo,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

fn default_connection_type() -> ConnectionType {
    ConnectionType::Default
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestParams {
    pub owner_uri: String,
    pub connection: ConnectionDetails,
    #[serde(rename = "type", default = "default_connection_type")]
    pub connection_type: ConnectionType,
}

/// Outcome of a connect request, successful or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCompleteParams {
    pub owner_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_summary: Option<ConnectionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
}

impl ConnectionCompleteParams {
    fn success(info: ConnectionInfo, connection_type: ConnectionType) -> Self {
        Self {
            owner_uri: info.owner_uri,
            connection_id: Some(info.connection_id),
            connection_summary: Some(info.connection_summary),
            server_info: Some(info.server_info),
            messages: None,
            error_message: None,
            connection_type,
        }
    }

    fn failure(owner_uri: &str, connection_type: ConnectionType, err: &DbError) -> Self {
        let message = describe_connect_error(err);
        Self {
            owner_uri: owner_uri.to_string(),
            connection_id: None,
            connection_summary: None,
            server_info: None,
            messages: Some(message.clone()),
            error_message: Some(message),
            connection_type,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequestParams {
    pub owner_uri: String,
    /// Close only this dedicated connection instead of disconnecting the owner.
    #[serde(rename = "type", default)]
    pub connection_type: Option<ConnectionType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDatabaseRequestParams {
    pub owner_uri: String,
    pub new_database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabasesResponse {
    pub database_names: Vec<String>,
}

/// Append likely causes and remedies to a connect error message.
pub fn describe_connect_error(err: &DbError) -> String {
    let mut message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("could not translate host name") || lower.contains("failed to lookup address")
    {
        message.push_str(
            "\nCauses:\n    Using the wrong hostname or problems with DNS resolution.\
             \nSuggestions:\n    Check that the server address or hostname is the full address.",
        );
    }
    if lower.contains("timed out") || lower.contains("timeout expired") {
        message.push_str(
            "\nSuggestions:\n    Check that the firewall settings allow connections from the user's address.",
        );
    }
    if lower.contains("connection refused") {
        message.push_str(
            "\nSuggestions:\n    Check that the server is running and accepting TCP/IP connections on the given port.",
        );
    }
    if lower.contains("password authentication failed") {
        message.push_str("\nSuggestions:\n    Check the user name and password.");
    }
    message
}

/// Notified after an owner gets a new default connection.
#[async_trait]
pub trait ConnectListener: Send + Sync {
    async fn on_connect(&self, info: &ConnectionInfo);
}

type Listeners = Arc<RwLock<Vec<Arc<dyn ConnectListener>>>>;

/// Connection requests over a shared [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionService {
    manager: ConnectionManager,
    connect_config: Option<ConnectConfig>,
    listeners: Listeners,
}

impl ConnectionService {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            connect_config: None,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener for new default connections. Listeners run in
    /// registration order before the connect response is returned.
    pub fn register_on_connect(&self, listener: Arc<dyn ConnectListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    fn connect_listeners(&self) -> Vec<Arc<dyn ConnectListener>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Pool settings applied to every connect request.
    pub fn with_connect_config(mut self, config: ConnectConfig) -> Self {
        self.connect_config = Some(config);
        self
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn connect(&self, params: ConnectRequestParams) -> ConnectionCompleteParams {
        let ConnectRequestParams {
            owner_uri,
            connection,
            connection_type,
        } = params;
        let previous_id = self
            .manager
            .get_connection_info(&owner_uri)
            .await
            .map(|info| info.connection_id);
        match self
            .manager
            .connect(&owner_uri, connection, self.connect_config)
            .await
        {
            Ok(info) => {
                let is_new = previous_id.as_deref() != Some(info.connection_id.as_str());
                if connection_type == ConnectionType::Default && is_new {
                    self.notify_on_connect(&info).await;
                }
                ConnectionCompleteParams::success(info, connection_type)
            }
            Err(e) => {
                warn!(owner_uri = %owner_uri, error = %e, "Connect request failed");
                ConnectionCompleteParams::failure(&owner_uri, connection_type, &e)
            }
        }
    }

    async fn notify_on_connect(&self, info: &ConnectionInfo) {
        let listeners = self.connect_listeners();
        debug!(
            owner_uri = %info.owner_uri,
            listeners = listeners.len(),
            "Notifying connect listeners"
        );
        for listener in listeners {
            listener.on_connect(info).await;
        }
    }

    pub async fn disconnect(&self, params: DisconnectRequestParams) -> DbResult<bool> {
        match params.connection_type {
            Some(connection_type) => {
                self.manager
                    .close_orphaned_connection(&params.owner_uri, connection_type)
                    .await
            }
            None => self.manager.disconnect(&params.owner_uri).await,
        }
    }

    /// Databases visible to the owner's connection. A connection the server dropped
    /// is retried once on a fresh one.
    pub async fn list_databases(&self, owner_uri: &str) -> DbResult<ListDatabasesResponse> {
        let database_names = match self.query_databases(owner_uri).await {
            Err(DbError::Connection { message, .. }) => {
                warn!(
                    owner_uri = %owner_uri,
                    error = %message,
                    "Server closed the connection unexpectedly, retrying"
                );
                self.query_databases(owner_uri).await?
            }
            result => result?,
        };
        Ok(ListDatabasesResponse { database_names })
    }

    async fn query_databases(&self, owner_uri: &str) -> DbResult<Vec<String>> {
        let scope = self
            .manager
            .get_pooled_connection(owner_uri)
            .await
            .ok_or_else(|| not_connected(owner_uri))?;
        scope
            .run(|conn| async move { conn.list_databases().await })
            .await
    }

    /// Reconnect the owner to another database on the same server.
    pub async fn change_database(
        &self,
        params: ChangeDatabaseRequestParams,
    ) -> DbResult<ConnectionCompleteParams> {
        if params.new_database.trim().is_empty() {
            return Err(DbError::invalid_input("Database name must not be empty"));
        }
        let details = self
            .manager
            .get_connection_details(&params.owner_uri)
            .await
            .ok_or_else(|| not_connected(&params.owner_uri))?;
        info!(
            owner_uri = %params.owner_uri,
            database = %params.new_database,
            "Changing database"
        );
        Ok(self
            .connect(ConnectRequestParams {
                owner_uri: params.owner_uri,
                connection: details.with_database(params.new_database),
                connection_type: ConnectionType::Default,
            })
            .await)
    }

    pub async fn connection_info(&self, owner_uri: &str) -> Option<ConnectionInfo> {
        self.manager.get_connection_info(owner_uri).await
    }

    pub async fn pool_stats(&self) -> HashMap<String, PoolStats> {
        self.manager.get_pool_stats().await
    }
}

impl fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionService")
            .field("manager", &self.manager)
            .field("connect_config", &self.connect_config)
            .field("listeners", &self.connect_listeners().len())
            .finish()
    }
}

fn not_connected(owner_uri: &str) -> DbError {
    DbError::invalid_input(format!("No connection associated with owner {owner_uri}"))
}
