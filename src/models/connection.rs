//! Connection-related data models.
//!
//! This module defines the connection details a client sends, the information
//! returned after a successful connect, and the connection purposes an owner can
//! hold dedicated connections for.

use crate::config::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DATABASE, DEFAULT_PORT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Host suffixes of managed cloud PostgreSQL offerings.
const CLOUD_HOST_SUFFIXES: &[&str] = &["database.azure.com", "database.windows.net"];

/// Placeholder shown instead of a password in user-facing strings.
const MASKED_PASSWORD: &str = "*****";

/// Parameters identifying a target database, as sent by the client.
///
/// The access token and its expiry are volatile: they are refreshed in place and are
/// left out of [`ConnectionDetails::to_hash`] so a refresh never changes pool identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    pub user: String,
    /// Contains sensitive data - never log
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, alias = "connect_timeout")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, alias = "application_name")]
    pub application_name: Option<String>,
    #[serde(default)]
    pub azure_account_id: Option<String>,
    #[serde(default)]
    pub azure_tenant_id: Option<String>,
    /// Contains sensitive data - never log
    #[serde(default, skip_serializing)]
    pub azure_account_token: Option<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub azure_token_expiry: Option<DateTime<Utc>>,
    /// Remaining driver options such as `sslmode`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_dbname() -> String {
    DEFAULT_DATABASE.to_string()
}

impl ConnectionDetails {
    pub fn new(
        host: impl Into<String>,
        dbname: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            dbname: dbname.into(),
            user: user.into(),
            password: None,
            connect_timeout_secs: None,
            application_name: None,
            azure_account_id: None,
            azure_tenant_id: None,
            azure_account_token: None,
            azure_token_expiry: None,
            options: BTreeMap::new(),
        }
    }

    /// Parse connection details from a `postgres://` URL.
    ///
    /// `connect_timeout` and `application_name` query parameters populate their fields;
    /// all other parameters are kept as driver options.
    pub fn from_url(s: &str) -> Result<Self, String> {
        let url = Url::parse(s).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(format!("Unsupported URL scheme: {}", url.scheme()));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "Connection URL must include a host".to_string())?;
        let dbname = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_DATABASE);
        let user = if url.username().is_empty() {
            "postgres"
        } else {
            url.username()
        };

        let mut details = Self::new(host, dbname, user);
        details.port = url.port();
        details.password = url.password().map(String::from);

        for (key, value) in url.query_pairs() {
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "connect_timeout" => {
                    details.connect_timeout_secs = Some(
                        value
                            .parse()
                            .map_err(|_| format!("Invalid connect_timeout: {value}"))?,
                    );
                }
                "application_name" => details.application_name = Some(value.into_owned()),
                _ => {
                    details.options.insert(key, value.into_owned());
                }
            }
        }
        Ok(details)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// Copy of these details targeting another database on the same server.
    pub fn with_database(&self, dbname: impl Into<String>) -> Self {
        Self {
            dbname: dbname.into(),
            ..self.clone()
        }
    }

    pub fn has_azure_token(&self) -> bool {
        self.azure_account_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    /// Whether the access token expires within `skew` of `now`. Tokens without an
    /// expiry are treated as valid.
    pub fn is_token_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.azure_token_expiry {
            Some(expiry) => expiry <= now + skew,
            None => false,
        }
    }

    /// Store a refreshed access token in place.
    pub fn apply_token(&mut self, token: &AzureToken) {
        self.azure_account_token = Some(token.token.clone());
        self.azure_token_expiry = Some(token.expiry);
    }

    /// Password to present to the server: the access token when one is set.
    pub fn effective_password(&self) -> Option<&str> {
        if self.has_azure_token() {
            self.azure_account_token.as_deref()
        } else {
            self.password.as_deref()
        }
    }

    pub fn is_cloud_host(&self) -> bool {
        let host = self.host.to_ascii_lowercase();
        CLOUD_HOST_SUFFIXES
            .iter()
            .any(|suffix| host.ends_with(suffix))
    }

    /// Stable digest identifying the pool these details connect through.
    pub fn to_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |key: &str, value: Option<&str>| {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            if let Some(value) = value {
                hasher.update([1u8]);
                hasher.update(value.as_bytes());
            }
            hasher.update([0xffu8]);
        };
        let port = self.port_or_default().to_string();
        let timeout = self.connect_timeout_secs.map(|t| t.to_string());

        field("host", Some(&self.host));
        field("port", Some(&port));
        field("dbname", Some(&self.dbname));
        field("user", Some(&self.user));
        field("password", self.password.as_deref());
        field("connect_timeout", timeout.as_deref());
        field("application_name", self.application_name.as_deref());
        field("azure_account_id", self.azure_account_id.as_deref());
        field("azure_tenant_id", self.azure_tenant_id.as_deref());
        for (key, value) in &self.options {
            field(&format!("option:{key}"), Some(value));
        }
        hex::encode(hasher.finalize())
    }

    /// libpq-style `key=value` rendering safe to show to users.
    ///
    /// The application name is dropped. The password is masked, or left out
    /// entirely when an access token stands in for it.
    pub fn user_facing_target(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.host)),
            format!("port={}", self.port_or_default()),
            format!("dbname={}", quote_conninfo_value(&self.dbname)),
            format!("user={}", quote_conninfo_value(&self.user)),
        ];
        if !self.has_azure_token() && self.password.is_some() {
            parts.push(format!("password={MASKED_PASSWORD}"));
        }
        if let Some(timeout) = self.connect_timeout_secs {
            parts.push(format!("connect_timeout={timeout}"));
        }
        for (key, value) in &self.options {
            parts.push(format!("{key}={}", quote_conninfo_value(value)));
        }
        parts.join(" ")
    }
}

fn quote_conninfo_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// A cloud access token and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureToken {
    pub token: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expiry: DateTime<Utc>,
}

impl AzureToken {
    pub fn new(token: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }
}

/// Purpose of a dedicated, long-lived connection held outside scoped checkouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Default,
    Query,
    Edit,
    QueryCancel,
    ObjectExplorer,
    Intellisense,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Query => "Query",
            Self::Edit => "Edit",
            Self::QueryCancel => "QueryCancel",
            Self::ObjectExplorer => "ObjectExplorer",
            Self::Intellisense => "Intellisense",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub server_name: String,
    pub database_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server: String,
    pub server_version: String,
    pub is_cloud: bool,
}

impl ServerInfo {
    pub fn postgres(version: (u32, u32, u32), is_cloud: bool) -> Self {
        let (major, minor, patch) = version;
        Self {
            server: "PostgreSQL".to_string(),
            server_version: format!("{major}.{minor}.{patch}"),
            is_cloud,
        }
    }
}

/// Information about an owner's connection, returned after a successful connect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub owner_uri: String,
    pub connection_id: String,
    pub connection_summary: ConnectionSummary,
    pub server_info: ServerInfo,
    pub connection_details: ConnectionDetails,
}
