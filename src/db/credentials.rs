//! Cloud access-token refresh.
//!
//! Connection details may carry a short-lived access token that stands in for the
//! password. Before each physical connect the pool's factory asks the refresher to
//! renew an expired token. A dedicated async lock makes concurrent connects wait for a
//! single fetch and then reuse its result.

use crate::db::factory::{SharedDetails, read_details, write_details};
use crate::error::{DbError, DbResult};
use crate::models::AzureToken;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::info;

/// Tokens expiring within this window are refreshed early.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;

/// Client-side capability that obtains a fresh access token.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self, account_id: &str, tenant_id: Option<&str>)
    -> DbResult<AzureToken>;
}

/// Pre-connect hook run by a connection factory.
#[async_trait]
pub trait CredentialRefresh: Send + Sync {
    /// Renew the token in `details` when it has expired. Returns the new token, or
    /// `None` when nothing needed refreshing.
    async fn maybe_refresh(&self, details: &SharedDetails) -> DbResult<Option<AzureToken>>;
}

/// Refreshes tokens through a late-bound [`TokenFetcher`].
pub struct TokenRefresher {
    fetcher: RwLock<Option<Arc<dyn TokenFetcher>>>,
    refresh_lock: Mutex<()>,
    skew: chrono::Duration,
}

impl TokenRefresher {
    pub fn new() -> Self {
        Self {
            fetcher: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            skew: chrono::Duration::seconds(TOKEN_EXPIRY_SKEW_SECS),
        }
    }

    pub fn set_fetcher(&self, fetcher: Arc<dyn TokenFetcher>) {
        let mut slot = match self.fetcher.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(fetcher);
    }

    fn fetcher(&self) -> Option<Arc<dyn TokenFetcher>> {
        match self.fetcher.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_fetcher(&self) -> bool {
        self.fetcher().is_some()
    }
}

impl Default for TokenRefresher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("has_fetcher", &self.has_fetcher())
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialRefresh for TokenRefresher {
    async fn maybe_refresh(&self, details: &SharedDetails) -> DbResult<Option<AzureToken>> {
        let Some(fetcher) = self.fetcher() else {
            return Ok(None);
        };
        if !read_details(details).has_azure_token() {
            return Ok(None);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another connect may have refreshed while this one waited for the lock.
        let (account_id, tenant_id) = {
            let current = read_details(details);
            if !current.is_token_expired(Utc::now(), self.skew) {
                return Ok(None);
            }
            let Some(account_id) = current
                .azure_account_id
                .clone()
                .filter(|id| !id.is_empty())
            else {
                return Err(DbError::configuration(
                    "Azure account ID must be provided to refresh the token.",
                ));
            };
            (account_id, current.azure_tenant_id.clone())
        };

        info!(account_id = %account_id, "Refreshing expired access token");
        let token = fetcher
            .fetch_token(&account_id, tenant_id.as_deref())
            .await
            .map_err(|e| match e {
                DbError::CredentialRefresh { .. } | DbError::Configuration { .. } => e,
                other => DbError::credential_refresh(other.to_string()),
            })?;
        write_details(details).apply_token(&token);
        Ok(Some(token))
    }
}
