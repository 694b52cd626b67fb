//! Connection factory bound to one target.
//!
//! A pool owns exactly one factory. The factory reads the shared connection details
//! at every attempt, so a token refreshed by one attempt is seen by the next.

use crate::db::credentials::CredentialRefresh;
use crate::db::driver::{ConnectParams, Connector, DriverConnection};
use crate::db::error_log::ErrorSink;
use crate::error::DbResult;
use crate::models::ConnectionDetails;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Connection details shared between an owner, its pool and the pool's factory.
pub type SharedDetails = Arc<RwLock<ConnectionDetails>>;

pub fn shared_details(details: ConnectionDetails) -> SharedDetails {
    Arc::new(RwLock::new(details))
}

pub(crate) fn read_details(details: &SharedDetails) -> RwLockReadGuard<'_, ConnectionDetails> {
    match details.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_details(details: &SharedDetails) -> RwLockWriteGuard<'_, ConnectionDetails> {
    match details.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Opens physical connections for one set of connection details.
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    details: SharedDetails,
    details_hash: String,
    error_sink: Arc<dyn ErrorSink>,
    refresher: Option<Arc<dyn CredentialRefresh>>,
}

impl ConnectionFactory {
    pub fn new(
        connector: Arc<dyn Connector>,
        details: SharedDetails,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let details_hash = read_details(&details).to_hash();
        Self {
            connector,
            details,
            details_hash,
            error_sink,
            refresher: None,
        }
    }

    /// Run `refresher` before every connect attempt.
    pub fn with_credential_refresh(mut self, refresher: Arc<dyn CredentialRefresh>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn details(&self) -> &SharedDetails {
        &self.details
    }

    pub fn details_hash(&self) -> &str {
        &self.details_hash
    }

    /// Redacted target for error messages.
    pub fn user_facing_target(&self) -> String {
        read_details(&self.details).user_facing_target()
    }

    /// Open one physical connection. Failures are reported to the error sink before
    /// being returned.
    pub async fn connect(&self) -> DbResult<Box<dyn DriverConnection>> {
        let result = self.try_connect().await;
        if let Err(e) = &result {
            self.error_sink
                .record_connection_error(&self.details_hash, e);
        }
        result
    }

    async fn try_connect(&self) -> DbResult<Box<dyn DriverConnection>> {
        let refreshed = match &self.refresher {
            Some(refresher) => refresher.maybe_refresh(&self.details).await?,
            None => None,
        };
        let mut params = ConnectParams::from(&*read_details(&self.details));
        if let Some(token) = refreshed {
            params.password = Some(token.token);
        }
        self.connector.connect(&params).await
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("details_hash", &self.details_hash)
            .field("refresh", &self.refresher.is_some())
            .finish_non_exhaustive()
    }
}
