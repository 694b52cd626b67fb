//! dbtools service - connection check.
//!
//! Connects to one database through the connection manager, prints the connection
//! info (and optionally the database list) as JSON on stdout, then disconnects.

use dbtools_service::config::{Config, ManagerOptions};
use dbtools_service::db::{ConnectionManager, PgConnector};
use dbtools_service::service::{
    ConnectRequestParams, ConnectionService, DisconnectRequestParams,
};
use dbtools_service::models::ConnectionType;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    if !config.enable_logs {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // stdout carries the check report, so logs go to stderr
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run_check(
    service: &ConnectionService,
    config: &Config,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let details = config.connection_details()?;
    let complete = service
        .connect(ConnectRequestParams {
            owner_uri: config.owner_uri.clone(),
            connection: details,
            connection_type: ConnectionType::Default,
        })
        .await;
    if let Some(message) = &complete.error_message {
        return Err(message.clone().into());
    }

    let databases = if config.list_databases {
        Some(service.list_databases(&config.owner_uri).await?.database_names)
    } else {
        None
    };

    let report = json!({
        "connection": complete,
        "databases": databases,
        "pools": service.pool_stats().await,
    });

    service
        .disconnect(DisconnectRequestParams {
            owner_uri: config.owner_uri.clone(),
            connection_type: None,
        })
        .await?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        owner_uri = %config.owner_uri,
        "Starting dbtools service connection check v{}",
        env!("CARGO_PKG_VERSION")
    );

    let options = ManagerOptions::default();
    options.validate()?;
    let manager = ConnectionManager::new(Arc::new(PgConnector::new()), options);
    let service =
        ConnectionService::new(manager.clone()).with_connect_config(config.connect_config());

    let outcome: Result<serde_json::Value, Box<dyn std::error::Error>> = tokio::select! {
        result = tokio::time::timeout(
            config.connect_timeout_duration() * 2,
            run_check(&service, &config),
        ) => match result {
            Ok(report) => report,
            Err(_) => Err("Connection check timed out".into()),
        },
        _ = tokio::signal::ctrl_c() => Err("Interrupted".into()),
    };

    manager.close().await;

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("Connection check complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Connection check failed");
            Err(e)
        }
    }
}
