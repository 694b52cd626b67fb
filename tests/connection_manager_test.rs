//! Integration tests for the connection manager, against the in-memory driver.

mod common;

use common::{MockState, details, fast_options, manager};
use dbtools_service::config::ManagerOptions;
use dbtools_service::db::TransactionStatus;
use dbtools_service::error::DbError;
use dbtools_service::models::ConnectionType;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_connect_returns_info() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    let info = manager
        .connect("owner", details("db.example.com", "sales"), None)
        .await
        .unwrap();

    assert_eq!(info.owner_uri, "owner");
    assert_eq!(info.connection_id.len(), 32);
    assert_eq!(info.connection_summary.server_name, "db.example.com");
    assert_eq!(info.connection_summary.database_name, "sales");
    assert_eq!(info.connection_summary.user_name, "alice");
    assert_eq!(info.server_info.server, "PostgreSQL");
    assert_eq!(info.server_info.server_version, "16.0.2");
    assert!(!info.server_info.is_cloud);

    let stored = manager.get_connection_info("owner").await.unwrap();
    assert_eq!(stored.connection_id, info.connection_id);
}

#[tokio::test]
async fn test_connect_flags_cloud_hosts() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    let info = manager
        .connect(
            "owner",
            details("srv.postgres.database.azure.com", "db"),
            None,
        )
        .await
        .unwrap();
    assert!(info.server_info.is_cloud);
}

#[tokio::test]
async fn test_connect_is_idempotent_for_same_details() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    let first = manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();
    let second = manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    assert_eq!(first.connection_id, second.connection_id);
    assert_eq!(state.connect_count(), 1);
    assert_eq!(manager.get_pool_stats().await.len(), 1);
}

#[tokio::test]
async fn test_reconnect_with_changed_details_replaces_pool() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    let first = manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();
    let second = manager
        .connect("owner", details("db", "billing"), None)
        .await
        .unwrap();

    assert_ne!(first.connection_id, second.connection_id);
    assert_eq!(second.connection_summary.database_name, "billing");

    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.len(), 1);
    assert!(stats.contains_key(&details("db", "billing").to_hash()));
}

#[tokio::test]
async fn test_reconnect_with_changed_details_releases_prior_connections_once() {
    let state = MockState::new();
    let options = ManagerOptions {
        max_pool_size: Some(4),
        ..fast_options()
    };
    let manager = manager(&state, options);
    let sales = details("db", "sales").to_hash();

    manager
        .connect("a", details("db", "sales"), None)
        .await
        .unwrap();
    manager
        .connect("b", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("a").await.unwrap();
    let tx = scope.acquire().await.unwrap();
    tx.execute_statement("BEGIN", &[]).await.unwrap();
    scope.release().await.unwrap();
    let orphan = manager
        .get_orphaned_connection("a", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();

    let closed_before = state.closed_count();
    let size_before = manager.get_pool_stats().await[&sales].pool_size;

    let info = manager
        .connect("a", details("db", "billing"), None)
        .await
        .unwrap();
    assert_eq!(info.connection_summary.database_name, "billing");

    assert_eq!(state.closed_count(), closed_before + 2);
    assert!(tx.is_released().await);
    assert!(orphan.is_released().await);

    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[&sales].pool_size, size_before - 2);
    assert!(stats.contains_key(&details("db", "billing").to_hash()));

    // The old pool still serves the second owner.
    let databases = manager
        .get_pooled_connection("b")
        .await
        .unwrap()
        .run(|conn| async move { Ok(conn.database_name().to_string()) })
        .await
        .unwrap();
    assert_eq!(databases, "sales");

    let reconnected = manager
        .get_pooled_connection("a")
        .await
        .unwrap()
        .run(|conn| async move { Ok(conn.database_name().to_string()) })
        .await
        .unwrap();
    assert_eq!(reconnected, "billing");
    assert_eq!(state.closed_count(), closed_before + 2);
}

#[tokio::test]
async fn test_scope_after_disconnect_reports_closed_pool() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    assert!(manager.disconnect("owner").await.unwrap());

    let err = scope.acquire().await.unwrap_err();
    match &err {
        DbError::PoolClosed { target } => {
            assert!(target.contains("host=db"));
            assert!(!target.contains("secret"));
        }
        other => panic!("expected a closed pool error, got {other:?}"),
    }
    assert!(err.to_string().contains("host=db"));
    assert!(scope.is_closed());
}

#[tokio::test]
async fn test_owners_share_pool_until_last_disconnects() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    manager
        .connect("a", details("db", "sales"), None)
        .await
        .unwrap();
    manager
        .connect("b", details("db", "sales"), None)
        .await
        .unwrap();
    assert_eq!(manager.get_pool_stats().await.len(), 1);
    assert_eq!(state.connect_count(), 1);

    assert!(manager.disconnect("a").await.unwrap());
    assert_eq!(manager.get_pool_stats().await.len(), 1);
    assert!(manager.get_pooled_connection("b").await.is_some());

    assert!(manager.disconnect("b").await.unwrap());
    assert!(manager.get_pool_stats().await.is_empty());

    assert!(!manager.disconnect("b").await.unwrap());
    assert!(!manager.disconnect("never-connected").await.unwrap());
}

#[tokio::test]
async fn test_unknown_owner_lookups_return_none() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    assert!(manager.get_pooled_connection("nobody").await.is_none());
    assert!(manager.get_connection_info("nobody").await.is_none());
    assert!(
        manager
            .get_orphaned_connection("nobody", ConnectionType::Query)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_pooled_connection_returns_to_pool() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let conn = scope.acquire().await.unwrap();
    assert!(conn.autocommit().await.unwrap());
    conn.execute_statement("SELECT 1", &[]).await.unwrap();
    scope.release().await.unwrap();

    let stats = manager.get_pool_stats().await;
    let pool = stats.values().next().unwrap();
    assert_eq!(pool.pool_size, 1);
    assert_eq!(pool.pool_available, 1);
}

#[tokio::test]
async fn test_open_transaction_is_resumed() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let first = scope.acquire().await.unwrap();
    first.set_autocommit(false).await.unwrap();
    first
        .execute_statement("INSERT INTO t VALUES (1)", &[])
        .await
        .unwrap();
    assert!(first.transaction_in_trans().await);
    assert!(!first.user_transaction());
    scope.release().await.unwrap();

    // Still held outside the pool.
    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.values().next().unwrap().pool_available, 0);

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let resumed = scope.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&first, &resumed));
    resumed.commit().await.unwrap();
    scope.release().await.unwrap();

    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.values().next().unwrap().pool_available, 1);

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let fresh = scope.acquire().await.unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(fresh.backend_pid(), first.backend_pid());
    assert!(fresh.autocommit().await.unwrap());
    scope.release().await.unwrap();
}

#[tokio::test]
async fn test_explicit_transaction_is_retained() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let conn = scope.acquire().await.unwrap();
    conn.execute_statement("BEGIN", &[]).await.unwrap();
    assert!(conn.user_transaction());
    scope.release().await.unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let resumed = scope.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&conn, &resumed));
    resumed.rollback().await.unwrap();
    assert!(!resumed.user_transaction());
    scope.release().await.unwrap();
}

#[tokio::test]
async fn test_failed_statement_with_autocommit_off_is_retained() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let conn = scope.acquire().await.unwrap();
    conn.set_autocommit(false).await.unwrap();
    let err = conn.execute_statement("SELECT FAIL", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert!(conn.transaction_in_error().await);
    scope.release().await.unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let resumed = scope.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&conn, &resumed));
    resumed.rollback().await.unwrap();
    assert!(!resumed.transaction_in_error().await);
    scope.release().await.unwrap();

    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.values().next().unwrap().pool_available, 1);
}

#[tokio::test]
async fn test_failed_transaction_with_autocommit_on_is_rolled_back() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let conn = scope.acquire().await.unwrap();
    conn.execute_statement("BEGIN", &[]).await.unwrap();
    conn.execute_statement("SELECT FAIL", &[]).await.unwrap_err();
    assert_eq!(conn.transaction_status().await, TransactionStatus::InError);
    let pid = conn.backend_pid();
    scope.release().await.unwrap();

    assert!(conn.is_released().await);
    assert_eq!(state.statements_for(pid).last().unwrap(), "ROLLBACK");

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let fresh = scope.acquire().await.unwrap();
    assert!(!Arc::ptr_eq(&conn, &fresh));
    assert!(fresh.transaction_is_idle().await);
    scope.release().await.unwrap();
}

#[tokio::test]
async fn test_checkout_timeout_reports_open_transactions() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    for owner in ["a", "b", "c"] {
        manager
            .connect(owner, details("db", "sales"), None)
            .await
            .unwrap();
    }

    for owner in ["a", "b"] {
        let mut scope = manager.get_pooled_connection(owner).await.unwrap();
        let conn = scope.acquire().await.unwrap();
        conn.execute_statement("BEGIN", &[]).await.unwrap();
        scope.release().await.unwrap();
    }

    let mut scope = manager.get_pooled_connection("c").await.unwrap();
    let err = scope.acquire().await.unwrap_err();
    match &err {
        DbError::CheckoutTimeout {
            pool_size,
            pool_max,
            active_tx,
            target,
            ..
        } => {
            assert_eq!(*pool_size, 2);
            assert_eq!(*pool_max, 2);
            assert_eq!(*active_tx, 2);
            assert!(target.contains("host=db"));
        }
        other => panic!("expected checkout timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("open transactions: 2"));
    assert!(scope.is_closed());
}

#[tokio::test]
async fn test_checkout_on_empty_pool_is_unreachable() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    // The only pooled session dies and the server stops accepting connections.
    state.break_connection(1000);
    state.refuse_connections("connection refused");

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let err = scope.acquire().await.unwrap_err();
    match &err {
        DbError::Unreachable { errors, .. } => {
            assert_eq!(errors, &vec!["Connection failed: connection refused".to_string()]);
        }
        other => panic!("expected unreachable, got {other:?}"),
    }
    let msg = err.to_string();
    assert!(msg.starts_with("Could not connect to host=db port=5432 dbname=sales user=alice"));
    assert!(msg.contains("password=*****"));
    assert!(!msg.contains("secret"));

    let stats = manager.get_pool_stats().await;
    let pool = stats.values().next().unwrap();
    assert_eq!(pool.pool_size, 0);
    assert_eq!(pool.connections_lost, 1);
}

#[tokio::test]
async fn test_connect_timeout_embeds_redacted_target_and_errors() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    state.refuse_connections("connection refused");

    let err = manager
        .connect("owner", details("db.example.com", "sales"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::ConnectTimeout { .. }));
    assert_eq!(
        err.to_string(),
        "Could not connect to host=db.example.com port=5432 dbname=sales user=alice password=*****. \
         Pool initialization timed out.\nConnection error:\nConnection failed: connection refused"
    );
    assert!(state.connect_count() >= 2);
    assert!(manager.get_connection_info("owner").await.is_none());
    assert!(manager.get_pool_stats().await.is_empty());

    // Nothing was registered, so the next attempt starts clean.
    state.accept_connections();
    manager
        .connect("owner", details("db.example.com", "sales"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_configuration_error_fails_fast() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    state.fail_connections_with(DbError::configuration("bad sslmode"));

    let err = manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
    assert_eq!(state.connect_count(), 1);
}

#[tokio::test]
async fn test_orphaned_connection_is_cached_per_type() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    let mut editor = details("db", "sales");
    editor.application_name = Some("editor".to_string());
    manager.connect("owner", editor, None).await.unwrap();

    let query = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    let again = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&query, &again));
    assert!(query.has_pool());
    assert!(query.autocommit().await.unwrap());
    assert_eq!(query.application_name().as_deref(), Some("editor - Query"));
    assert!(
        state
            .statements_for(query.backend_pid())
            .iter()
            .any(|sql| sql.contains("set_config('application_name'"))
    );

    let cancel = manager
        .get_orphaned_connection("owner", ConnectionType::QueryCancel)
        .await
        .unwrap()
        .unwrap();
    assert!(!Arc::ptr_eq(&query, &cancel));
    assert_eq!(
        cancel.application_name().as_deref(),
        Some("editor - QueryCancel")
    );
}

#[tokio::test]
async fn test_orphan_without_application_name_uses_default() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let conn = manager
        .get_orphaned_connection("owner", ConnectionType::Intellisense)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        conn.application_name().as_deref(),
        Some("dbtools - Intellisense")
    );
}

#[tokio::test]
async fn test_broken_orphan_is_replaced() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let first = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    state.break_connection(first.backend_pid());

    let second = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.backend_pid(), second.backend_pid());
    assert!(first.is_released().await);

    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.values().next().unwrap().pool_size, 1);
}

#[tokio::test]
async fn test_orphan_in_transaction_is_not_checked() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let conn = manager
        .get_orphaned_connection("owner", ConnectionType::Edit)
        .await
        .unwrap()
        .unwrap();
    conn.execute_statement("BEGIN", &[]).await.unwrap();
    state.break_connection(conn.backend_pid());

    let again = manager
        .get_orphaned_connection("owner", ConnectionType::Edit)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
}

#[tokio::test]
async fn test_disconnect_releases_orphans_and_transaction() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let orphan = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let tx = scope.acquire().await.unwrap();
    tx.execute_statement("BEGIN", &[]).await.unwrap();
    scope.release().await.unwrap();

    assert!(manager.disconnect("owner").await.unwrap());
    assert!(orphan.is_released().await);
    assert!(tx.is_released().await);
    assert!(state.closed_count() >= 2);
    assert!(manager.get_pool_stats().await.is_empty());
    assert!(manager.get_pooled_connection("owner").await.is_none());
}

#[tokio::test]
async fn test_transaction_released_after_disconnect_is_discarded() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();

    let mut scope = manager.get_pooled_connection("owner").await.unwrap();
    let conn = scope.acquire().await.unwrap();
    conn.execute_statement("BEGIN", &[]).await.unwrap();

    manager.disconnect("owner").await.unwrap();
    scope.release().await.unwrap();
    assert!(conn.is_released().await);
    assert!(manager.get_pooled_connection("owner").await.is_none());
}

#[tokio::test]
async fn test_close_orphaned_connection_by_type() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("owner", details("db", "sales"), None)
        .await
        .unwrap();
    let conn = manager
        .get_orphaned_connection("owner", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();

    assert!(
        manager
            .close_orphaned_connection("owner", ConnectionType::Query)
            .await
            .unwrap()
    );
    assert!(conn.is_released().await);
    assert!(
        !manager
            .close_orphaned_connection("owner", ConnectionType::Query)
            .await
            .unwrap()
    );
    assert!(manager.get_connection_info("owner").await.is_some());
}

#[tokio::test]
async fn test_close_is_terminal() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    manager
        .connect("a", details("db", "sales"), None)
        .await
        .unwrap();
    manager
        .connect("b", details("db", "billing"), None)
        .await
        .unwrap();
    let orphan = manager
        .get_orphaned_connection("a", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();

    manager.close().await;

    assert!(manager.is_closed().await);
    assert!(orphan.is_released().await);
    assert!(manager.get_connection_info("a").await.is_none());
    assert!(manager.get_pooled_connection("b").await.is_none());
    assert!(
        manager
            .get_orphaned_connection("a", ConnectionType::Query)
            .await
            .unwrap()
            .is_none()
    );
    assert!(manager.get_pool_stats().await.is_empty());

    let err = manager
        .connect("a", details("db", "sales"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ManagerClosed));

    // A second close is a no-op.
    manager.close().await;
}

#[tokio::test]
async fn test_transfer_connection_moves_everything() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());
    let info = manager
        .connect("old", details("db", "sales"), None)
        .await
        .unwrap();
    let orphan = manager
        .get_orphaned_connection("old", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();

    assert!(manager.transfer_connection("old", "new").await.unwrap());

    let moved = manager.get_connection_info("new").await.unwrap();
    assert_eq!(moved.owner_uri, "new");
    assert_eq!(moved.connection_id, info.connection_id);
    assert!(manager.get_connection_info("old").await.is_none());
    assert!(manager.get_pooled_connection("old").await.is_none());

    let same = manager
        .get_orphaned_connection("new", ConnectionType::Query)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&orphan, &same));

    assert!(!manager.transfer_connection("old", "other").await.unwrap());

    assert!(manager.disconnect("new").await.unwrap());
    assert!(manager.get_pool_stats().await.is_empty());
}

#[tokio::test]
async fn test_connect_and_disconnect_run_in_submission_order() {
    let state = MockState::new();
    let manager = manager(&state, fast_options());

    let (connected, disconnected) = tokio::join!(
        manager.connect("owner", details("db", "sales"), None),
        manager.disconnect("owner"),
    );

    connected.unwrap();
    assert!(disconnected.unwrap());
    assert!(manager.get_connection_info("owner").await.is_none());
    assert!(manager.get_pool_stats().await.is_empty());
}

#[tokio::test]
async fn test_pool_size_follows_connect_config() {
    let state = MockState::new();
    let manager = manager(
        &state,
        ManagerOptions {
            timeout_override_ms: Some(300),
            ..ManagerOptions::default()
        },
    );
    manager
        .connect(
            "owner",
            details("db", "sales"),
            Some(dbtools_service::config::ConnectConfig { max_connections: 7 }),
        )
        .await
        .unwrap();
    let stats = manager.get_pool_stats().await;
    assert_eq!(stats.values().next().unwrap().pool_max, 7);
}
