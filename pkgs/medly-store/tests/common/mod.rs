// Copyright 2025 Medly Team.
//
// Shared setup for medly-store integration tests

#![allow(dead_code)]

use medly_store::{DirectMessaging, SessionIdentity, StoreConfig};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub fn test_config(path: &NamedTempFile) -> StoreConfig {
    StoreConfig {
        db_path: path.path().to_path_buf(),
        ..Default::default()
    }
}

pub async fn create_test_db(path: &NamedTempFile) -> DatabaseConnection {
    medly_store::connect(&test_config(path))
        .await
        .expect("Failed to open test database")
}

pub async fn create_test_service(path: &NamedTempFile) -> DirectMessaging {
    DirectMessaging::open(&test_config(path), Arc::new(SessionIdentity::signed_out()))
        .await
        .expect("Failed to open direct messaging")
}

/// Service plus a handle on its connection, for tests that alter the schema
pub async fn create_test_service_with_db(
    path: &NamedTempFile,
) -> (DirectMessaging, DatabaseConnection) {
    let db = create_test_db(path).await;
    let dm = DirectMessaging::with_connection(
        db.clone(),
        &test_config(path),
        Arc::new(SessionIdentity::signed_out()),
    )
    .await
    .expect("Failed to build direct messaging");
    (dm, db)
}

/// Alice (u1) and Bob (u2), the pair used by most tests
pub async fn alice_and_bob(dm: &DirectMessaging) -> String {
    dm.create_or_get_conversation("u1", "u2", "Alice", "Bob")
        .await
        .expect("Failed to create conversation")
        .id
}
