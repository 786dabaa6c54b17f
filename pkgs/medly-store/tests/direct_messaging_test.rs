// Copyright 2025 Medly Team.
//
// End-to-end tests for the DirectMessaging service

mod common;

use common::{alice_and_bob, create_test_db, test_config};
use medly_store::{
    DeliveryStatus, DirectMessaging, DmError, ErrorKind, ResultExt, SessionIdentity,
};
use sea_orm::ConnectionTrait;
use std::sync::Arc;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_full_conversation_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = common::create_test_service(&temp_file).await;

    let conv = dm
        .create_or_get_conversation("u1", "u2", "Alice", "Bob")
        .await
        .unwrap();
    assert_eq!(conv.unread_for("u1"), 0);
    assert_eq!(conv.unread_for("u2"), 0);

    let receipt = dm.send_message(&conv.id, "u1", "u2", "hello").await.unwrap();
    assert_eq!(receipt.message.delivery_status, DeliveryStatus::Sent);

    let conv = dm.conversations().get_conversation(&conv.id).await.unwrap().unwrap();
    assert_eq!(conv.last_message.as_deref(), Some("hello"));
    assert_eq!(conv.last_message_sender.as_deref(), Some("u1"));
    assert_eq!(conv.unread_for("u1"), 0);
    assert_eq!(conv.unread_for("u2"), 1);
    assert_eq!(dm.get_total_unread_count("u2").await.unwrap(), 1);

    dm.mark_messages_as_delivered(&conv.id, "u2").await.unwrap();
    let history = dm.list_messages(&conv.id).await.unwrap();
    assert_eq!(history[0].delivery_status, DeliveryStatus::Delivered);

    dm.mark_messages_as_read(&conv.id, "u2").await.unwrap();
    let history = dm.list_messages(&conv.id).await.unwrap();
    assert_eq!(history[0].delivery_status, DeliveryStatus::Read);

    let conv = dm.conversations().get_conversation(&conv.id).await.unwrap().unwrap();
    assert_eq!(conv.unread_for("u1"), 0);
    assert_eq!(conv.unread_for("u2"), 0);
    assert_eq!(dm.get_total_unread_count("u2").await.unwrap(), 0);
}

#[tokio::test]
async fn test_signed_out_helpers() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = common::create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;
    dm.send_message(&conv_id, "u2", "u1", "ping").await.unwrap();

    assert!(matches!(dm.current_user(), Err(DmError::Unauthenticated)));
    assert!(dm.my_conversations().await.unwrap().is_empty());
    assert_eq!(dm.my_total_unread_count().await.unwrap(), 0);

    let err = dm.reply(&conv_id, "pong").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);

    // Callers that prefer a quiet default can opt in explicitly
    let fallback: Vec<medly_store::Message> = dm
        .reply(&conv_id, "pong")
        .await
        .map(|r| vec![r.message])
        .or_default_logged("reply");
    assert!(fallback.is_empty());
}

#[tokio::test]
async fn test_signed_in_helpers_and_reply() {
    let temp_file = NamedTempFile::new().unwrap();
    let identity = Arc::new(SessionIdentity::signed_out());
    let dm = DirectMessaging::open(&test_config(&temp_file), identity.clone())
        .await
        .unwrap();
    let conv_id = alice_and_bob(&dm).await;
    dm.send_message(&conv_id, "u2", "u1", "ping").await.unwrap();

    identity.sign_in("u1");
    assert_eq!(dm.current_user().unwrap(), "u1");
    assert_eq!(dm.my_total_unread_count().await.unwrap(), 1);
    let mine = dm.my_conversations().await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, conv_id);

    let reply = dm.reply(&conv_id, "pong").await.unwrap();
    assert_eq!(reply.message.sender_id, "u1");
    assert_eq!(reply.message.receiver_id, "u2");
    assert_eq!(dm.get_total_unread_count("u2").await.unwrap(), 1);

    identity.sign_in("u3");
    let err = dm.reply(&conv_id, "intruder").await.unwrap_err();
    assert!(matches!(err, DmError::NotAParticipant { .. }));

    identity.sign_out();
    assert_eq!(dm.my_total_unread_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reply_rejects_group_conversations() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DirectMessaging::open(
        &test_config(&temp_file),
        Arc::new(SessionIdentity::signed_in("u1")),
    )
    .await
    .unwrap();

    let group = dm
        .conversations()
        .create_group_conversation(&[
            ("u1", "Alice"),
            ("u2", "Bob"),
            ("u3", "Carol"),
        ])
        .await
        .unwrap();

    let err = dm.reply(&group.id, "hi all").await.unwrap_err();
    assert!(matches!(err, DmError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_with_connection_shares_database() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = create_test_db(&temp_file).await;
    let config = test_config(&temp_file);
    let dm = DirectMessaging::with_connection(
        db,
        &config,
        Arc::new(SessionIdentity::signed_in("u2")),
    )
    .await
    .unwrap();

    let conv_id = alice_and_bob(&dm).await;
    dm.send_message(&conv_id, "u1", "u2", "hello").await.unwrap();
    assert_eq!(dm.my_total_unread_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_with_connection_resumes_after_stored_history() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = create_test_db(&temp_file).await;
    let config = test_config(&temp_file);

    let first = DirectMessaging::with_connection(
        db.clone(),
        &config,
        Arc::new(SessionIdentity::signed_out()),
    )
    .await
    .unwrap();
    let conv_id = alice_and_bob(&first).await;
    first
        .send_message(&conv_id, "u1", "u2", "from the future")
        .await
        .unwrap();

    // History stamped well ahead of the local wall clock
    let future_millis = chrono::Utc::now().timestamp_millis() + 3_600_000;
    db.execute_unprepared(&format!(
        "UPDATE messages SET timestamp = {}",
        future_millis
    ))
    .await
    .unwrap();

    let second = DirectMessaging::with_connection(
        db,
        &config,
        Arc::new(SessionIdentity::signed_out()),
    )
    .await
    .unwrap();
    let later = second
        .send_message(&conv_id, "u2", "u1", "reply")
        .await
        .unwrap();
    assert!(later.message.timestamp.timestamp_millis() > future_millis);

    let history = second.list_messages(&conv_id).await.unwrap();
    assert_eq!(history.last().unwrap().content, "reply");
}

#[tokio::test]
async fn test_delete_conversation_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = common::create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;
    dm.send_message(&conv_id, "u1", "u2", "hello").await.unwrap();

    dm.delete_conversation(&conv_id).await.unwrap();
    assert!(dm.list_conversations("u1").await.unwrap().is_empty());
    assert_eq!(dm.list_messages(&conv_id).await.unwrap().len(), 1);

    let fresh = dm
        .create_or_get_conversation("u2", "u1", "Bob", "Alice")
        .await
        .unwrap();
    assert_ne!(fresh.id, conv_id);
    assert!(fresh.last_message.is_none());
}
