// Copyright 2025 Medly Team.
//
// Tests for DeliveryTracker: monotonic batch transitions and counter repair

mod common;

use common::{alice_and_bob, create_test_service, create_test_service_with_db};
use medly_store::{DeliveryStatus, DirectMessaging, StepOutcome};
use sea_orm::ConnectionTrait;
use tempfile::NamedTempFile;

async fn statuses(dm: &DirectMessaging, conv_id: &str) -> Vec<DeliveryStatus> {
    dm.list_messages(conv_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.delivery_status)
        .collect()
}

#[tokio::test]
async fn test_sent_delivered_read() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    let msg = dm
        .send_message(&conv_id, "u1", "u2", "hello")
        .await
        .unwrap()
        .message;

    let delivered = dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    assert_eq!(delivered, vec![msg.id.clone()]);
    let stored = dm.messages().get_message(&msg.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
    assert!(stored.delivered_at.is_some());
    assert!(stored.read_at.is_none());

    let receipt = dm.mark_messages_as_read(&conv_id, "u2").await.unwrap();
    assert_eq!(receipt.message_ids, vec![msg.id.clone()]);
    assert_eq!(receipt.counter_reset, StepOutcome::Applied);
    let stored = dm.messages().get_message(&msg.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Read);
    assert!(stored.read_at.is_some());
}

#[tokio::test]
async fn test_read_skips_undelivered_messages() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "still sent")
        .await
        .unwrap();

    let receipt = dm.mark_messages_as_read(&conv_id, "u2").await.unwrap();
    assert!(receipt.message_ids.is_empty());
    assert_eq!(statuses(&dm, &conv_id).await, vec![DeliveryStatus::Sent]);

    // The counter is reset regardless
    let conv = dm
        .conversations()
        .get_conversation(&conv_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.unread_for("u2"), 0);
}

#[tokio::test]
async fn test_transitions_only_touch_receiver() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "to bob").await.unwrap();
    dm.send_message(&conv_id, "u2", "u1", "to alice").await.unwrap();

    let delivered = dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        statuses(&dm, &conv_id).await,
        vec![DeliveryStatus::Delivered, DeliveryStatus::Sent]
    );
}

#[tokio::test]
async fn test_transitions_never_regress() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "one").await.unwrap();
    dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    dm.mark_messages_as_read(&conv_id, "u2").await.unwrap();
    dm.send_message(&conv_id, "u1", "u2", "two").await.unwrap();

    // A second delivered pass only picks up the new message
    let delivered = dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        statuses(&dm, &conv_id).await,
        vec![DeliveryStatus::Read, DeliveryStatus::Delivered]
    );

    // Repeating is a no-op
    assert!(dm
        .mark_messages_as_delivered(&conv_id, "u2")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_batch_moves_every_matching_message() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    for i in 0..5 {
        dm.send_message(&conv_id, "u1", "u2", &format!("m{}", i))
            .await
            .unwrap();
    }

    let delivered = dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    assert_eq!(delivered.len(), 5);
    let receipt = dm.mark_messages_as_read(&conv_id, "u2").await.unwrap();
    assert_eq!(receipt.message_ids, delivered);
    assert!(statuses(&dm, &conv_id)
        .await
        .iter()
        .all(|s| *s == DeliveryStatus::Read));
}

#[tokio::test]
async fn test_read_reports_counter_failure_separately() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    // u9 has no counter in this conversation, so only the reset step fails
    let receipt = dm.mark_messages_as_read(&conv_id, "u9").await.unwrap();
    assert!(receipt.message_ids.is_empty());
    assert!(matches!(receipt.counter_reset, StepOutcome::Failed(_)));
}

#[tokio::test]
async fn test_recompute_unread_repairs_counters() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = create_test_service(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "a").await.unwrap();
    dm.send_message(&conv_id, "u1", "u2", "b").await.unwrap();
    dm.send_message(&conv_id, "u2", "u1", "c").await.unwrap();
    dm.mark_messages_as_delivered(&conv_id, "u1").await.unwrap();
    dm.mark_messages_as_read(&conv_id, "u1").await.unwrap();

    // Simulate drift from a lost follow-up write
    for _ in 0..4 {
        dm.conversations()
            .increment_unread(&conv_id, "u1")
            .await
            .unwrap();
    }

    let counts = dm.tracker().recompute_unread(&conv_id).await.unwrap();
    assert_eq!(counts["u1"], 0);
    assert_eq!(counts["u2"], 2);

    let conv = dm
        .conversations()
        .get_conversation(&conv_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.unread_for("u1"), 0);
    assert_eq!(conv.unread_for("u2"), 2);

    assert!(dm.tracker().recompute_unread("missing").await.is_err());
}

#[tokio::test]
async fn test_failed_delivered_batch_moves_nothing() {
    let temp_file = NamedTempFile::new().unwrap();
    let (dm, db) = create_test_service_with_db(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "fine").await.unwrap();
    dm.send_message(&conv_id, "u1", "u2", "blocked").await.unwrap();

    // Only the second message refuses to change
    db.execute_unprepared(
        "CREATE TRIGGER block_one BEFORE UPDATE ON messages \
         WHEN OLD.content = 'blocked' \
         BEGIN SELECT RAISE(ABORT, 'message locked'); END;",
    )
    .await
    .unwrap();

    assert!(dm.mark_messages_as_delivered(&conv_id, "u2").await.is_err());
    assert_eq!(
        statuses(&dm, &conv_id).await,
        vec![DeliveryStatus::Sent, DeliveryStatus::Sent]
    );

    db.execute_unprepared("DROP TRIGGER block_one").await.unwrap();
    let delivered = dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();
    assert_eq!(delivered.len(), 2);
}

#[tokio::test]
async fn test_failed_read_batch_keeps_counter() {
    let temp_file = NamedTempFile::new().unwrap();
    let (dm, db) = create_test_service_with_db(&temp_file).await;
    let conv_id = alice_and_bob(&dm).await;

    dm.send_message(&conv_id, "u1", "u2", "one").await.unwrap();
    dm.send_message(&conv_id, "u1", "u2", "two").await.unwrap();
    dm.mark_messages_as_delivered(&conv_id, "u2").await.unwrap();

    db.execute_unprepared(
        "CREATE TRIGGER block_read BEFORE UPDATE ON messages \
         WHEN NEW.delivery_status = 'read' AND OLD.content = 'two' \
         BEGIN SELECT RAISE(ABORT, 'read receipts unavailable'); END;",
    )
    .await
    .unwrap();

    assert!(dm.mark_messages_as_read(&conv_id, "u2").await.is_err());
    assert_eq!(
        statuses(&dm, &conv_id).await,
        vec![DeliveryStatus::Delivered, DeliveryStatus::Delivered]
    );
    let conv = dm
        .conversations()
        .get_conversation(&conv_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.unread_for("u2"), 2);
}
