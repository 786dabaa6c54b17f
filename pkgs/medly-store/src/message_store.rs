//! Message store - append-only, time-ordered message log per conversation

use crate::change_feed::{ChangeFeed, StoreChange};
use crate::clock::ServerClock;
use crate::conversation_store::ConversationStore;
use crate::entities::messages;
use crate::error::{DmError, DmResult};
use crate::models::{Message, SendReceipt, StepOutcome};
use crate::subscription::{SnapshotSource, Subscription};
use crate::DeliveryStatus;
use async_trait::async_trait;
use sea_orm::prelude::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Message store
#[derive(Clone)]
pub struct MessageStore {
    pub(crate) db: DatabaseConnection,
    conversations: ConversationStore,
    feed: ChangeFeed,
    clock: Arc<ServerClock>,
    subscription_buffer: usize,
}

impl MessageStore {
    /// Create a message store over an existing, migrated connection.
    ///
    /// `conversations` receives the summary/unread update that follows every send.
    /// Over a database that already holds messages, call
    /// [`resume_clock`](Self::resume_clock) before sending.
    pub fn new(db: DatabaseConnection, conversations: ConversationStore, feed: ChangeFeed) -> Self {
        Self {
            db,
            conversations,
            feed,
            clock: Arc::new(ServerClock::new()),
            subscription_buffer: crate::StoreConfig::default().subscription_buffer,
        }
    }

    pub fn with_subscription_buffer(mut self, buffer: usize) -> Self {
        self.subscription_buffer = buffer;
        self
    }

    /// Move the clock past the newest stored message, so messages written
    /// after a restart still sort after the existing history
    pub async fn resume_clock(&self) -> DmResult<()> {
        let latest: Option<Option<i64>> = messages::Entity::find()
            .select_only()
            .column_as(Expr::col(messages::Column::Timestamp).max(), "latest")
            .into_tuple()
            .one(&self.db)
            .await?;

        if let Some(latest) = latest.flatten() {
            self.clock.observe(latest);
            debug!("Message clock resumed after {}", latest);
        }
        Ok(())
    }

    /// Full history of a conversation, oldest first
    pub async fn list_messages(&self, conversation_id: &str) -> DmResult<Vec<Message>> {
        let rows = messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .order_by_asc(messages::Column::Timestamp)
            .order_by_asc(messages::Column::Id)
            .all(&self.db)
            .await?;

        debug!(
            "Retrieved {} messages from conversation {}",
            rows.len(),
            conversation_id
        );
        Ok(rows.into_iter().map(Message::from).collect())
    }

    /// Live view of [`list_messages`](Self::list_messages)
    pub fn subscribe_messages(&self, conversation_id: &str) -> Subscription<Vec<Message>> {
        let source = MessageListSource {
            store: self.clone(),
            conversation_id: conversation_id.to_string(),
        };
        Subscription::spawn(source, &self.feed, self.subscription_buffer)
    }

    /// Get message by ID
    pub async fn get_message(&self, message_id: &str) -> DmResult<Option<Message>> {
        let row = messages::Entity::find_by_id(message_id.to_string())
            .one(&self.db)
            .await?;

        Ok(row.map(Message::from))
    }

    /// Persist a new message with status `sent`, then update the conversation
    /// summary and the receiver's unread counter.
    ///
    /// Only the first step decides success. If the follow-up fails the message
    /// stays stored and the receipt reports the lagging bookkeeping, which
    /// [`DeliveryTracker::recompute_unread`](crate::DeliveryTracker::recompute_unread)
    /// can repair later.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> DmResult<SendReceipt> {
        if content.trim().is_empty() {
            return Err(DmError::InvalidArgument(
                "message content must not be empty".to_string(),
            ));
        }
        if sender_id == receiver_id {
            return Err(DmError::InvalidArgument(
                "sender and receiver must differ".to_string(),
            ));
        }

        let conversation = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DmError::ConversationNotFound(conversation_id.to_string()))?;
        if !conversation.is_active {
            return Err(DmError::ConversationInactive(conversation_id.to_string()));
        }
        for participant in [sender_id, receiver_id] {
            if !conversation.has_participant(participant) {
                return Err(DmError::NotAParticipant {
                    conversation_id: conversation_id.to_string(),
                    participant_id: participant.to_string(),
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let timestamp = self.clock.now_millis();

        let inserted = messages::Entity::insert(messages::ActiveModel {
            id: Set(id.clone()),
            conversation_id: Set(conversation_id.to_string()),
            sender_id: Set(sender_id.to_string()),
            receiver_id: Set(receiver_id.to_string()),
            content: Set(content.to_string()),
            timestamp: Set(timestamp),
            delivery_status: Set(DeliveryStatus::Sent),
            delivered_at: Set(None),
            read_at: Set(None),
            is_edited: Set(false),
        })
        .exec_without_returning(&self.db)
        .await;

        if let Err(e) = inserted {
            error!("Failed to store message in {}: {}", conversation_id, e);
            return Err(e.into());
        }

        let message = Message::from(messages::Model {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            timestamp,
            delivery_status: DeliveryStatus::Sent,
            delivered_at: None,
            read_at: None,
            is_edited: false,
        });

        debug!("Stored message {} in {}", message.id, conversation_id);
        self.feed.publish(StoreChange::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });

        let bookkeeping: StepOutcome = self
            .conversations
            .record_message(&message)
            .await
            .inspect_err(|e| {
                warn!(
                    "Message {} stored but conversation {} summary is lagging: {}",
                    message.id, conversation_id, e
                )
            })
            .into();

        info!(
            "Message {} sent from {} to {}",
            message.id, sender_id, receiver_id
        );
        Ok(SendReceipt {
            message,
            bookkeeping,
        })
    }
}

/// Snapshot source behind [`MessageStore::subscribe_messages`]
struct MessageListSource {
    store: MessageStore,
    conversation_id: String,
}

#[async_trait]
impl SnapshotSource for MessageListSource {
    type Snapshot = Vec<Message>;

    fn describe(&self) -> String {
        format!("messages of {}", self.conversation_id)
    }

    async fn load(&self) -> DmResult<Vec<Message>> {
        self.store.list_messages(&self.conversation_id).await
    }

    fn is_relevant(&self, change: &StoreChange) -> bool {
        matches!(
            change,
            StoreChange::MessagesChanged { conversation_id } if *conversation_id == self.conversation_id
        )
    }
}
