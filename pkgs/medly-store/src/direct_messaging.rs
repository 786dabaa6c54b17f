//! Caller-facing direct messaging API
//!
//! Bundles the conversation store, message store and delivery tracker over a
//! single injected database connection and change feed.

use crate::change_feed::ChangeFeed;
use crate::conversation_store::ConversationStore;
use crate::delivery_tracker::DeliveryTracker;
use crate::error::{DmError, DmResult};
use crate::identity::IdentityProvider;
use crate::message_store::MessageStore;
use crate::models::{Conversation, Message, ReadReceipt, SendReceipt};
use crate::subscription::Subscription;
use crate::StoreConfig;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::info;

/// Direct messaging service
#[derive(Clone)]
pub struct DirectMessaging {
    conversations: ConversationStore,
    messages: MessageStore,
    tracker: DeliveryTracker,
    identity: Arc<dyn IdentityProvider>,
}

impl DirectMessaging {
    /// Open (and migrate) the database described by `config`
    pub async fn open(config: &StoreConfig, identity: Arc<dyn IdentityProvider>) -> DmResult<Self> {
        let db = crate::connect(config).await?;
        let service = Self::with_connection(db, config, identity).await?;
        info!("Direct messaging ready at {}", config.db_path.display());
        Ok(service)
    }

    /// Build the service over an existing, migrated connection.
    ///
    /// The message clock is moved past the newest stored message before the
    /// service is returned.
    pub async fn with_connection(
        db: DatabaseConnection,
        config: &StoreConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> DmResult<Self> {
        let feed = ChangeFeed::new(config.change_feed_capacity);
        let conversations = ConversationStore::new(db.clone(), feed.clone())
            .with_subscription_buffer(config.subscription_buffer);
        let messages = MessageStore::new(db.clone(), conversations.clone(), feed.clone())
            .with_subscription_buffer(config.subscription_buffer);
        let tracker = DeliveryTracker::new(db, conversations.clone(), feed);

        messages.resume_clock().await?;

        Ok(Self {
            conversations,
            messages,
            tracker,
            identity,
        })
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// The signed-in participant, or [`DmError::Unauthenticated`]
    pub fn current_user(&self) -> DmResult<String> {
        self.identity
            .current_user_id()
            .ok_or(DmError::Unauthenticated)
    }

    pub async fn list_conversations(&self, user_id: &str) -> DmResult<Vec<Conversation>> {
        self.conversations.list_conversations(user_id).await
    }

    pub fn subscribe_conversations(&self, user_id: &str) -> Subscription<Vec<Conversation>> {
        self.conversations.subscribe_conversations(user_id)
    }

    pub async fn create_or_get_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        name_a: &str,
        name_b: &str,
    ) -> DmResult<Conversation> {
        self.conversations
            .create_or_get_conversation(user_a, user_b, name_a, name_b)
            .await
    }

    pub async fn list_messages(&self, conversation_id: &str) -> DmResult<Vec<Message>> {
        self.messages.list_messages(conversation_id).await
    }

    pub fn subscribe_messages(&self, conversation_id: &str) -> Subscription<Vec<Message>> {
        self.messages.subscribe_messages(conversation_id)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> DmResult<SendReceipt> {
        self.messages
            .send_message(conversation_id, sender_id, receiver_id, content)
            .await
    }

    pub async fn mark_messages_as_read(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> DmResult<ReadReceipt> {
        self.tracker.mark_read(conversation_id, user_id).await
    }

    pub async fn mark_messages_as_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> DmResult<Vec<String>> {
        self.tracker.mark_delivered(conversation_id, user_id).await
    }

    pub async fn get_total_unread_count(&self, user_id: &str) -> DmResult<u64> {
        self.conversations.total_unread(user_id).await
    }

    /// Soft delete; the conversation's messages are kept
    pub async fn delete_conversation(&self, conversation_id: &str) -> DmResult<()> {
        self.conversations.soft_delete(conversation_id).await
    }

    /// Conversations of the signed-in participant; empty when signed out
    pub async fn my_conversations(&self) -> DmResult<Vec<Conversation>> {
        match self.identity.current_user_id() {
            Some(user_id) => self.list_conversations(&user_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Total unread of the signed-in participant; zero when signed out
    pub async fn my_total_unread_count(&self) -> DmResult<u64> {
        match self.identity.current_user_id() {
            Some(user_id) => self.get_total_unread_count(&user_id).await,
            None => Ok(0),
        }
    }

    /// Send as the signed-in participant to the other side of a two-party conversation
    pub async fn reply(&self, conversation_id: &str, content: &str) -> DmResult<SendReceipt> {
        let me = self.current_user()?;
        let conversation = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DmError::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.is_group {
            return Err(DmError::InvalidArgument(
                "reply needs a two-party conversation".to_string(),
            ));
        }
        let receiver = conversation
            .counterpart_of(&me)
            .ok_or_else(|| DmError::NotAParticipant {
                conversation_id: conversation_id.to_string(),
                participant_id: me.clone(),
            })?
            .to_string();

        self.send_message(conversation_id, &me, &receiver, content)
            .await
    }
}
