//! Conversation store - participant sets, last-message summaries and
//! per-participant unread counters

use crate::change_feed::{ChangeFeed, StoreChange};
use crate::entities::{conversation_participants, conversations};
use crate::error::{DmError, DmResult};
use crate::models::{sort_by_recent_activity, Conversation, Message};
use crate::subscription::{SnapshotSource, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, SqlErr, TransactionTrait,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deterministic key for the active conversation between two participants.
///
/// The pair is sorted first, so `dedup_key(a, b) == dedup_key(b, a)`.
pub fn dedup_key(user_a: &str, user_b: &str) -> String {
    let (first, second) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };

    let mut hasher = Sha256::new();
    for id in [first, second] {
        hasher.update((id.len() as u64).to_be_bytes());
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Use the ordered listing when it succeeded, otherwise load `fallback` and
/// sort it in memory with the same ordering
async fn recent_first_or_sorted<F>(
    ordered: DmResult<Vec<Conversation>>,
    fallback: F,
    user_id: &str,
) -> DmResult<Vec<Conversation>>
where
    F: Future<Output = DmResult<Vec<Conversation>>>,
{
    match ordered {
        Ok(convs) => Ok(convs),
        Err(e) => {
            warn!(
                "Ordered conversation query failed for {}, sorting in memory: {}",
                user_id, e
            );
            let mut convs = fallback.await?;
            sort_by_recent_activity(&mut convs);
            Ok(convs)
        }
    }
}

/// Stored form of an unread counter, saturating at the column's range
fn counter_value(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn require_id(value: &str, what: &str) -> DmResult<()> {
    if value.trim().is_empty() {
        return Err(DmError::InvalidArgument(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Conversation store
#[derive(Clone)]
pub struct ConversationStore {
    pub(crate) db: DatabaseConnection,
    feed: ChangeFeed,
    subscription_buffer: usize,
}

impl ConversationStore {
    /// Create a conversation store over an existing, migrated connection
    pub fn new(db: DatabaseConnection, feed: ChangeFeed) -> Self {
        Self {
            db,
            feed,
            subscription_buffer: crate::StoreConfig::default().subscription_buffer,
        }
    }

    pub fn with_subscription_buffer(mut self, buffer: usize) -> Self {
        self.subscription_buffer = buffer;
        self
    }

    /// Active conversations of `user_id`, most recent activity first
    pub async fn list_conversations(&self, user_id: &str) -> DmResult<Vec<Conversation>> {
        let conversation_ids: Vec<String> = conversation_participants::Entity::find()
            .select_only()
            .column(conversation_participants::Column::ConversationId)
            .filter(conversation_participants::Column::ParticipantId.eq(user_id))
            .into_tuple()
            .all(&self.db)
            .await?;

        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let active = conversations::Entity::find()
            .filter(conversations::Column::Id.is_in(conversation_ids))
            .filter(conversations::Column::IsActive.eq(true));

        let ordered = async {
            let models = active
                .clone()
                .order_by_desc(conversations::Column::LastMessageTime)
                .order_by_asc(conversations::Column::Id)
                .all(&self.db)
                .await?;
            self.attach_participants(models).await
        }
        .await;
        let unordered = async {
            let models = active.all(&self.db).await?;
            self.attach_participants(models).await
        };

        let convs = recent_first_or_sorted(ordered, unordered, user_id).await?;

        debug!("Listed {} conversations for {}", convs.len(), user_id);
        Ok(convs)
    }

    /// Live view of [`list_conversations`](Self::list_conversations)
    pub fn subscribe_conversations(&self, user_id: &str) -> Subscription<Vec<Conversation>> {
        let source = ConversationListSource {
            store: self.clone(),
            user_id: user_id.to_string(),
            visible: HashSet::new(),
        };
        Subscription::spawn(source, &self.feed, self.subscription_buffer)
    }

    /// Get a single conversation by ID, active or not
    pub async fn get_conversation(&self, id: &str) -> DmResult<Option<Conversation>> {
        let model = conversations::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?;

        match model {
            Some(model) => Ok(self.attach_participants(vec![model]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Return the active conversation between `user_a` and `user_b`, creating
    /// it when there is none.
    ///
    /// An existing conversation is returned unchanged; the display names are
    /// only used for a new one.
    pub async fn create_or_get_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        name_a: &str,
        name_b: &str,
    ) -> DmResult<Conversation> {
        require_id(user_a, "participant id")?;
        require_id(user_b, "participant id")?;
        if user_a == user_b {
            return Err(DmError::InvalidArgument(
                "a conversation needs two different participants".to_string(),
            ));
        }

        let key = dedup_key(user_a, user_b);
        if let Some(existing) = self.find_active_by_key(&key).await? {
            debug!(
                "Reusing conversation {} between {} and {}",
                existing.id, user_a, user_b
            );
            return Ok(existing);
        }

        let participants = [(user_a, name_a), (user_b, name_b)];
        match self.insert_conversation(Some(key.clone()), false, &participants).await {
            Ok(conv) => Ok(conv),
            Err(DmError::Database(e)) if is_unique_violation(&e) => {
                // Lost the race against a concurrent create for the same pair
                info!(
                    "Conversation between {} and {} was created concurrently, reusing it",
                    user_a, user_b
                );
                self.find_active_by_key(&key)
                    .await?
                    .ok_or(DmError::Database(e))
            }
            Err(e) => {
                error!(
                    "Failed to create conversation between {} and {}: {}",
                    user_a, user_b, e
                );
                Err(e)
            }
        }
    }

    /// Create a group conversation. Groups are never deduplicated.
    pub async fn create_group_conversation(
        &self,
        participants: &[(&str, &str)],
    ) -> DmResult<Conversation> {
        let mut seen = HashSet::new();
        for (id, _) in participants {
            require_id(id, "participant id")?;
            if !seen.insert(*id) {
                return Err(DmError::InvalidArgument(format!(
                    "participant {} listed twice",
                    id
                )));
            }
        }
        if participants.len() < 3 {
            return Err(DmError::InvalidArgument(
                "a group needs at least three participants".to_string(),
            ));
        }

        self.insert_conversation(None, true, participants)
            .await
            .inspect_err(|e| error!("Failed to create group conversation: {}", e))
    }

    /// Reset `user_id`'s unread counter to zero
    pub async fn mark_read(&self, conversation_id: &str, user_id: &str) -> DmResult<()> {
        let result = conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::UnreadCount, Expr::value(0))
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::ParticipantId.eq(user_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.missing_participant(conversation_id, user_id).await);
        }

        debug!("Reset unread count of {} in {}", user_id, conversation_id);
        self.publish_updated(conversation_id);
        Ok(())
    }

    /// Atomically add one to `user_id`'s unread counter
    pub async fn increment_unread(&self, conversation_id: &str, user_id: &str) -> DmResult<()> {
        let result = Self::bump_unread()
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::ParticipantId.eq(user_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.missing_participant(conversation_id, user_id).await);
        }

        self.publish_updated(conversation_id);
        Ok(())
    }

    /// Fold a freshly stored message into the conversation: summary fields
    /// plus one more unread message for the receiver, in one transaction.
    ///
    /// The summary is only overwritten by a message at least as new as the
    /// current one, so late updates from older sends cannot roll it back.
    pub(crate) async fn record_message(&self, message: &Message) -> DmResult<()> {
        let ts = message.timestamp.timestamp_millis();
        let txn = self.db.begin().await?;

        conversations::Entity::update_many()
            .col_expr(
                conversations::Column::LastMessage,
                Expr::value(message.content.clone()),
            )
            .col_expr(conversations::Column::LastMessageTime, Expr::value(ts))
            .col_expr(
                conversations::Column::LastMessageSender,
                Expr::value(message.sender_id.clone()),
            )
            .col_expr(
                conversations::Column::UpdatedAt,
                Expr::value(Utc::now().timestamp_millis()),
            )
            .filter(conversations::Column::Id.eq(message.conversation_id.as_str()))
            .filter(
                Condition::any()
                    .add(conversations::Column::LastMessageTime.is_null())
                    .add(conversations::Column::LastMessageTime.lte(ts)),
            )
            .exec(&txn)
            .await?;

        let bumped = Self::bump_unread()
            .filter(
                conversation_participants::Column::ConversationId
                    .eq(message.conversation_id.as_str()),
            )
            .filter(conversation_participants::Column::ParticipantId.eq(message.receiver_id.as_str()))
            .exec(&txn)
            .await?;

        if bumped.rows_affected == 0 {
            return Err(DmError::NotAParticipant {
                conversation_id: message.conversation_id.clone(),
                participant_id: message.receiver_id.clone(),
            });
        }

        txn.commit().await?;

        self.publish_updated(&message.conversation_id);
        Ok(())
    }

    /// Overwrite the unread counters of the listed participants
    pub(crate) async fn set_unread_counts(
        &self,
        conversation_id: &str,
        counts: &BTreeMap<String, u32>,
    ) -> DmResult<()> {
        let txn = self.db.begin().await?;
        for (participant_id, count) in counts {
            conversation_participants::Entity::update_many()
                .col_expr(
                    conversation_participants::Column::UnreadCount,
                    Expr::value(counter_value(*count)),
                )
                .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
                .filter(
                    conversation_participants::Column::ParticipantId.eq(participant_id.as_str()),
                )
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;

        self.publish_updated(conversation_id);
        Ok(())
    }

    /// Mark a conversation inactive. Messages are kept; calling this again is a no-op.
    pub async fn soft_delete(&self, conversation_id: &str) -> DmResult<()> {
        let result = conversations::Entity::update_many()
            .col_expr(conversations::Column::IsActive, Expr::value(false))
            // Release the pair key so the two participants can start over
            .col_expr(
                conversations::Column::DedupKey,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                conversations::Column::UpdatedAt,
                Expr::value(Utc::now().timestamp_millis()),
            )
            .filter(conversations::Column::Id.eq(conversation_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(DmError::ConversationNotFound(conversation_id.to_string()));
        }

        info!("Soft-deleted conversation {}", conversation_id);
        self.publish_updated(conversation_id);
        Ok(())
    }

    /// Sum of `user_id`'s unread counters over [`list_conversations`](Self::list_conversations)
    pub async fn total_unread(&self, user_id: &str) -> DmResult<u64> {
        let total = self
            .list_conversations(user_id)
            .await?
            .iter()
            .map(|c| u64::from(c.unread_for(user_id)))
            .sum();
        Ok(total)
    }

    fn bump_unread() -> sea_orm::UpdateMany<conversation_participants::Entity> {
        conversation_participants::Entity::update_many().col_expr(
            conversation_participants::Column::UnreadCount,
            Expr::col(conversation_participants::Column::UnreadCount).add(1),
        )
    }

    async fn find_active_by_key(&self, key: &str) -> DmResult<Option<Conversation>> {
        let model = conversations::Entity::find()
            .filter(conversations::Column::DedupKey.eq(key))
            .filter(conversations::Column::IsActive.eq(true))
            .one(&self.db)
            .await?;

        match model {
            Some(model) => Ok(self.attach_participants(vec![model]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn insert_conversation(
        &self,
        dedup_key: Option<String>,
        is_group: bool,
        participants: &[(&str, &str)],
    ) -> DmResult<Conversation> {
        let now = Utc::now().timestamp_millis();
        let conversation = conversations::Model {
            id: Uuid::new_v4().to_string(),
            dedup_key,
            is_group,
            last_message: None,
            last_message_time: None,
            last_message_sender: None,
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        let members: Vec<conversation_participants::Model> = participants
            .iter()
            .map(|(id, name)| conversation_participants::Model {
                conversation_id: conversation.id.clone(),
                participant_id: id.to_string(),
                display_name: name.to_string(),
                unread_count: 0,
                joined_at: now,
            })
            .collect();

        let txn = self.db.begin().await?;

        conversations::Entity::insert(conversations::ActiveModel {
            id: Set(conversation.id.clone()),
            dedup_key: Set(conversation.dedup_key.clone()),
            is_group: Set(conversation.is_group),
            last_message: Set(None),
            last_message_time: Set(None),
            last_message_sender: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            is_active: Set(true),
        })
        .exec_without_returning(&txn)
        .await?;

        conversation_participants::Entity::insert_many(members.iter().map(|m| {
            conversation_participants::ActiveModel {
                conversation_id: Set(m.conversation_id.clone()),
                participant_id: Set(m.participant_id.clone()),
                display_name: Set(m.display_name.clone()),
                unread_count: Set(0),
                joined_at: Set(now),
            }
        }))
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;

        info!(
            "Created {} conversation {} with {} participants",
            if is_group { "group" } else { "direct" },
            conversation.id,
            members.len()
        );

        let participant_ids = members.iter().map(|m| m.participant_id.clone()).collect();
        self.feed.publish(StoreChange::ConversationCreated {
            conversation_id: conversation.id.clone(),
            participant_ids,
        });

        Ok(Conversation::from_models(conversation, members))
    }

    async fn attach_participants(
        &self,
        models: Vec<conversations::Model>,
    ) -> DmResult<Vec<Conversation>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
        let rows = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::ConversationId.is_in(ids))
            .all(&self.db)
            .await?;

        let mut by_conversation: HashMap<String, Vec<conversation_participants::Model>> =
            HashMap::new();
        for row in rows {
            by_conversation
                .entry(row.conversation_id.clone())
                .or_default()
                .push(row);
        }

        Ok(models
            .into_iter()
            .map(|model| {
                let participants = by_conversation.remove(&model.id).unwrap_or_default();
                Conversation::from_models(model, participants)
            })
            .collect())
    }

    /// Work out why a participant row was not found
    async fn missing_participant(&self, conversation_id: &str, user_id: &str) -> DmError {
        match conversations::Entity::find_by_id(conversation_id.to_string())
            .one(&self.db)
            .await
        {
            Ok(Some(_)) => DmError::NotAParticipant {
                conversation_id: conversation_id.to_string(),
                participant_id: user_id.to_string(),
            },
            Ok(None) => DmError::ConversationNotFound(conversation_id.to_string()),
            Err(e) => e.into(),
        }
    }

    fn publish_updated(&self, conversation_id: &str) {
        self.feed.publish(StoreChange::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
    }
}

/// Snapshot source behind [`ConversationStore::subscribe_conversations`]
struct ConversationListSource {
    store: ConversationStore,
    user_id: String,
    visible: HashSet<String>,
}

#[async_trait]
impl SnapshotSource for ConversationListSource {
    type Snapshot = Vec<Conversation>;

    fn describe(&self) -> String {
        format!("conversations of {}", self.user_id)
    }

    async fn load(&self) -> DmResult<Vec<Conversation>> {
        self.store.list_conversations(&self.user_id).await
    }

    fn is_relevant(&self, change: &StoreChange) -> bool {
        match change {
            StoreChange::ConversationCreated {
                participant_ids, ..
            } => participant_ids.iter().any(|p| *p == self.user_id),
            StoreChange::ConversationUpdated { conversation_id } => {
                self.visible.contains(conversation_id)
            }
            StoreChange::MessagesChanged { .. } => false,
        }
    }

    fn observe(&mut self, snapshot: &Vec<Conversation>) {
        self.visible = snapshot.iter().map(|c| c.id.clone()).collect();
    }
}
