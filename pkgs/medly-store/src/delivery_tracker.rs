//! Delivery tracker - moves messages through `sent -> delivered -> read`
//!
//! Every transition is a single transaction that only matches messages still
//! in the expected prior state, so a batch either applies completely or not
//! at all and never moves a message backwards, whatever other writers do.
//!
//! Reading also resets the reader's unread counter. That reset is a second,
//! independent write: the two converge but are not atomic together, and the
//! returned [`ReadReceipt`] says whether the reset went through.

use crate::change_feed::{ChangeFeed, StoreChange};
use crate::conversation_store::ConversationStore;
use crate::entities::messages;
use crate::error::{DmError, DmResult};
use crate::models::{ReadReceipt, StepOutcome};
use crate::DeliveryStatus;
use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Delivery tracker
#[derive(Clone)]
pub struct DeliveryTracker {
    db: DatabaseConnection,
    conversations: ConversationStore,
    feed: ChangeFeed,
}

impl DeliveryTracker {
    pub fn new(db: DatabaseConnection, conversations: ConversationStore, feed: ChangeFeed) -> Self {
        Self {
            db,
            conversations,
            feed,
        }
    }

    /// Move every `sent` message addressed to `user_id` to `delivered`.
    ///
    /// Returns the ids that changed, oldest first.
    pub async fn mark_delivered(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> DmResult<Vec<String>> {
        self.advance(
            conversation_id,
            user_id,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
        )
        .await
        .inspect_err(|e| {
            warn!(
                "Failed to mark messages delivered in {} for {}: {}",
                conversation_id, user_id, e
            )
        })
    }

    /// Move every `delivered` message addressed to `user_id` to `read`, then
    /// reset `user_id`'s unread counter.
    ///
    /// Messages still in `sent` are left alone. The counter is reset even
    /// when no message changed state.
    pub async fn mark_read(&self, conversation_id: &str, user_id: &str) -> DmResult<ReadReceipt> {
        let message_ids = self
            .advance(
                conversation_id,
                user_id,
                DeliveryStatus::Delivered,
                DeliveryStatus::Read,
            )
            .await
            .inspect_err(|e| {
                warn!(
                    "Failed to mark messages read in {} for {}: {}",
                    conversation_id, user_id, e
                )
            })?;

        let counter_reset: StepOutcome = self
            .conversations
            .mark_read(conversation_id, user_id)
            .await
            .inspect_err(|e| {
                warn!(
                    "Messages read in {} but unread counter of {} not reset: {}",
                    conversation_id, user_id, e
                )
            })
            .into();

        Ok(ReadReceipt {
            message_ids,
            counter_reset,
        })
    }

    /// Rebuild every participant's unread counter from the message log.
    ///
    /// A message counts as unread for its receiver until it reaches `read`.
    pub async fn recompute_unread(&self, conversation_id: &str) -> DmResult<BTreeMap<String, u32>> {
        let conversation = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DmError::ConversationNotFound(conversation_id.to_string()))?;

        let pending: Vec<(String, i64)> = messages::Entity::find()
            .select_only()
            .column(messages::Column::ReceiverId)
            .column_as(Expr::col(messages::Column::Id).count(), "pending")
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .filter(messages::Column::DeliveryStatus.ne(DeliveryStatus::Read))
            .group_by(messages::Column::ReceiverId)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts: BTreeMap<String, u32> = conversation
            .participant_ids
            .iter()
            .map(|p| (p.clone(), 0))
            .collect();
        for (receiver_id, count) in pending {
            match counts.get_mut(&receiver_id) {
                Some(slot) => *slot = u32::try_from(count).unwrap_or(u32::MAX),
                None => debug!(
                    "Ignoring {} messages for non-participant {} in {}",
                    count, receiver_id, conversation_id
                ),
            }
        }

        self.conversations
            .set_unread_counts(conversation_id, &counts)
            .await?;

        info!("Recomputed unread counters of {}: {:?}", conversation_id, counts);
        Ok(counts)
    }

    async fn advance(
        &self,
        conversation_id: &str,
        user_id: &str,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> DmResult<Vec<String>> {
        if !from.can_advance_to(to) {
            return Err(DmError::InvalidArgument(format!(
                "cannot move messages from {:?} to {:?}",
                from, to
            )));
        }

        let now = Utc::now().timestamp_millis();
        let txn = self.db.begin().await?;

        let ids: Vec<String> = messages::Entity::find()
            .select_only()
            .column(messages::Column::Id)
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .filter(messages::Column::ReceiverId.eq(user_id))
            .filter(messages::Column::DeliveryStatus.eq(from))
            .order_by_asc(messages::Column::Timestamp)
            .into_tuple()
            .all(&txn)
            .await?;

        if ids.is_empty() {
            txn.commit().await?;
            debug!(
                "No {:?} messages for {} in {}",
                from, user_id, conversation_id
            );
            return Ok(ids);
        }

        let mut stamp = messages::ActiveModel {
            delivery_status: Set(to),
            ..Default::default()
        };
        match to {
            DeliveryStatus::Delivered => stamp.delivered_at = Set(Some(now)),
            DeliveryStatus::Read => stamp.read_at = Set(Some(now)),
            DeliveryStatus::Sent => {}
        }

        let result = messages::Entity::update_many()
            .set(stamp)
            .filter(messages::Column::Id.is_in(ids.clone()))
            .filter(messages::Column::DeliveryStatus.eq(from))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        debug!(
            "Moved {} of {} messages in {} from {:?} to {:?} for {}",
            result.rows_affected,
            ids.len(),
            conversation_id,
            from,
            to,
            user_id
        );
        self.feed.publish(StoreChange::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(ids)
    }
}
