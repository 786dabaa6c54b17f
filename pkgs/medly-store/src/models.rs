//! Public conversation and message types

use crate::entities::{conversation_participants, conversations, messages};
use crate::DeliveryStatus;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// A messaging thread between a fixed set of participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub participant_names: BTreeMap<String, String>,
    pub is_group: bool,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender: Option<String>,
    pub unread_count: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Conversation {
    /// Unread messages addressed to `participant_id`, zero for non-participants
    pub fn unread_for(&self, participant_id: &str) -> u32 {
        self.unread_count.get(participant_id).copied().unwrap_or(0)
    }

    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == participant_id)
    }

    /// The other side of a two-party conversation
    pub fn counterpart_of(&self, participant_id: &str) -> Option<&str> {
        if self.is_group || !self.has_participant(participant_id) {
            return None;
        }
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|p| *p != participant_id)
    }

    pub(crate) fn from_models(
        model: conversations::Model,
        participants: Vec<conversation_participants::Model>,
    ) -> Self {
        let mut participant_ids = Vec::with_capacity(participants.len());
        let mut participant_names = BTreeMap::new();
        let mut unread_count = BTreeMap::new();
        for p in participants {
            participant_ids.push(p.participant_id.clone());
            unread_count.insert(p.participant_id.clone(), p.unread_count.max(0) as u32);
            participant_names.insert(p.participant_id, p.display_name);
        }
        participant_ids.sort();

        Self {
            id: model.id,
            participant_ids,
            participant_names,
            is_group: model.is_group,
            last_message: model.last_message,
            last_message_time: model.last_message_time.and_then(from_millis),
            last_message_sender: model.last_message_sender,
            unread_count,
            created_at: from_millis(model.created_at).unwrap_or_default(),
            is_active: model.is_active,
        }
    }
}

/// Order conversations newest-activity first.
///
/// Conversations without any message sort last; equal times fall back to
/// ascending id so the result is the same on every call.
pub fn sort_by_recent_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        Reverse(a.last_message_time)
            .cmp(&Reverse(b.last_message_time))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// A single message inside a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
}

impl From<messages::Model> for Message {
    fn from(model: messages::Model) -> Self {
        Self {
            id: model.id,
            conversation_id: model.conversation_id,
            sender_id: model.sender_id,
            receiver_id: model.receiver_id,
            content: model.content,
            timestamp: from_millis(model.timestamp).unwrap_or_default(),
            delivery_status: model.delivery_status,
            delivered_at: model.delivered_at.and_then(from_millis),
            read_at: model.read_at.and_then(from_millis),
            is_edited: model.is_edited,
        }
    }
}

/// Result of a follow-up write that runs after the primary write succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum StepOutcome {
    Applied,
    Failed(String),
}

impl StepOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for StepOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Applied,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// What `send_message` persisted, and whether the conversation summary and
/// the receiver's unread counter caught up with it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message: Message,
    pub bookkeeping: StepOutcome,
}

/// Messages moved to `read`, and whether the reader's unread counter was reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_ids: Vec<String>,
    pub counter_reset: StepOutcome,
}

pub(crate) fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
