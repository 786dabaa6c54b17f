//! In-process change notifications published by every store write

use tokio::sync::broadcast;
use tracing::trace;

/// A write that may have changed what some subscriber sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    ConversationCreated {
        conversation_id: String,
        participant_ids: Vec<String>,
    },
    /// Summary, unread counters or active flag changed
    ConversationUpdated { conversation_id: String },
    /// A message was appended or changed delivery status
    MessagesChanged { conversation_id: String },
}

impl StoreChange {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::ConversationCreated {
                conversation_id, ..
            }
            | Self::ConversationUpdated { conversation_id }
            | Self::MessagesChanged { conversation_id } => conversation_id,
        }
    }
}

/// Fan-out of [`StoreChange`] events to live subscriptions
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, change: StoreChange) {
        // No receivers just means nobody is watching right now
        if self.sender.send(change).is_err() {
            trace!("Change dropped, no active subscriptions");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(crate::StoreConfig::default().change_feed_capacity)
    }
}
