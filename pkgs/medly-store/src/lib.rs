//! Medly Store - conversations and direct messages for the Medly companion app
//!
//! This crate keeps two-party (and group) conversations, their message logs
//! and per-participant unread counters in SQLite using Sea-ORM.
//!
//! # Architecture
//!
//! - **ConversationStore**: participant sets, last-message summary, unread
//!   counters, soft delete, pair deduplication
//! - **MessageStore**: append-only message log ordered by server timestamps
//! - **DeliveryTracker**: batch `sent -> delivered -> read` transitions and
//!   unread counter repair
//! - **Subscription**: cancellable streams of full snapshots, refreshed on
//!   every relevant write
//! - **DirectMessaging**: the caller-facing API bundling all of the above
//!
//! # Consistency
//!
//! Storing a message and updating the conversation summary/unread counter are
//! two separate writes, as are a read batch and the counter reset that follows
//! it. Both pairs converge but may be observed half-applied; the receipts
//! returned by the send and read operations report the second step's outcome.
//!
//! # Database Schema
//!
//! - `conversations`: summary fields, active flag, unique pair key
//! - `conversation_participants`: display name and unread count per participant
//! - `messages`: content, server timestamp, delivery status
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use medly_store::{DirectMessaging, SessionIdentity, StoreConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig {
//!     db_path: "medly.db".into(),
//!     ..Default::default()
//! };
//! let dm = DirectMessaging::open(&config, Arc::new(SessionIdentity::signed_in("u1"))).await?;
//!
//! let conv = dm.create_or_get_conversation("u1", "u2", "Alice", "Bob").await?;
//! dm.send_message(&conv.id, "u1", "u2", "hello").await?;
//!
//! dm.mark_messages_as_delivered(&conv.id, "u2").await?;
//! dm.mark_messages_as_read(&conv.id, "u2").await?;
//! assert_eq!(dm.get_total_unread_count("u2").await?, 0);
//! # Ok(())
//! # }
//! ```

pub mod change_feed;
pub mod clock;
pub mod conversation_store;
pub mod delivery_tracker;
pub mod direct_messaging;
pub mod entities;
pub mod error;
pub mod identity;
pub mod message_store;
pub mod migration;
pub mod models;
pub mod subscription;

pub use change_feed::{ChangeFeed, StoreChange};
pub use clock::ServerClock;
pub use conversation_store::{dedup_key, ConversationStore};
pub use delivery_tracker::DeliveryTracker;
pub use direct_messaging::DirectMessaging;
pub use entities::messages::DeliveryStatus;
pub use error::{DmError, DmResult, ErrorKind, ResultExt};
pub use identity::{IdentityProvider, SessionIdentity};
pub use message_store::MessageStore;
pub use models::{
    sort_by_recent_activity, Conversation, Message, ReadReceipt, SendReceipt, StepOutcome,
};
pub use subscription::Subscription;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: std::path::PathBuf,

    /// Store changes buffered for slow subscriptions before they reload (default: 256)
    pub change_feed_capacity: usize,

    /// Snapshots queued per subscription before the producer waits (default: 16)
    pub subscription_buffer: usize,

    /// Pooled database connections (default: 1, SQLite has a single writer)
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::path::PathBuf::from("medly-store.db"),
            change_feed_capacity: 256,
            subscription_buffer: 16,
            max_connections: 1,
        }
    }
}

impl StoreConfig {
    /// SQLite connection URL, creating the file if needed
    pub fn database_url(&self) -> DmResult<String> {
        let path = self
            .db_path
            .to_str()
            .ok_or_else(|| DmError::InvalidPath(self.db_path.clone()))?
            .replace('\\', "/");

        Ok(format!("sqlite:{}?mode=rwc", path))
    }
}

/// Connect to the configured database and bring its schema up to date
pub async fn connect(config: &StoreConfig) -> DmResult<DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database_url()?);
    options.max_connections(config.max_connections.max(1));

    let db = Database::connect(options).await?;

    migration::Migrator::up(&db, None).await?;

    info!("Message database initialized at {}", config.db_path.display());
    Ok(db)
}
