//! Sea-ORM entities for medly-store

pub mod conversation_participants;
pub mod conversations;
pub mod messages;

