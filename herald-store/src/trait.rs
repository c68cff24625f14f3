use async_trait::async_trait;
use herald_common::{Message, MessageId};

/// Persistence contract for messages
///
/// The store owns messages. The delivery engine writes every change to a
/// message's delivery fields through [`MessageStore::update`] before it acts
/// on that change, so a crash never loses a produced artifact or a lifecycle
/// transition.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Persist a message that is not yet stored.
    ///
    /// # Errors
    /// [`crate::StoreError::AlreadyExists`] if a message with the same ID is
    /// already stored, or a backend failure.
    async fn write(&self, message: &Message) -> crate::Result<()>;

    /// All stored message IDs, oldest first.
    async fn list(&self) -> crate::Result<Vec<MessageId>>;

    /// # Errors
    /// [`crate::StoreError::NotFound`] if the message is not stored.
    async fn read(&self, id: &MessageId) -> crate::Result<Message>;

    /// Replace a stored message.
    ///
    /// # Errors
    /// [`crate::StoreError::NotFound`] if the message is not stored.
    async fn update(&self, message: &Message) -> crate::Result<()>;

    /// # Errors
    /// [`crate::StoreError::NotFound`] if the message is not stored.
    async fn delete(&self, id: &MessageId) -> crate::Result<()>;
}
