use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use herald_common::{Message, MessageId};

use crate::{StoreError, r#trait::MessageStore};

/// In-memory message store
///
/// Messages live in a `HashMap` behind an `RwLock`. Intended for tests and
/// development; everything is lost on restart.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored messages. Writes beyond
/// it fail with [`StoreError::Internal`]; updates of stored messages always
/// succeed.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    pub(crate) messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    /// Maximum number of messages to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers gracefully if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn write(&self, message: &Message) -> crate::Result<()> {
        let mut messages = self.messages.write()?;

        if messages.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id));
        }

        if let Some(cap) = self.capacity
            && messages.len() >= cap
        {
            return Err(StoreError::Internal(format!(
                "Memory store capacity exceeded: {}/{cap} messages",
                messages.len(),
            )));
        }

        messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        let mut ids: Vec<_> = self.messages.read()?.keys().copied().collect();

        // ULIDs are lexicographically sortable by creation time
        ids.sort();

        Ok(ids)
    }

    async fn read(&self, id: &MessageId) -> crate::Result<Message> {
        self.messages
            .read()?
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    async fn update(&self, message: &Message) -> crate::Result<()> {
        match self.messages.write()?.get_mut(&message.id) {
            Some(stored) => {
                stored.clone_from(message);
                Ok(())
            }
            None => Err(StoreError::NotFound(message.id)),
        }
    }

    async fn delete(&self, id: &MessageId) -> crate::Result<()> {
        self.messages
            .write()?
            .remove(id)
            .ok_or(StoreError::NotFound(*id))?;
        Ok(())
    }
}
