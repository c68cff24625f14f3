use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileMessageStore, MemoryMessageStore},
    r#trait::MessageStore,
};

/// Configuration for the message store
///
/// # Examples
///
/// File-backed store in RON config:
/// ```ron
/// Herald (
///     store: (
///         type: "File",
///         path: "/var/lib/herald/messages",
///     ),
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// Herald (
///     store: (
///         type: "Memory",
///         capacity: 1000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    File(FileMessageStore),
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileMessageStore::default())
    }
}

impl StoreConfig {
    /// `Some(path)` for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Build the configured store, initialising it where that applies.
    ///
    /// # Errors
    /// Returns an error if a file-backed store cannot create or read its
    /// directory.
    pub fn into_store(self) -> crate::Result<Arc<dyn MessageStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => Ok(config.capacity.map_or_else(
                || Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>,
                |capacity| Arc::new(MemoryMessageStore::with_capacity(capacity)),
            )),
        }
    }
}
