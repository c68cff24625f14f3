pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;

pub use backends::{FileMessageStore, FileMessageStoreBuilder, MemoryMessageStore, TestMessageStore};
pub use config::{MemoryConfig, StoreConfig};
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use r#trait::MessageStore;
