//! Message store implementations
//!
//! - `memory`: In-memory storage for tests and transient messages
//! - `test`: Memory storage with synchronization helpers for tests
//! - `file`: One bincode file per message, for production use

pub mod file;
pub mod memory;

pub use file::{FileMessageStore, FileMessageStoreBuilder};
pub use memory::MemoryMessageStore;
pub use test::TestMessageStore;
