pub mod id;
pub mod logging;
pub mod message;
pub mod recipient;

pub use id::MessageId;
pub use message::{
    ArtifactKey, Artifacts, LifecycleError, LifecycleState, Message, Recording,
};
pub use recipient::{Capability, Recipient};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
