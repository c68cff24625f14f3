//! Delivery engine for recorded messages
//!
//! This crate provides:
//! - Channels: named transports with an ordered step plan and a fallback
//! - Attempts: one cancellable run of a channel's plan for one message
//! - Recovery policies deciding between retry, backoff, interaction and
//!   fallback after a failure
//! - The dispatcher, which schedules attempts on a single worker and routes
//!   their outcomes
//! - An interaction bridge for asking the user to fix authorization problems

pub mod attempt;
pub mod channel;
mod dispatcher;
pub mod error;
pub mod events;
pub mod interaction;
pub mod recovery;
mod types;

pub use attempt::{AttemptHandle, AttemptState, DeliveryAttempt};
pub use channel::{
    Channel, ChannelConfig, ChannelRegistry, ChannelRegistryBuilder, ChannelSettings, StepContext,
    StepDescriptor, StepKind, StepOutput, Transport, standard_plan,
};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{
    AuthError, DeliveryError, ErrorKind, RegistryError, RejectionError, SystemError,
    TransientError, UnavailableError,
};
pub use events::{DeliveryEvent, DeliveryListener, EventHub, ListenerId};
pub use interaction::{
    BridgeMessage, ChannelBridge, InteractionBridge, InteractionId, InteractionKind,
    InteractionOutcome, InteractionRequest,
};
pub use recovery::{
    AuthRemedy, RecoveryConfig, RecoveryDecision, RecoveryPolicy, StandardRecoveryPolicy,
};
pub use types::{AttemptId, ChannelName, Outcome, Progress, SendStatus};
