//! Deciding what happens after a failed attempt

pub mod backoff;
pub mod standard;

use std::time::Duration;

use herald_common::{Message, MessageId};

pub use self::standard::{AuthRemedy, RecoveryConfig, StandardRecoveryPolicy};
use crate::{error::DeliveryError, interaction::InteractionRequest, types::ChannelName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run the same attempt again straight away.
    RetryNow,
    /// Park the message until the host answers the request, then retry.
    RetryAfterInteraction(InteractionRequest),
    /// Run the same attempt again once `delay` has passed.
    RetryWithBackoff { attempt: u32, delay: Duration },
    /// Stop trying on this channel.
    Exhausted,
}

/// Per-channel classification of failures
///
/// A policy holds no state besides its retry bookkeeping, which it drops for
/// a message on [`RecoveryPolicy::forget`].
pub trait RecoveryPolicy: Send + Sync + std::fmt::Debug {
    fn classify(
        &self,
        message: &Message,
        channel: &ChannelName,
        error: &DeliveryError,
    ) -> RecoveryDecision;

    fn forget(&self, message: &MessageId);

    /// Failures classified so far for `message` on `channel`
    fn failures(&self, _message: &MessageId, _channel: &ChannelName) -> u32 {
        0
    }
}
