use dashmap::DashMap;
use herald_common::{Message, MessageId};
use serde::Deserialize;

use super::{RecoveryDecision, RecoveryPolicy, backoff::retry_delay};
use crate::{
    error::{DeliveryError, ErrorKind},
    interaction::{InteractionKind, InteractionRequest},
    types::ChannelName,
};

mod defaults {
    use super::AuthRemedy;

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_retry_delay_ms() -> u64 {
        1_000
    }

    pub const fn max_retry_delay_ms() -> u64 {
        60_000
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.2 // ±20%
    }

    pub const fn on_auth_expired() -> AuthRemedy {
        AuthRemedy::Reauthorize
    }

    pub const fn on_auth_ambiguous() -> AuthRemedy {
        AuthRemedy::ChooseAccount
    }

    pub const fn on_permission_required() -> AuthRemedy {
        AuthRemedy::GrantPermission
    }
}

/// What to ask the user for when a channel reports an auth problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthRemedy {
    Reauthorize,
    ChooseAccount,
    GrantPermission,
    /// Give up on the channel without asking.
    Fail,
}

impl AuthRemedy {
    const fn interaction(self) -> Option<InteractionKind> {
        match self {
            Self::Reauthorize => Some(InteractionKind::Reauthorize),
            Self::ChooseAccount => Some(InteractionKind::ChooseAccount),
            Self::GrantPermission => Some(InteractionKind::GrantPermission),
            Self::Fail => None,
        }
    }
}

/// Configuration for [`StandardRecoveryPolicy`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecoveryConfig {
    /// Failures tolerated per message on a channel before it is exhausted
    ///
    /// Default: 3 (so at most 4 attempts)
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Back off on transient failures instead of retrying immediately
    ///
    /// Default: `false`
    #[serde(default)]
    pub backoff_transient: bool,

    /// First backoff delay; later ones double up to `max_retry_delay_ms`
    ///
    /// Default: 1000ms
    #[serde(default = "defaults::base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Default: 60000ms
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Randomness applied to every backoff delay (0.0 to 1.0)
    ///
    /// Default: 0.2 (±20%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,

    #[serde(default = "defaults::on_auth_expired")]
    pub on_auth_expired: AuthRemedy,

    #[serde(default = "defaults::on_auth_ambiguous")]
    pub on_auth_ambiguous: AuthRemedy,

    #[serde(default = "defaults::on_permission_required")]
    pub on_permission_required: AuthRemedy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            backoff_transient: false,
            base_retry_delay_ms: defaults::base_retry_delay_ms(),
            max_retry_delay_ms: defaults::max_retry_delay_ms(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
            on_auth_expired: defaults::on_auth_expired(),
            on_auth_ambiguous: defaults::on_auth_ambiguous(),
            on_permission_required: defaults::on_permission_required(),
        }
    }
}

/// Bounded retries, keyed by message and channel
///
/// Every classification counts as one failure. Once a message has failed more
/// than `max_retries` times on a channel the policy answers
/// [`RecoveryDecision::Exhausted`] whatever the error.
#[derive(Debug, Default)]
pub struct StandardRecoveryPolicy {
    config: RecoveryConfig,
    failures: DashMap<(MessageId, ChannelName), u32>,
}

impl StandardRecoveryPolicy {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn record_failure(&self, message: MessageId, channel: &ChannelName) -> u32 {
        let mut count = self.failures.entry((message, channel.clone())).or_insert(0);
        *count += 1;
        *count
    }

    fn backoff(&self, attempt: u32) -> RecoveryDecision {
        RecoveryDecision::RetryWithBackoff {
            attempt,
            delay: retry_delay(
                attempt,
                self.config.base_retry_delay_ms,
                self.config.max_retry_delay_ms,
                self.config.retry_jitter_factor,
            ),
        }
    }

    fn remedy(
        remedy: AuthRemedy,
        message: &Message,
        channel: &ChannelName,
        error: &DeliveryError,
    ) -> RecoveryDecision {
        remedy.interaction().map_or(RecoveryDecision::Exhausted, |kind| {
            RecoveryDecision::RetryAfterInteraction(InteractionRequest::new(
                kind,
                channel.clone(),
                message.id,
                error.to_string(),
            ))
        })
    }
}

impl RecoveryPolicy for StandardRecoveryPolicy {
    fn classify(
        &self,
        message: &Message,
        channel: &ChannelName,
        error: &DeliveryError,
    ) -> RecoveryDecision {
        let attempt = self.record_failure(message.id, channel);
        if attempt > self.config.max_retries {
            return RecoveryDecision::Exhausted;
        }

        match error.kind() {
            ErrorKind::Transient if self.config.backoff_transient => self.backoff(attempt),
            ErrorKind::Transient => RecoveryDecision::RetryNow,
            ErrorKind::ResourceUnavailable => self.backoff(attempt),
            ErrorKind::AuthExpired => {
                Self::remedy(self.config.on_auth_expired, message, channel, error)
            }
            ErrorKind::AuthAmbiguous => {
                Self::remedy(self.config.on_auth_ambiguous, message, channel, error)
            }
            ErrorKind::PermissionRequired => {
                Self::remedy(self.config.on_permission_required, message, channel, error)
            }
            ErrorKind::AuthDenied
            | ErrorKind::PermanentRejection
            | ErrorKind::Cancelled
            | ErrorKind::System => RecoveryDecision::Exhausted,
        }
    }

    fn forget(&self, message: &MessageId) {
        self.failures.retain(|(id, _), _| id != message);
    }

    fn failures(&self, message: &MessageId, channel: &ChannelName) -> u32 {
        self.failures
            .get(&(*message, channel.clone()))
            .map_or(0, |count| *count)
    }
}
