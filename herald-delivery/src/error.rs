//! Typed error handling for delivery operations.
//!
//! Errors are grouped by how the engine reacts to them:
//! - Transient failures are retried on the same channel
//! - Authorization failures suspend delivery until an interaction completes
//! - Rejections move the message to the next channel in the chain
//! - Unavailable resources are retried after a backoff
//! - System errors fail fast

use herald_common::{Capability, LifecycleError};
use herald_store::StoreError;
use thiserror::Error;

use crate::{interaction::InteractionKind, types::ChannelName};

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    #[error("Authorization failure: {0}")]
    Auth(#[from] AuthError),

    /// The remote side refused the message; retrying the same channel is
    /// pointless.
    #[error("Rejected: {0}")]
    Rejected(#[from] RejectionError),

    #[error("Resource unavailable: {0}")]
    Unavailable(#[from] UnavailableError),

    /// The attempt was cancelled by the user.
    #[error("Delivery cancelled")]
    Cancelled,

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Conditions expected to clear up on their own.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The store failed in a way that may succeed on a later try.
    #[error("Store unavailable: {0}")]
    Store(StoreError),
}

/// Credential and permission problems that a person can resolve.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credentials expired: {0}")]
    Expired(String),

    /// More than one account could be used and none is selected.
    #[error("Ambiguous account: {0}")]
    Ambiguous(String),

    #[error("Permission required: {0}")]
    PermissionRequired(String),

    /// The user declined the interaction that would have resolved the
    /// problem.
    #[error("User declined to {0}")]
    Denied(InteractionKind),
}

#[derive(Debug, Error)]
pub enum RejectionError {
    #[error("Recipient unreachable: {0}")]
    RecipientUnreachable(String),

    #[error("Refused: {0}")]
    Refused(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
}

#[derive(Debug, Error)]
pub enum UnavailableError {
    #[error("No network: {0}")]
    NoNetwork(String),

    #[error("Recording missing: {0}")]
    RecordingMissing(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Errors that indicate a problem with the engine or its configuration.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("No channel accepts capability {0}")]
    NoMatchingChannel(Capability),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// `serve` was called while another worker is already running.
    #[error("Dispatcher is already serving")]
    AlreadyServing,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Problems found while wiring channels together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Channel {0} is defined more than once")]
    DuplicateChannel(ChannelName),

    #[error("Channel {referenced_by} refers to unknown channel {name}")]
    UnknownChannel {
        referenced_by: String,
        name: ChannelName,
    },

    #[error("Channel {channel} refers to unknown recovery policy {policy}")]
    UnknownPolicy { channel: ChannelName, policy: String },

    #[error("Fallback chain starting at {0} loops back on itself")]
    FallbackCycle(ChannelName),

    #[error("Channel {0} has no delivery steps")]
    EmptyPlan(ChannelName),

    #[error("Channel {0} has no transport")]
    MissingTransport(ChannelName),
}

/// How the engine reacts to an error, independent of where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    AuthExpired,
    AuthAmbiguous,
    PermissionRequired,
    AuthDenied,
    PermanentRejection,
    ResourceUnavailable,
    Cancelled,
    System,
}

impl DeliveryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Auth(AuthError::Expired(_)) => ErrorKind::AuthExpired,
            Self::Auth(AuthError::Ambiguous(_)) => ErrorKind::AuthAmbiguous,
            Self::Auth(AuthError::PermissionRequired(_)) => ErrorKind::PermissionRequired,
            Self::Auth(AuthError::Denied(_)) => ErrorKind::AuthDenied,
            Self::Rejected(_) => ErrorKind::PermanentRejection,
            Self::Unavailable(_) => ErrorKind::ResourceUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::System(_) => ErrorKind::System,
        }
    }

    /// Returns `true` if the same channel may succeed on an immediate retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if an external interaction could resolve this error.
    #[must_use]
    pub const fn needs_interaction(&self) -> bool {
        matches!(
            self,
            Self::Auth(
                AuthError::Expired(_) | AuthError::Ambiguous(_) | AuthError::PermissionRequired(_)
            )
        )
    }

    /// Returns `true` if retrying on the same channel cannot help.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Auth(AuthError::Denied(_)))
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            Self::Transient(TransientError::Store(error))
        } else {
            Self::System(SystemError::Store(error))
        }
    }
}

impl From<LifecycleError> for DeliveryError {
    fn from(error: LifecycleError) -> Self {
        Self::System(SystemError::Lifecycle(error))
    }
}

impl From<RegistryError> for DeliveryError {
    fn from(error: RegistryError) -> Self {
        Self::System(SystemError::Registry(error))
    }
}
