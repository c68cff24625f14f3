use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Identity of a delivery attempt
///
/// Stable across retries of the same send on the same channel; a fallback to
/// another channel gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(ulid::Ulid);

impl AttemptId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a configured channel, e.g. `CloudMail`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How far an attempt has come. Informational only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction of the step plan completed, between 0 and 1.
    Determinate(f32),
    Indeterminate,
}

impl Progress {
    #[must_use]
    pub fn fraction(value: f32) -> Self {
        Self::Determinate(value.clamp(0.0, 1.0))
    }
}

/// Terminal result of running a delivery attempt once
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Cancelled,
    Failed(DeliveryError),
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// What [`crate::Dispatcher::send`] did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Persisted as sending and queued for the worker.
    Scheduled,
    /// An attempt for this message is already in flight; nothing changed.
    AlreadyInFlight,
    /// The message was delivered before; nothing changed.
    AlreadySent,
}
