//! The message model shared by the store and the delivery engine.
//!
//! A [`Message`] is owned by the store. The delivery engine only touches the
//! delivery fields ([`Message::artifacts`], [`Message::confirmed_recipients`],
//! [`Message::last_error`] and [`Message::state`]) and writes every change
//! back immediately.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MessageId, Recipient};

/// A finished recording, the payload of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub path: PathBuf,
    pub transcript: Option<String>,
}

impl Recording {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transcript: None,
        }
    }

    #[must_use]
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }
}

/// Name of a cached delivery artifact, e.g. `uploaded_url`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Set-once cache of values produced by delivery steps
///
/// Once a key holds a value it is never overwritten or cleared, so a later
/// attempt (on the same channel or a fallback) can skip the step that
/// produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifacts(BTreeMap<ArtifactKey, String>);

impl Artifacts {
    /// Record `value` under `key`.
    ///
    /// Returns `false` without changing anything if the key is already set or
    /// the value is empty.
    pub fn set(&mut self, key: ArtifactKey, value: impl Into<String>) -> bool {
        let value = value.into();
        if value.is_empty() || self.0.contains_key(&key) {
            return false;
        }

        self.0.insert(key, value);
        true
    }

    #[must_use]
    pub fn get(&self, key: &ArtifactKey) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArtifactKey, &str)> {
        self.0.iter().map(|(k, v)| (k, v.as_str()))
    }
}

/// Where a message is in its delivery lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    NotSent,
    Sending,
    Sent,
    QueuedForManualRetry,
}

impl LifecycleState {
    /// Whether `self -> next` is a permitted transition
    ///
    /// `Sending -> NotSent` is only used when an attempt was cancelled before
    /// anything was committed remotely. `Sent` is terminal.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotSent | Self::QueuedForManualRetry, Self::Sending)
                | (
                    Self::Sending,
                    Self::Sent | Self::QueuedForManualRetry | Self::NotSent
                )
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotSent => "NotSent",
            Self::Sending => "Sending",
            Self::Sent => "Sent",
            Self::QueuedForManualRetry => "QueuedForManualRetry",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Message {id} cannot move from {from} to {to}")]
pub struct LifecycleError {
    pub id: MessageId,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub recipient: Recipient,
    pub recording: Recording,
    pub artifacts: Artifacts,
    pub confirmed_recipients: BTreeSet<String>,
    pub last_error: Option<String>,
    state: LifecycleState,
}

impl Message {
    /// Create a new, unsent message with a freshly generated ID
    #[must_use]
    pub fn new(recipient: Recipient, recording: Recording) -> Self {
        Self::with_id(MessageId::generate(), recipient, recording)
    }

    #[must_use]
    pub fn with_id(id: MessageId, recipient: Recipient, recording: Recording) -> Self {
        Self {
            id,
            recipient,
            recording,
            artifacts: Artifacts::default(),
            confirmed_recipients: BTreeSet::new(),
            last_error: None,
            state: LifecycleState::NotSent,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move the message to `next`.
    ///
    /// # Errors
    /// Returns a [`LifecycleError`] if the transition is not permitted; the
    /// message is left unchanged.
    pub fn advance(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }

        if next == LifecycleState::Sending {
            self.last_error = None;
        }

        self.state = next;
        Ok(())
    }

    /// Record that `recipient` acknowledged receipt. Returns `false` if it
    /// had already been recorded.
    pub fn confirm_recipient(&mut self, recipient: impl Into<String>) -> bool {
        self.confirmed_recipients.insert(recipient.into())
    }
}
