//! Out-of-band decisions that delivery has to wait for.
//!
//! When a channel needs the user to re-authorize, pick an account, or grant a
//! permission, the dispatcher parks the message and fires an
//! [`InteractionRequest`] through the host's [`InteractionBridge`]. The host
//! answers later, exactly once, through
//! [`crate::Dispatcher::on_interaction_result`].

use herald_common::MessageId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::ChannelName;

/// Correlates an interaction request with its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InteractionId(ulid::Ulid);

impl InteractionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl std::fmt::Display for InteractionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionKind {
    Reauthorize,
    ChooseAccount,
    GrantPermission,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Reauthorize => "reauthorize",
            Self::ChooseAccount => "choose an account",
            Self::GrantPermission => "grant permission",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRequest {
    pub id: InteractionId,
    pub kind: InteractionKind,
    pub channel: ChannelName,
    pub message_id: MessageId,
    /// Human-readable reason, usually the error that prompted the request.
    pub detail: String,
}

impl InteractionRequest {
    #[must_use]
    pub fn new(
        kind: InteractionKind,
        channel: ChannelName,
        message_id: MessageId,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: InteractionId::generate(),
            kind,
            channel,
            message_id,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionOutcome {
    Approved,
    Denied,
}

/// Host side of an interaction
///
/// `request` must not block: it only starts the interaction. A bridge that
/// never answers leaves the message parked until it is cancelled, at which
/// point `withdraw` is called so the host can dismiss whatever it showed.
pub trait InteractionBridge: Send + Sync + std::fmt::Debug {
    fn request(&self, request: &InteractionRequest);

    fn withdraw(&self, _id: &InteractionId) {}
}

/// Message sent by [`ChannelBridge`] to whoever handles interactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    Request(InteractionRequest),
    Withdraw(InteractionId),
}

/// Bridge that forwards requests to a task over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelBridge {
    sender: mpsc::UnboundedSender<BridgeMessage>,
}

impl ChannelBridge {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl InteractionBridge for ChannelBridge {
    fn request(&self, request: &InteractionRequest) {
        if self
            .sender
            .send(BridgeMessage::Request(request.clone()))
            .is_err()
        {
            tracing::warn!(
                interaction = %request.id,
                message_id = %request.message_id,
                "Interaction handler has gone away, request will not be answered"
            );
        }
    }

    fn withdraw(&self, id: &InteractionId) {
        let _ = self.sender.send(BridgeMessage::Withdraw(*id));
    }
}
