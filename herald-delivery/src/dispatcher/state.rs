use std::sync::Arc;

use ahash::AHashMap;
use herald_common::MessageId;

use crate::{
    attempt::AttemptHandle,
    channel::Channel,
    interaction::{InteractionId, InteractionRequest},
    types::AttemptId,
};

/// What the dispatcher is doing with an in-flight message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Held by `send` while the message is persisted as `Sending`. A cancel
    /// accepted here is settled by `send` once the write has landed.
    Reserving,
    /// Waiting in the worker's queue.
    Queued,
    /// Being run by the worker.
    Running,
    /// Waiting for a backoff timer.
    BackingOff,
    /// Parked until the host answers the interaction.
    AwaitingInteraction(InteractionId),
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) attempt_id: AttemptId,
    pub(crate) channel: Arc<Channel>,
    pub(crate) handle: AttemptHandle,
    pub(crate) phase: Phase,
}

impl InFlight {
    fn with_phase(message_id: MessageId, channel: Arc<Channel>, phase: Phase) -> Self {
        let attempt_id = AttemptId::generate();
        Self {
            attempt_id,
            channel,
            handle: AttemptHandle::new(attempt_id, message_id),
            phase,
        }
    }

    /// A new entry, reserved until `send` has persisted the message.
    pub(crate) fn reserve(message_id: MessageId, channel: Arc<Channel>) -> Self {
        Self::with_phase(message_id, channel, Phase::Reserving)
    }

    /// Hand the message to `channel` under a fresh attempt identity.
    pub(crate) fn reassign(&mut self, message_id: MessageId, channel: Arc<Channel>) -> AttemptId {
        *self = Self::with_phase(message_id, channel, Phase::Queued);
        self.attempt_id
    }
}

#[derive(Debug)]
pub(crate) struct PendingInteraction {
    pub(crate) attempt_id: AttemptId,
    pub(crate) request: InteractionRequest,
}

/// In-flight attempts and parked interactions, guarded by one lock
///
/// At most one entry exists per message. Every entry is tagged with the
/// attempt identity it was created for, so work scheduled for an attempt that
/// has since been replaced or finished is recognised as stale.
#[derive(Debug, Default)]
pub(crate) struct DispatchState {
    pub(crate) in_flight: AHashMap<MessageId, InFlight>,
    pub(crate) pending: AHashMap<InteractionId, PendingInteraction>,
}

impl DispatchState {
    pub(crate) fn entry(&self, message_id: &MessageId, attempt_id: AttemptId) -> Option<&InFlight> {
        self.in_flight
            .get(message_id)
            .filter(|entry| entry.attempt_id == attempt_id)
    }

    pub(crate) fn entry_mut(
        &mut self,
        message_id: &MessageId,
        attempt_id: AttemptId,
    ) -> Option<&mut InFlight> {
        self.in_flight
            .get_mut(message_id)
            .filter(|entry| entry.attempt_id == attempt_id)
    }

    /// Remove the entry for `attempt_id`, together with any interaction the
    /// message was parked on.
    ///
    /// Returns `None` if the entry is gone or belongs to another attempt;
    /// otherwise the withdrawn interaction ids.
    pub(crate) fn release(
        &mut self,
        message_id: &MessageId,
        attempt_id: AttemptId,
    ) -> Option<Vec<InteractionId>> {
        self.entry(message_id, attempt_id)?;
        self.in_flight.remove(message_id);

        let withdrawn: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.request.message_id == *message_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &withdrawn {
            self.pending.remove(id);
        }

        Some(withdrawn)
    }
}
