use std::{sync::Arc, time::Duration};

use herald_common::{LifecycleState, Message, MessageId, internal};
use tracing::{debug, error, info, warn};

use super::{
    Dispatcher, Job,
    state::{Phase, PendingInteraction},
};
use crate::{
    attempt::AttemptHandle,
    channel::{Channel, ChannelRegistry},
    error::{AuthError, DeliveryError},
    events::DeliveryEvent,
    interaction::{InteractionId, InteractionOutcome, InteractionRequest},
    recovery::RecoveryDecision,
    types::{AttemptId, Outcome},
};

/// Result of trying to move an entry out of `Running`
enum Parked {
    Parked,
    Cancelled,
    Gone,
}

enum Answer {
    Retry(InteractionRequest, AttemptId),
    Denied(InteractionRequest, AttemptId),
    Cancelled,
}

impl Dispatcher {
    /// Route a finished run to its next step.
    pub(crate) async fn complete(
        &self,
        channel: Arc<Channel>,
        handle: AttemptHandle,
        message: Message,
        outcome: Outcome,
    ) {
        let message_id = message.id;
        let attempt_id = handle.id();

        match outcome {
            Outcome::Succeeded => self.delivered(&channel, attempt_id, message).await,
            Outcome::Cancelled => self.finalize_cancelled(message_id, attempt_id).await,
            Outcome::Failed(error) => {
                if error.is_cancelled() || (handle.is_cancel_requested() && !handle.is_irrevocable()) {
                    self.finalize_cancelled(message_id, attempt_id).await;
                    return;
                }

                let decision = channel
                    .recovery_policy()
                    .classify(&message, channel.name(), &error);
                debug!(%message_id, channel = %channel.name(), ?decision, "Classified failure");

                match decision {
                    RecoveryDecision::RetryNow => self.retry(message_id, attempt_id).await,
                    RecoveryDecision::RetryWithBackoff { attempt, delay } => {
                        self.back_off(message_id, &handle, attempt, delay).await;
                    }
                    RecoveryDecision::RetryAfterInteraction(request) => {
                        self.await_interaction(attempt_id, request).await;
                    }
                    RecoveryDecision::Exhausted => {
                        self.advance(&channel, &handle, message, error).await;
                    }
                }
            }
        }
    }

    /// Answer an interaction the engine asked for.
    ///
    /// On approval the attempt is queued again; on denial the message moves
    /// to its channel's fallback, or to manual retry if there is none.
    /// Returns `false` if `interaction` is unknown, already answered, or
    /// withdrawn.
    pub fn on_interaction_result(&self, interaction: InteractionId, outcome: InteractionOutcome) -> bool {
        let answered = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let Some(PendingInteraction {
                attempt_id,
                request,
            }) = state.pending.remove(&interaction)
            else {
                debug!(%interaction, "Ignoring result for unknown interaction");
                return false;
            };

            let Some(entry) = state
                .in_flight
                .get_mut(&request.message_id)
                .filter(|entry| entry.attempt_id == attempt_id)
            else {
                return false;
            };

            match outcome {
                InteractionOutcome::Approved if entry.handle.rearm() => {
                    entry.phase = Phase::Queued;
                    Answer::Retry(request, attempt_id)
                }
                // A cancel request already handed the entry to the cancel pool
                InteractionOutcome::Approved => Answer::Cancelled,
                InteractionOutcome::Denied => Answer::Denied(request, attempt_id),
            }
        };

        match answered {
            Answer::Retry(request, attempt_id) => {
                info!(message_id = %request.message_id, kind = %request.kind, "Interaction approved, retrying");
                self.enqueue(request.message_id, attempt_id);
            }
            Answer::Denied(request, attempt_id) => {
                info!(message_id = %request.message_id, kind = %request.kind, "Interaction denied");
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.denied(request, attempt_id).await });
            }
            Answer::Cancelled => {}
        }

        true
    }

    async fn denied(&self, request: InteractionRequest, attempt_id: AttemptId) {
        let message_id = request.message_id;
        let current = self
            .shared
            .state
            .lock()
            .entry(&message_id, attempt_id)
            .map(|entry| (Arc::clone(&entry.channel), entry.handle.clone()));
        let Some((channel, handle)) = current else {
            return;
        };

        let message = match self.shared.store.read(&message_id).await {
            Ok(message) => message,
            Err(error) => {
                error!(%message_id, "Could not load message after denied interaction: {error}");
                self.abandon_unreadable(
                    Job {
                        message_id,
                        attempt_id,
                    },
                    error.into(),
                );
                return;
            }
        };

        self.advance(&channel, &handle, message, AuthError::Denied(request.kind).into())
            .await;
    }

    /// Take the entry out of `Running` into `phase`, or report that it was
    /// cancelled meanwhile.
    fn park(&self, message_id: &MessageId, attempt_id: AttemptId, phase: Phase) -> Parked {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entry_mut(message_id, attempt_id) else {
            return Parked::Gone;
        };
        if entry.handle.is_cancel_requested() {
            return Parked::Cancelled;
        }
        entry.phase = phase;
        Parked::Parked
    }

    async fn retry(&self, message_id: MessageId, attempt_id: AttemptId) {
        let requeued = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entry_mut(&message_id, attempt_id) else {
                return;
            };
            let rearmed = entry.handle.rearm();
            if rearmed {
                entry.phase = Phase::Queued;
            }
            rearmed
        };

        if requeued {
            debug!(%message_id, "Retrying");
            self.enqueue(message_id, attempt_id);
        } else {
            self.finalize_cancelled(message_id, attempt_id).await;
        }
    }

    async fn back_off(&self, message_id: MessageId, handle: &AttemptHandle, attempt: u32, delay: Duration) {
        let attempt_id = handle.id();
        match self.park(&message_id, attempt_id, Phase::BackingOff) {
            Parked::Parked => {}
            Parked::Cancelled => {
                self.finalize_cancelled(message_id, attempt_id).await;
                return;
            }
            Parked::Gone => return,
        }

        internal!(
            level = INFO,
            "Retrying message {message_id} in {:.1}s (retry {attempt})",
            delay.as_secs_f64()
        );

        let dispatcher = self.clone();
        let handle = handle.clone();
        let stopping = self.shared.stopping.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let due = dispatcher
                        .shared
                        .state
                        .lock()
                        .entry(&message_id, attempt_id)
                        .is_some_and(|entry| entry.phase == Phase::BackingOff);
                    if due {
                        dispatcher.retry(message_id, attempt_id).await;
                    }
                }
                // The cancel pool settles the entry
                () = handle.cancelled() => {}
                () = stopping.cancelled() => {}
            }
        });
    }

    async fn await_interaction(&self, attempt_id: AttemptId, request: InteractionRequest) {
        let message_id = request.message_id;
        let parked = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            match state
                .in_flight
                .get_mut(&message_id)
                .filter(|entry| entry.attempt_id == attempt_id)
            {
                None => Parked::Gone,
                Some(entry) if entry.handle.is_cancel_requested() => Parked::Cancelled,
                Some(entry) => {
                    entry.phase = Phase::AwaitingInteraction(request.id);
                    state.pending.insert(
                        request.id,
                        PendingInteraction {
                            attempt_id,
                            request: request.clone(),
                        },
                    );
                    Parked::Parked
                }
            }
        };

        match parked {
            Parked::Parked => {}
            Parked::Cancelled => {
                self.finalize_cancelled(message_id, attempt_id).await;
                return;
            }
            Parked::Gone => return,
        }

        internal!(
            level = INFO,
            "Message {message_id} is waiting for the user to {} on {}",
            request.kind,
            request.channel
        );

        self.shared
            .events
            .emit(DeliveryEvent::AwaitingInteraction {
                message_id,
                request: request.clone(),
            });
        self.shared.bridge.request(&request);
    }

    /// The channel gave up: move to the next enabled fallback, or to manual
    /// retry if there is none or the remote side may already hold the
    /// message.
    async fn advance(
        &self,
        channel: &Arc<Channel>,
        handle: &AttemptHandle,
        message: Message,
        error: DeliveryError,
    ) {
        let message_id = message.id;
        let attempt_id = handle.id();

        if handle.is_cancel_requested() && !handle.is_irrevocable() {
            self.finalize_cancelled(message_id, attempt_id).await;
            return;
        }

        let next = if handle.is_irrevocable() {
            None
        } else {
            ChannelRegistry::next_enabled(channel.fallback())
        };

        let Some(next) = next else {
            self.give_up(attempt_id, message, error).await;
            return;
        };

        let moved = {
            let mut state = self.shared.state.lock();
            match state.entry_mut(&message_id, attempt_id) {
                None => return,
                Some(entry) if entry.handle.is_cancel_requested() => None,
                Some(entry) => Some(entry.reassign(message_id, Arc::clone(&next))),
            }
        };

        match moved {
            Some(new_attempt) => {
                info!(
                    %message_id,
                    from = %channel.name(),
                    to = %next.name(),
                    "Falling back after: {error}"
                );
                self.enqueue(message_id, new_attempt);
            }
            None => self.finalize_cancelled(message_id, attempt_id).await,
        }
    }

    async fn give_up(&self, attempt_id: AttemptId, mut message: Message, error: DeliveryError) {
        let message_id = message.id;
        if self.shared.state.lock().entry(&message_id, attempt_id).is_none() {
            return;
        }

        message.last_error = Some(error.to_string());

        match message.advance(LifecycleState::QueuedForManualRetry) {
            Ok(()) => {
                if let Err(store_error) = self.shared.store.update(&message).await {
                    error!(%message_id, "Could not persist manual retry state: {store_error}");
                }
            }
            Err(lifecycle) => warn!(%message_id, "{lifecycle}"),
        }

        self.release(message_id, attempt_id);

        warn!(%message_id, "Delivery abandoned, queued for manual retry: {error}");
        self.shared
            .events
            .emit(DeliveryEvent::QueuedForManualRetry {
                message_id,
                error: Arc::new(error),
            });
    }

    async fn delivered(&self, channel: &Channel, attempt_id: AttemptId, mut message: Message) {
        let message_id = message.id;

        match message.advance(LifecycleState::Sent) {
            Ok(()) => {
                if let Err(error) = self.shared.store.update(&message).await {
                    error!(%message_id, "Message delivered but its state could not be persisted: {error}");
                }
            }
            Err(lifecycle) => warn!(%message_id, "{lifecycle}"),
        }

        self.release(message_id, attempt_id);

        internal!(level = INFO, "Message {message_id} delivered via {}", channel.name());
        self.shared.events.emit(DeliveryEvent::Finished {
            message_id,
            channel: channel.name().clone(),
        });
    }

    /// The message could not be read back from the store, so nothing about it
    /// can be persisted either. Drop it from flight and report it.
    pub(crate) fn abandon_unreadable(&self, job: Job, error: DeliveryError) {
        if !self.release(job.message_id, job.attempt_id) {
            return;
        }

        self.shared
            .events
            .emit(DeliveryEvent::QueuedForManualRetry {
                message_id: job.message_id,
                error: Arc::new(error),
            });
    }

    /// Drop the entry and its interactions. Returns `false` if the attempt
    /// no longer owned the entry.
    fn release(&self, message_id: MessageId, attempt_id: AttemptId) -> bool {
        let released = self.shared.state.lock().release(&message_id, attempt_id);
        let Some(withdrawn) = released else {
            return false;
        };

        for interaction in &withdrawn {
            self.shared.bridge.withdraw(interaction);
        }
        self.shared.registry.forget(&message_id);
        true
    }
}
