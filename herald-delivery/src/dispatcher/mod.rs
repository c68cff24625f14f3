//! The delivery engine's front door
//!
//! The [`Dispatcher`] owns the in-flight table and a single worker that runs
//! attempts one at a time. Everything that reaches an attempt from outside
//! (cancel requests, interaction answers, backoff timers) goes through the
//! table, so a message can never have two attempts running at once.
//!
//! ## Lifecycle
//!
//! 1. [`Dispatcher::send`] resolves a channel, persists the message as
//!    `Sending` and queues it for the worker.
//! 2. [`Dispatcher::serve`] runs queued attempts and routes their outcome:
//!    success, retry, backoff, interaction, fallback, or manual retry.
//! 3. [`Dispatcher::cancel`] stops anything that has not reached its
//!    irrevocable step.

mod cancel;
mod resume;
mod routing;
mod state;
mod worker;

use std::{sync::Arc, time::Duration};

use herald_common::{LifecycleState, Message, MessageId, internal};
use herald_store::{MessageStore, StoreError};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::{
    cancel::CancelPool,
    state::{DispatchState, InFlight, Phase},
};
use crate::{
    channel::ChannelRegistry,
    error::{DeliveryError, SystemError},
    events::{DeliveryEvent, DeliveryListener, EventHub, ListenerId},
    interaction::{InteractionBridge, InteractionId, InteractionRequest},
    types::{AttemptId, SendStatus},
};

mod defaults {
    pub const fn attempt_timeout_secs() -> u64 {
        300
    }

    pub const fn cancel_workers() -> usize {
        2
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

/// Dispatcher tuning
///
/// # Example
///
/// ```ron
/// dispatcher: (
///     attempt_timeout_secs: 300,
///     cancel_workers: 2,
///     shutdown_timeout_secs: 30,
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on a single attempt's run
    #[serde(default = "defaults::attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// How many cancellations may be finalised concurrently
    #[serde(default = "defaults::cancel_workers")]
    pub cancel_workers: usize,

    /// How long shutdown waits for pending cancellations
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: defaults::attempt_timeout_secs(),
            cancel_workers: defaults::cancel_workers(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// A unit of work for the worker: run the attempt `attempt_id` of a message
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub(crate) message_id: MessageId,
    pub(crate) attempt_id: AttemptId,
}

#[derive(Debug)]
struct Shared {
    config: DispatcherConfig,
    registry: ChannelRegistry,
    store: Arc<dyn MessageStore>,
    bridge: Arc<dyn InteractionBridge>,
    events: EventHub,
    state: Mutex<DispatchState>,
    jobs: mpsc::UnboundedSender<Job>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    cancel_pool: CancelPool,
    stopping: CancellationToken,
}

/// Schedules, runs and routes delivery attempts
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        registry: ChannelRegistry,
        store: Arc<dyn MessageStore>,
        bridge: Arc<dyn InteractionBridge>,
    ) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let cancel_pool = CancelPool::new(config.cancel_workers);

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                store,
                bridge,
                events: EventHub::new(),
                state: Mutex::new(DispatchState::default()),
                jobs,
                receiver: Mutex::new(Some(receiver)),
                cancel_pool,
                stopping: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.shared.store
    }

    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    pub fn register_listener(&self, listener: Arc<dyn DeliveryListener>) -> ListenerId {
        self.shared.events.register_listener(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.events.unregister_listener(id)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.shared.events.subscribe()
    }

    /// Start delivering `message`.
    ///
    /// The message is written to the store if it is new, moved to `Sending`
    /// and queued for the worker. At most one attempt per message is ever in
    /// flight; a second call while the first is running is a no-op.
    ///
    /// # Errors
    /// [`SystemError::NoMatchingChannel`] if no enabled channel accepts the
    /// recipient's capability, or a store or lifecycle error if the message
    /// could not be persisted. Nothing is left in flight on error.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(message_id = %message.id))]
    pub async fn send(&self, message: Message) -> Result<SendStatus, DeliveryError> {
        let id = message.id;
        let Some(channel) = self.shared.registry.resolve(&message.recipient.capability) else {
            return Err(SystemError::NoMatchingChannel(message.recipient.capability.clone()).into());
        };

        let (attempt_id, handle) = {
            let mut state = self.shared.state.lock();
            if state.in_flight.contains_key(&id) {
                debug!("Message already in flight");
                return Ok(SendStatus::AlreadyInFlight);
            }

            let entry = InFlight::reserve(id, Arc::clone(&channel));
            let reserved = (entry.attempt_id, entry.handle.clone());
            state.in_flight.insert(id, entry);
            reserved
        };

        let refused = match self.persist_sending(message).await {
            Ok(true) => None,
            Ok(false) => {
                debug!("Message already sent");
                Some(Ok(SendStatus::AlreadySent))
            }
            Err(error) => Some(Err(error)),
        };

        if let Some(result) = refused {
            self.shared.state.lock().release(&id, attempt_id);
            if handle.is_cancel_requested() {
                self.shared
                    .events
                    .emit(DeliveryEvent::Cancelled { message_id: id });
            }
            return result;
        }

        // A cancel accepted while reserving was left for us to settle now
        // that `Sending` is on disk.
        let cancelled = {
            let mut state = self.shared.state.lock();
            match state.entry_mut(&id, attempt_id) {
                Some(entry) if entry.handle.is_cancel_requested() => true,
                Some(entry) => {
                    entry.phase = Phase::Queued;
                    false
                }
                None => true,
            }
        };

        if cancelled {
            self.finalize_cancelled(id, attempt_id).await;
            return Ok(SendStatus::Scheduled);
        }

        info!(channel = %channel.name(), "Message scheduled");
        self.enqueue(id, attempt_id);
        Ok(SendStatus::Scheduled)
    }

    /// Request cancellation of `message`'s delivery.
    ///
    /// Returns `false` if nothing is in flight for the message, or its attempt
    /// is committing or has become irrevocable. On `true` the message ends up
    /// `NotSent` and a `Cancelled` event follows.
    pub fn cancel(&self, message: &MessageId) -> bool {
        let parked = {
            let state = self.shared.state.lock();
            let Some(entry) = state.in_flight.get(message) else {
                return false;
            };
            if !entry.handle.cancel() {
                debug!(message_id = %message, "Cancellation refused, attempt is past the point of no return");
                return false;
            }
            (!matches!(entry.phase, Phase::Running | Phase::Reserving)).then_some(entry.attempt_id)
        };

        internal!(level = INFO, "Cancellation of message {message} accepted");

        // A running attempt observes its token and is finalised by the
        // worker, a reserved one by `send`; anything parked is finalised here.
        if let Some(attempt_id) = parked {
            let dispatcher = self.clone();
            let message = *message;
            self.shared
                .cancel_pool
                .submit(async move { dispatcher.finalize_cancelled(message, attempt_id).await });
        }

        true
    }

    /// Request cancellation of every in-flight message. Returns how many
    /// requests were accepted.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<_> = self.shared.state.lock().in_flight.keys().copied().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    #[must_use]
    pub fn is_delivering(&self, message: &MessageId) -> bool {
        self.shared.state.lock().in_flight.contains_key(message)
    }

    /// Whether `message` is in flight and [`Dispatcher::cancel`] would
    /// currently be accepted
    #[must_use]
    pub fn is_delivering_and_cancellable(&self, message: &MessageId) -> bool {
        self.shared
            .state
            .lock()
            .in_flight
            .get(message)
            .is_some_and(|entry| entry.handle.is_cancellable())
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// Interactions the host has been asked for and not yet answered
    #[must_use]
    pub fn pending_interactions(&self) -> Vec<InteractionRequest> {
        let mut pending: Vec<_> = self
            .shared
            .state
            .lock()
            .pending
            .values()
            .map(|pending| pending.request.clone())
            .collect();
        pending.sort_by_key(|request| request.id);
        pending
    }

    #[must_use]
    pub fn is_awaiting(&self, interaction: &InteractionId) -> bool {
        self.shared.state.lock().pending.contains_key(interaction)
    }

    /// Write `message` if new and move it to `Sending`. Returns `false` if it
    /// was already sent.
    async fn persist_sending(&self, message: Message) -> Result<bool, DeliveryError> {
        let store = &self.shared.store;
        let mut stored = match store.read(&message.id).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound(_)) => {
                store.write(&message).await?;
                message
            }
            Err(error) => return Err(error.into()),
        };

        match stored.state() {
            LifecycleState::Sent => Ok(false),
            LifecycleState::Sending => Ok(true),
            _ => {
                stored.advance(LifecycleState::Sending)?;
                store.update(&stored).await?;
                Ok(true)
            }
        }
    }

    fn enqueue(&self, message_id: MessageId, attempt_id: AttemptId) {
        if self
            .shared
            .jobs
            .send(Job {
                message_id,
                attempt_id,
            })
            .is_err()
        {
            error!(%message_id, "Dispatcher worker has stopped, message stays queued until resumed");
        }
    }
}
