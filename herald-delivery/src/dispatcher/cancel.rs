use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use herald_common::{LifecycleState, MessageId, internal};
use tokio::sync::Semaphore;
use tracing::warn;

use super::Dispatcher;
use crate::{events::DeliveryEvent, types::AttemptId};

/// Bounded set of tasks finalising cancellations off the worker
///
/// Cancel requests return immediately; the store writes and notifications
/// they imply run here, at most `workers` at a time.
#[derive(Debug)]
pub(crate) struct CancelPool {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl CancelPool {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            // Only fails once the semaphore is closed, which it never is
            let _permit = permits.acquire_owned().await.ok();
            task.await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Tasks submitted and not yet finished
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Dispatcher {
    /// Settle a cancelled attempt: the message goes back to `NotSent`, its
    /// entry and interactions are dropped, and `Cancelled` is emitted.
    ///
    /// Safe to call more than once for the same attempt; only the call that
    /// removes the entry notifies.
    pub(crate) async fn finalize_cancelled(&self, message_id: MessageId, attempt_id: AttemptId) {
        if self.shared.state.lock().entry(&message_id, attempt_id).is_none() {
            return;
        }

        self.persist_not_sent(message_id).await;

        let released = self.shared.state.lock().release(&message_id, attempt_id);
        let Some(withdrawn) = released else {
            return;
        };

        for interaction in &withdrawn {
            self.shared.bridge.withdraw(interaction);
        }
        self.shared.registry.forget(&message_id);

        internal!(level = INFO, "Delivery of message {message_id} cancelled");
        self.shared
            .events
            .emit(DeliveryEvent::Cancelled { message_id });
    }

    async fn persist_not_sent(&self, message_id: MessageId) {
        let store = &self.shared.store;
        let mut message = match store.read(&message_id).await {
            Ok(message) => message,
            Err(error) => {
                warn!(%message_id, "Could not load cancelled message: {error}");
                return;
            }
        };

        if message.state() != LifecycleState::Sending {
            return;
        }

        if let Err(error) = message.advance(LifecycleState::NotSent) {
            warn!(%message_id, "{error}");
            return;
        }
        if let Err(error) = store.update(&message).await {
            warn!(%message_id, "Could not persist cancelled message: {error}");
        }
    }
}
