//! Delivery notifications.
//!
//! Every event is handed to the registered [`DeliveryListener`]s in
//! registration order and then published on a broadcast channel for
//! subscribers that prefer a stream. Events are never emitted while the
//! dispatcher holds its state lock.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use herald_common::MessageId;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{
    error::DeliveryError,
    interaction::InteractionRequest,
    types::{AttemptId, ChannelName, Progress},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// An attempt began running on `channel`. Emitted once per try,
    /// including retries.
    Started {
        message_id: MessageId,
        attempt_id: AttemptId,
        channel: ChannelName,
    },
    Progress {
        message_id: MessageId,
        attempt_id: AttemptId,
        progress: Progress,
    },
    /// The attempt passed its point of no return and can no longer be
    /// cancelled.
    BecameNonCancellable {
        message_id: MessageId,
        attempt_id: AttemptId,
    },
    /// Delivery is parked until the host answers `request`.
    AwaitingInteraction {
        message_id: MessageId,
        request: InteractionRequest,
    },
    Cancelled {
        message_id: MessageId,
    },
    Finished {
        message_id: MessageId,
        channel: ChannelName,
    },
    /// Every applicable channel gave up; the message waits for a manual
    /// re-send.
    QueuedForManualRetry {
        message_id: MessageId,
        error: Arc<DeliveryError>,
    },
}

impl DeliveryEvent {
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        match self {
            Self::Started { message_id, .. }
            | Self::Progress { message_id, .. }
            | Self::BecameNonCancellable { message_id, .. }
            | Self::AwaitingInteraction { message_id, .. }
            | Self::Cancelled { message_id }
            | Self::Finished { message_id, .. }
            | Self::QueuedForManualRetry { message_id, .. } => *message_id,
        }
    }

    /// Whether this event ends the delivery of its message
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Finished { .. } | Self::QueuedForManualRetry { .. }
        )
    }
}

pub trait DeliveryListener: Send + Sync {
    fn on_event(&self, event: &DeliveryEvent);
}

impl<F> DeliveryListener for F
where
    F: Fn(&DeliveryEvent) + Send + Sync,
{
    fn on_event(&self, event: &DeliveryEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DeliveryListener>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<DeliveryEvent>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.inner.listeners.read().len())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::default(),
                next_id: AtomicU64::new(0),
                sender,
            }),
        }
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&self, listener: Arc<dyn DeliveryListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    /// Returns `false` if no listener was registered under `id`.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// A stream of every event emitted from now on. Slow subscribers lag
    /// rather than block delivery.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.sender.subscribe()
    }

    pub fn emit(&self, event: DeliveryEvent) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener.on_event(&event);
        }

        // No subscribers is not an error
        let _ = self.inner.sender.send(event);
    }
}
