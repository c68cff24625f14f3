//! Scripted transports and harnesses for dispatcher tests
//!
//! A [`ScriptedTransport`] runs the standard step plan and fails individual
//! steps according to a per-step script. A [`Harness`] wires it into a
//! dispatcher with a test store, a recording bridge and an event log, and runs
//! the worker on a background task.
#![allow(dead_code)] // Not every test uses every helper
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use herald_common::{LifecycleState, Message, MessageId, Recipient, Recording, Signal};
use herald_delivery::{
    AuthError, ChannelRegistry, DeliveryError, DeliveryEvent, Dispatcher, DispatcherConfig,
    InteractionBridge, InteractionId, InteractionRequest, RejectionError, StepContext,
    StepDescriptor, StepKind, StepOutput, Transport, TransientError, UnavailableError,
};
use herald_store::{MessageStore, TestMessageStore};
use parking_lot::Mutex;
use tokio::{sync::{Notify, broadcast}, task::JoinHandle};

pub const WAIT: Duration = Duration::from_secs(5);

/// A failure a scripted step reports instead of succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Rejected,
    AuthExpired,
    Unavailable,
    /// Never completes; only cancellation or a timeout ends the step
    Hang,
}

impl Fault {
    fn error(self) -> DeliveryError {
        match self {
            Self::Transient => TransientError::ServerBusy("try again".into()).into(),
            Self::Rejected => RejectionError::Refused("rejected by remote".into()).into(),
            Self::AuthExpired => AuthError::Expired("session expired".into()).into(),
            Self::Unavailable => UnavailableError::NoNetwork("offline".into()).into(),
            Self::Hang => unreachable!("hanging steps do not return"),
        }
    }
}

/// Pauses a step until the test releases it
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub async fn entered(&self) {
        tokio::time::timeout(WAIT, self.entered.notified())
            .await
            .expect("step never reached the gate");
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

/// Transport whose steps succeed unless scripted otherwise
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    faults: Mutex<AHashMap<StepKind, VecDeque<Fault>>>,
    gates: Mutex<AHashMap<StepKind, Arc<Gate>>>,
    calls: Mutex<AHashMap<StepKind, usize>>,
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next runs of `kind`, one fault per run.
    pub fn fail(&self, kind: StepKind, faults: impl IntoIterator<Item = Fault>) {
        self.faults
            .lock()
            .entry(kind)
            .or_default()
            .extend(faults);
    }

    /// Make the next run of `kind` wait at a gate.
    pub fn gate(&self, kind: StepKind) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().insert(kind, Arc::clone(&gate));
        gate
    }

    pub fn calls(&self, kind: &StepKind) -> usize {
        self.calls.lock().get(kind).copied().unwrap_or_default()
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn init(&self, _settings: &herald_delivery::ChannelSettings) -> Result<(), DeliveryError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutput, DeliveryError> {
        *self.calls.lock().entry(step.kind.clone()).or_default() += 1;

        let gate = self.gates.lock().remove(&step.kind);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let fault = self
            .faults
            .lock()
            .get_mut(&step.kind)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(Fault::Hang) => std::future::pending().await,
            Some(fault) => return Err(fault.error()),
            None => {}
        }

        ctx.report_progress(1.0);

        let message = ctx.message();
        Ok(match step.kind {
            StepKind::Upload => StepOutput::artifact(format!("https://{}/upload/{}", ctx.channel(), message.id)),
            StepKind::Commit => StepOutput::artifact(format!("https://{}/m/{}", ctx.channel(), message.id)),
            StepKind::Confirm => StepOutput::confirmed([message.recipient.address.clone()]),
            _ => StepOutput::default(),
        })
    }
}

/// Bridge that remembers what it was asked
#[derive(Debug, Default)]
pub struct RecordingBridge {
    pub requests: Mutex<Vec<InteractionRequest>>,
    pub withdrawn: Mutex<Vec<InteractionId>>,
}

impl InteractionBridge for RecordingBridge {
    fn request(&self, request: &InteractionRequest) {
        self.requests.lock().push(request.clone());
    }

    fn withdraw(&self, id: &InteractionId) {
        self.withdrawn.lock().push(*id);
    }
}

/// Test store whose next update into a given state waits at a gate
#[derive(Debug)]
pub struct GatedStore {
    inner: TestMessageStore,
    held: Mutex<Option<(LifecycleState, Arc<Gate>)>>,
}

impl GatedStore {
    pub fn new(inner: TestMessageStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            held: Mutex::new(None),
        })
    }

    /// Make the next update that moves a message to `state` wait.
    pub fn gate_update(&self, state: LifecycleState) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.held.lock() = Some((state, Arc::clone(&gate)));
        gate
    }
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn write(&self, message: &Message) -> herald_store::Result<()> {
        self.inner.write(message).await
    }

    async fn list(&self) -> herald_store::Result<Vec<MessageId>> {
        self.inner.list().await
    }

    async fn read(&self, id: &MessageId) -> herald_store::Result<Message> {
        self.inner.read(id).await
    }

    async fn update(&self, message: &Message) -> herald_store::Result<()> {
        let gate = self
            .held
            .lock()
            .take_if(|(state, _)| *state == message.state())
            .map(|(_, gate)| gate);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.inner.update(message).await
    }

    async fn delete(&self, id: &MessageId) -> herald_store::Result<()> {
        self.inner.delete(id).await
    }
}

/// Every event the dispatcher emitted, in order
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<DeliveryEvent>>,
    notify: Notify,
}

impl EventLog {
    fn record(&self, event: &DeliveryEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }

    /// Wait for the first event matching `matches`, including ones already
    /// seen.
    pub async fn wait_for(&self, matches: impl Fn(&DeliveryEvent) -> bool) -> DeliveryEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(event) = self.events.lock().iter().find(|event| matches(event)) {
                    return event.clone();
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for event, saw {:#?}", self.events()))
    }
}

pub fn recipient(capability: &str) -> Recipient {
    Recipient::new("alice", "Alice", "alice@example.com", capability)
}

pub fn message(capability: &str) -> Message {
    Message::new(recipient(capability), Recording::new("/recordings/hello.m4a"))
}

/// A running dispatcher over a test store
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub store: TestMessageStore,
    pub bridge: Arc<RecordingBridge>,
    pub events: Arc<EventLog>,
    shutdown: broadcast::Sender<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(registry: ChannelRegistry) -> Self {
        Self::start_with(registry, TestMessageStore::new(), DispatcherConfig::default())
    }

    pub fn start_with(registry: ChannelRegistry, store: TestMessageStore, config: DispatcherConfig) -> Self {
        let backing = Arc::new(store.clone());
        Self::start_over(registry, store, backing, config)
    }

    /// Run the dispatcher over `backing`, which must persist into `store`.
    pub fn start_over(
        registry: ChannelRegistry,
        store: TestMessageStore,
        backing: Arc<dyn MessageStore>,
        config: DispatcherConfig,
    ) -> Self {
        let bridge = Arc::new(RecordingBridge::default());
        let dispatcher = Dispatcher::new(
            config,
            registry,
            backing,
            Arc::clone(&bridge) as Arc<dyn InteractionBridge>,
        );

        let events = Arc::new(EventLog::default());
        let log = Arc::clone(&events);
        dispatcher.register_listener(Arc::new(move |event: &DeliveryEvent| log.record(event)));

        let (shutdown, receiver) = broadcast::channel(4);
        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.serve(receiver).await.expect("dispatcher failed");
            })
        };

        Self {
            dispatcher,
            store,
            bridge,
            events,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Signal shutdown and wait for the worker to wind down.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        if let Some(worker) = self.worker.take() {
            tokio::time::timeout(WAIT, worker)
                .await
                .expect("worker did not stop")
                .expect("worker panicked");
        }
    }

    pub async fn finished(&self, message: &Message) -> DeliveryEvent {
        let id = message.id;
        self.events
            .wait_for(|event| event.message_id() == id && event.is_terminal())
            .await
    }

    pub async fn stored(&self, message: &Message) -> Message {
        self.store.read(&message.id).await.expect("message not stored")
    }
}
