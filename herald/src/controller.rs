use std::sync::{Arc, LazyLock};

use ahash::AHashMap;
use herald_common::{Capability, Message, Recipient, Recording, Signal, internal, logging};
use herald_delivery::{
    ChannelBridge, ChannelConfig, ChannelName, ChannelRegistry, Dispatcher, DispatcherConfig,
    Transport,
};
use herald_store::StoreConfig;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    bridge::{self, AutoAnswer},
    loopback::{LoopbackConfig, LoopbackTransport},
};

/// A message to send as soon as the engine is up
#[derive(Debug, Clone, Deserialize)]
pub struct Outgoing {
    pub recipient: Recipient,
    pub recording: Recording,
}

#[derive(Debug, Default, Deserialize)]
pub struct Herald {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    dispatcher: DispatcherConfig,
    #[serde(alias = "channel", default)]
    channels: Vec<ChannelConfig>,
    /// Which channel chain serves each recipient capability
    #[serde(default)]
    routes: AHashMap<Capability, ChannelName>,
    #[serde(default)]
    loopback: LoopbackConfig,
    #[serde(default)]
    interactions: AutoAnswer,
    #[serde(default)]
    outgoing: Vec<Outgoing>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// A started engine
#[derive(Debug)]
pub struct Running {
    dispatcher: Dispatcher,
    worker: JoinHandle<Result<(), herald_delivery::DeliveryError>>,
    answerer: JoinHandle<()>,
}

impl Running {
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Wait for the worker to finish winding down.
    ///
    /// # Errors
    /// If the worker failed or panicked.
    pub async fn wait(self) -> anyhow::Result<()> {
        let result = self.worker.await;
        self.answerer.abort();
        result??;
        Ok(())
    }
}

impl Herald {
    /// Wire the engine together and start serving.
    ///
    /// Messages interrupted by an earlier run are resumed and the configured
    /// outgoing messages are sent. The worker stops when `shutdown` delivers
    /// a signal.
    ///
    /// # Errors
    /// If the store cannot be opened, the channel configuration is
    /// inconsistent, or a channel fails to initialise.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn start(self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<Running> {
        let store = self.store.into_store()?;

        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(self.loopback));
        let transports: AHashMap<_, _> = self
            .channels
            .iter()
            .map(|channel| (channel.name.clone(), Arc::clone(&transport)))
            .collect();

        let registry = ChannelRegistry::builder()
            .channels(self.channels, &transports)
            .routes(self.routes)
            .build()?;
        registry.init_all().await?;

        let (bridge, requests) = ChannelBridge::new();
        let dispatcher = Dispatcher::new(self.dispatcher, registry, store, Arc::new(bridge));
        let answerer = bridge::spawn(dispatcher.clone(), requests, self.interactions);

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.serve(shutdown).await })
        };

        dispatcher.resume_pending().await?;

        for outgoing in self.outgoing {
            let message = Message::new(outgoing.recipient, outgoing.recording);
            let id = message.id;
            match dispatcher.send(message).await {
                Ok(status) => info!(message_id = %id, ?status, "Message submitted"),
                Err(error) => warn!(message_id = %id, "Message not submitted: {error}"),
            }
        }

        internal!("Controller running");

        Ok(Running {
            dispatcher,
            worker,
            answerer,
        })
    }

    /// Run until a termination signal arrives.
    ///
    /// # Errors
    /// If the engine fails to start or stops with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let running = self.start(SHUTDOWN_BROADCAST.subscribe()).await?;
        shutdown().await?;

        internal!("Shutting down...");
        running.wait().await
    }
}
