//! Delivery channels and the registry that wires them together

pub mod config;
pub mod registry;
pub mod step;
pub mod transport;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use herald_common::{Message, internal};
use tokio::sync::OnceCell;

pub use self::{
    config::{ChannelConfig, ChannelSettings},
    registry::{ChannelRegistry, ChannelRegistryBuilder},
    step::{StepDescriptor, StepKind, standard_plan},
    transport::{StepContext, StepOutput, Transport},
};
use crate::{
    attempt::{AttemptHandle, DeliveryAttempt},
    error::DeliveryError,
    recovery::RecoveryPolicy,
    types::ChannelName,
};

/// A delivery handler for one transport
///
/// Channels are created once by the [`ChannelRegistry`] and live until
/// shutdown. Each may point at a fallback channel that takes over when it
/// gives up on a message.
#[derive(Debug)]
pub struct Channel {
    name: ChannelName,
    enabled: AtomicBool,
    fallback: Option<Arc<Self>>,
    steps: Vec<StepDescriptor>,
    settings: ChannelSettings,
    policy: Arc<dyn RecoveryPolicy>,
    transport: Arc<dyn Transport>,
    initialised: OnceCell<()>,
}

impl Channel {
    pub(crate) fn new(
        config: ChannelConfig,
        fallback: Option<Arc<Self>>,
        policy: Arc<dyn RecoveryPolicy>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: config.name,
            enabled: AtomicBool::new(config.enabled),
            fallback,
            steps: config.steps,
            settings: config.settings,
            policy,
            transport,
            initialised: OnceCell::new(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &ChannelName {
        &self.name
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disabled channels are skipped when choosing where to deliver, but stay
    /// in their chain.
    pub fn set_enabled(&self, enabled: bool) {
        internal!(
            level = INFO,
            "Channel {} {}",
            self.name,
            if enabled { "enabled" } else { "disabled" }
        );
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub const fn fallback(&self) -> Option<&Arc<Self>> {
        self.fallback.as_ref()
    }

    #[must_use]
    pub fn recovery_policy(&self) -> &dyn RecoveryPolicy {
        self.policy.as_ref()
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    #[must_use]
    pub const fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Acquire the transport's channel-wide resources. Idempotent; concurrent
    /// callers wait for the first to finish.
    pub async fn init(&self) -> Result<(), DeliveryError> {
        self.initialised
            .get_or_try_init(|| async {
                internal!("Initialising channel {} ...", self.name);
                self.transport.init(&self.settings).await
            })
            .await
            .map(|_| ())
    }

    #[must_use]
    pub fn is_initialised(&self) -> bool {
        self.initialised.initialized()
    }

    /// Release the transport's resources if they were acquired.
    ///
    /// Cancels nothing; callers make sure no attempt is running first.
    pub async fn shutdown(&self) {
        if self.is_initialised() {
            internal!("Shutting down channel {} ...", self.name);
            self.transport.shutdown().await;
        }
    }

    /// Build an attempt delivering `message` over this channel. Does not
    /// start it.
    #[must_use]
    pub fn new_attempt(self: &Arc<Self>, message: Message, handle: AttemptHandle) -> DeliveryAttempt {
        DeliveryAttempt::new(Arc::clone(self), message, handle)
    }
}
