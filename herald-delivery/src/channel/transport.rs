use async_trait::async_trait;
use herald_common::Message;

use super::{config::ChannelSettings, step::StepDescriptor};
use crate::{
    attempt::AttemptHandle,
    error::DeliveryError,
    events::{DeliveryEvent, EventHub},
    types::{AttemptId, ChannelName, Progress},
};

/// What a successful step produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Value for the step's artifact key, if it names one
    pub artifact: Option<String>,
    /// Recipients that acknowledged receipt
    pub confirmed: Vec<String>,
}

impl StepOutput {
    #[must_use]
    pub fn artifact(value: impl Into<String>) -> Self {
        Self {
            artifact: Some(value.into()),
            confirmed: Vec::new(),
        }
    }

    #[must_use]
    pub fn confirmed(recipients: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            artifact: None,
            confirmed: recipients.into_iter().map(Into::into).collect(),
        }
    }
}

/// The wire adapter behind a channel
///
/// A transport executes the steps of its channel's plan. It is shared by every
/// attempt on the channel, so any connection or session state it keeps must be
/// safe to use from concurrent attempts.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Acquire channel-wide resources. Called at most once per channel.
    async fn init(&self, _settings: &ChannelSettings) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Release channel-wide resources. Only called when no attempt is running
    /// on the channel.
    async fn shutdown(&self) {}

    /// Execute one step.
    ///
    /// The future may be dropped at any await point if the attempt is
    /// cancelled, unless the step `commits`.
    async fn execute(
        &self,
        step: &StepDescriptor,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutput, DeliveryError>;
}

/// Everything a transport may look at or signal while executing a step
pub struct StepContext<'a> {
    pub(crate) message: &'a Message,
    pub(crate) channel: &'a ChannelName,
    pub(crate) settings: &'a ChannelSettings,
    pub(crate) handle: &'a AttemptHandle,
    pub(crate) events: &'a EventHub,
    /// Completed share of the plan before this step, and this step's share
    pub(crate) progress_base: f32,
    pub(crate) progress_span: f32,
}

impl StepContext<'_> {
    #[must_use]
    pub const fn message(&self) -> &Message {
        self.message
    }

    #[must_use]
    pub fn attempt_id(&self) -> AttemptId {
        self.handle.id()
    }

    #[must_use]
    pub const fn channel(&self) -> &ChannelName {
        self.channel
    }

    #[must_use]
    pub const fn settings(&self) -> &ChannelSettings {
        self.settings
    }

    /// Report progress within the current step, `fraction` between 0 and 1.
    pub fn report_progress(&self, fraction: f32) {
        self.events.emit(DeliveryEvent::Progress {
            message_id: self.message.id,
            attempt_id: self.handle.id(),
            progress: Progress::fraction(self.progress_span.mul_add(fraction.clamp(0.0, 1.0), self.progress_base)),
        });
    }

    /// Report that the step is busy without knowing how far along it is.
    pub fn report_activity(&self) {
        self.events.emit(DeliveryEvent::Progress {
            message_id: self.message.id,
            attempt_id: self.handle.id(),
            progress: Progress::Indeterminate,
        });
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancel_requested()
    }

    /// Declare that the remote side now durably holds the message.
    ///
    /// From here on the attempt cannot be cancelled. Returns `false` if the
    /// attempt had already been marked.
    pub fn mark_irrevocable(&self) -> bool {
        let marked = self.handle.mark_irrevocable();
        if marked {
            self.events.emit(DeliveryEvent::BecameNonCancellable {
                message_id: self.message.id,
                attempt_id: self.handle.id(),
            });
        }
        marked
    }
}

impl std::fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("message_id", &self.message.id)
            .field("attempt_id", &self.handle.id())
            .field("channel", self.channel)
            .finish_non_exhaustive()
    }
}
