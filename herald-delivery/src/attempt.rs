//! A single try at delivering one message over one channel

use std::sync::Arc;

use herald_common::{Message, MessageId, internal, transport};
use herald_store::MessageStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    channel::{Channel, StepContext, StepDescriptor, StepOutput},
    error::{DeliveryError, TransientError},
    events::{DeliveryEvent, EventHub},
    types::{AttemptId, Outcome, Progress},
};

/// Where an attempt is in its run
///
/// `Created -> Running -> {Succeeded | Cancelled | Failed}`, with
/// `Irrevocable` as a sub-state of `Running` after which `Cancelled` is
/// unreachable. A failed attempt that is retried goes back to `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    Running,
    Irrevocable,
    Succeeded,
    Cancelled,
    Failed,
}

#[derive(Debug)]
struct Flags {
    state: AttemptState,
    cancel_requested: bool,
    committing: bool,
    irrevocable: bool,
}

#[derive(Debug)]
struct HandleInner {
    id: AttemptId,
    message_id: MessageId,
    token: CancellationToken,
    flags: Mutex<Flags>,
}

/// Shared control surface of an attempt
///
/// Cloned into the dispatcher's in-flight table so a cancel request can reach
/// an attempt while the worker is running it.
#[derive(Debug, Clone)]
pub struct AttemptHandle {
    inner: Arc<HandleInner>,
}

impl AttemptHandle {
    #[must_use]
    pub fn new(id: AttemptId, message_id: MessageId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                message_id,
                token: CancellationToken::new(),
                flags: Mutex::new(Flags {
                    state: AttemptState::Created,
                    cancel_requested: false,
                    committing: false,
                    irrevocable: false,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> AttemptId {
        self.inner.id
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.inner.message_id
    }

    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.inner.flags.lock().state
    }

    /// Request cancellation.
    ///
    /// Refused once the attempt is irrevocable, while a committing step is in
    /// progress, or once it has succeeded. Accepting cancels the token, which
    /// drops any in-progress step that does not commit.
    pub fn cancel(&self) -> bool {
        {
            let mut flags = self.inner.flags.lock();
            if flags.irrevocable
                || flags.committing
                || matches!(flags.state, AttemptState::Succeeded)
            {
                return false;
            }
            if flags.cancel_requested || flags.state == AttemptState::Cancelled {
                return true;
            }
            flags.cancel_requested = true;
        }

        self.inner.token.cancel();
        true
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.flags.lock().cancel_requested
    }

    #[must_use]
    pub fn is_irrevocable(&self) -> bool {
        self.inner.flags.lock().irrevocable
    }

    /// Whether [`AttemptHandle::cancel`] would currently be accepted and have
    /// an effect
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        let flags = self.inner.flags.lock();
        !(flags.irrevocable
            || flags.committing
            || flags.cancel_requested
            || matches!(
                flags.state,
                AttemptState::Succeeded | AttemptState::Cancelled
            ))
    }

    /// Resolves once cancellation has been accepted
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Move to `Running`. Returns `false` if cancellation was already
    /// requested.
    pub(crate) fn begin(&self) -> bool {
        let mut flags = self.inner.flags.lock();
        if flags.cancel_requested {
            return false;
        }
        flags.state = if flags.irrevocable {
            AttemptState::Irrevocable
        } else {
            AttemptState::Running
        };
        true
    }

    /// Enter a committing step. Returns `false` if cancellation was already
    /// requested, in which case the step must not run.
    pub(crate) fn begin_commit(&self) -> bool {
        let mut flags = self.inner.flags.lock();
        if flags.cancel_requested {
            return false;
        }
        flags.committing = true;
        true
    }

    /// Leave a committing step. Returns `true` if this made the attempt
    /// irrevocable.
    pub(crate) fn end_commit(&self, committed: bool) -> bool {
        let mut flags = self.inner.flags.lock();
        flags.committing = false;
        if committed && !flags.irrevocable {
            flags.irrevocable = true;
            flags.state = AttemptState::Irrevocable;
            return true;
        }
        false
    }

    /// Returns `true` if this call made the attempt irrevocable.
    pub(crate) fn mark_irrevocable(&self) -> bool {
        let mut flags = self.inner.flags.lock();
        if flags.irrevocable {
            return false;
        }
        flags.irrevocable = true;
        if flags.state == AttemptState::Running {
            flags.state = AttemptState::Irrevocable;
        }
        true
    }

    /// The run was abandoned from outside, e.g. by a timeout.
    ///
    /// A committing step that was interrupted may or may not have reached the
    /// remote side, so the attempt is treated as irrevocable.
    pub(crate) fn interrupt(&self) {
        let mut flags = self.inner.flags.lock();
        if flags.committing {
            flags.committing = false;
            flags.irrevocable = true;
        }
        flags.state = AttemptState::Failed;
    }

    pub(crate) fn finish(&self, state: AttemptState) {
        self.inner.flags.lock().state = state;
    }

    /// Mark the run succeeded unless a cancel that still applies got in first.
    ///
    /// Once this returns `true` every later [`AttemptHandle::cancel`] is refused.
    pub(crate) fn try_finish_succeeded(&self) -> bool {
        let mut flags = self.inner.flags.lock();
        if flags.cancel_requested && !flags.irrevocable {
            return false;
        }
        flags.state = AttemptState::Succeeded;
        true
    }

    /// Prepare a failed attempt to run again under the same identity.
    ///
    /// Returns `false` if cancellation was requested in the meantime.
    pub(crate) fn rearm(&self) -> bool {
        let mut flags = self.inner.flags.lock();
        if flags.cancel_requested {
            return false;
        }
        flags.state = AttemptState::Created;
        true
    }
}

enum StepResult {
    Done(Result<StepOutput, DeliveryError>),
    Cancelled,
}

/// One try at delivering a message over a channel
///
/// Created by [`Channel::new_attempt`] and run on the dispatcher's worker.
/// Every artifact a step produces is written onto the message and persisted
/// before the next step starts.
#[derive(Debug)]
pub struct DeliveryAttempt {
    channel: Arc<Channel>,
    message: Message,
    handle: AttemptHandle,
}

impl DeliveryAttempt {
    pub(crate) const fn new(channel: Arc<Channel>, message: Message, handle: AttemptHandle) -> Self {
        Self {
            channel,
            message,
            handle,
        }
    }

    #[must_use]
    pub fn id(&self) -> AttemptId {
        self.handle.id()
    }

    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub const fn handle(&self) -> &AttemptHandle {
        &self.handle
    }

    #[must_use]
    pub const fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Run the channel's step plan to completion, cancellation, or the first
    /// failure.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip_all,
        fields(message_id = %self.message.id, attempt_id = %self.handle.id(), channel = %self.channel.name())
    )]
    pub async fn run(&mut self, store: &dyn MessageStore, events: &EventHub) -> Outcome {
        if !self.handle.begin() {
            return self.cancelled();
        }

        events.emit(DeliveryEvent::Started {
            message_id: self.message.id,
            attempt_id: self.handle.id(),
            channel: self.channel.name().clone(),
        });

        if let Err(error) = self.channel.init().await {
            return self.failed(error);
        }

        let total: f32 = self.channel.steps().iter().map(|step| step.weight).sum();
        let share = |weight: f32| if total > 0.0 { weight / total } else { 0.0 };
        let mut completed = 0.0;

        let channel = Arc::clone(&self.channel);
        for step in channel.steps() {
            if self.handle.is_cancel_requested() {
                return self.cancelled();
            }

            if let Some(key) = &step.artifact
                && self.message.artifacts.contains(key)
            {
                debug!(step = %step.kind, artifact = %key, "Artifact already present, skipping step");
                if step.commits && self.handle.mark_irrevocable() {
                    self.became_non_cancellable(events);
                }
                completed += step.weight;
                continue;
            }

            let output = match self.execute(step, events, share(completed), share(step.weight)).await {
                StepResult::Cancelled => return self.cancelled(),
                StepResult::Done(Err(DeliveryError::Cancelled)) if !self.handle.is_irrevocable() => {
                    return self.cancelled();
                }
                StepResult::Done(Err(error)) => return self.failed(error),
                StepResult::Done(Ok(output)) => output,
            };

            if let Err(error) = self.absorb(step, output, store).await {
                return self.failed(error);
            }

            completed += step.weight;
            events.emit(DeliveryEvent::Progress {
                message_id: self.message.id,
                attempt_id: self.handle.id(),
                progress: if total > 0.0 {
                    Progress::fraction(share(completed))
                } else {
                    Progress::Indeterminate
                },
            });

            if self.handle.is_cancel_requested() && !self.handle.is_irrevocable() {
                return self.cancelled();
            }
        }

        if !self.handle.try_finish_succeeded() {
            return self.cancelled();
        }
        internal!(
            level = DEBUG,
            "Attempt {} delivered message {} via {}",
            self.handle.id(),
            self.message.id,
            self.channel.name()
        );
        Outcome::Succeeded
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        events: &EventHub,
        progress_base: f32,
        progress_span: f32,
    ) -> StepResult {
        let ctx = StepContext {
            message: &self.message,
            channel: self.channel.name(),
            settings: self.channel.settings(),
            handle: &self.handle,
            events,
            progress_base,
            progress_span,
        };

        transport!(
            level = DEBUG,
            "Executing {} for message {} on {}",
            step.kind,
            self.message.id,
            self.channel.name()
        );

        if step.commits {
            if !self.handle.begin_commit() {
                return StepResult::Cancelled;
            }

            let result = self.execute_step(step, &ctx).await;
            if self.handle.end_commit(result.is_ok()) {
                self.became_non_cancellable(events);
            }
            return StepResult::Done(result);
        }

        tokio::select! {
            biased;
            () = self.handle.cancelled() => StepResult::Cancelled,
            result = self.execute_step(step, &ctx) => StepResult::Done(result),
        }
    }

    async fn execute_step(
        &self,
        step: &StepDescriptor,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutput, DeliveryError> {
        let transport = self.channel.transport();
        match self.channel.settings().step_timeout() {
            Some(limit) => tokio::time::timeout(limit, transport.execute(step, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(TransientError::Timeout(format!(
                        "{} did not finish within {}s",
                        step.kind,
                        limit.as_secs()
                    ))
                    .into())
                }),
            None => transport.execute(step, ctx).await,
        }
    }

    /// Write what a step produced onto the message and persist it.
    async fn absorb(
        &mut self,
        step: &StepDescriptor,
        output: StepOutput,
        store: &dyn MessageStore,
    ) -> Result<(), DeliveryError> {
        let mut changed = false;

        match (&step.artifact, output.artifact) {
            (Some(key), Some(value)) => {
                changed = self.message.artifacts.set(key.clone(), value);
                if !changed {
                    warn!(artifact = %key, "Step produced an empty or duplicate artifact, keeping the cached value");
                }
            }
            (Some(key), None) => {
                warn!(step = %step.kind, artifact = %key, "Step did not produce its artifact");
            }
            (None, _) => {}
        }

        for recipient in output.confirmed {
            changed |= self.message.confirm_recipient(recipient);
        }

        if changed {
            store.update(&self.message).await?;
        }

        Ok(())
    }

    fn became_non_cancellable(&self, events: &EventHub) {
        internal!(
            level = DEBUG,
            "Attempt {} for message {} is no longer cancellable",
            self.handle.id(),
            self.message.id
        );
        events.emit(DeliveryEvent::BecameNonCancellable {
            message_id: self.message.id,
            attempt_id: self.handle.id(),
        });
    }

    fn cancelled(&self) -> Outcome {
        self.handle.finish(AttemptState::Cancelled);
        internal!(
            level = DEBUG,
            "Attempt {} for message {} cancelled",
            self.handle.id(),
            self.message.id
        );
        Outcome::Cancelled
    }

    fn failed(&self, error: DeliveryError) -> Outcome {
        self.handle.finish(AttemptState::Failed);
        warn!(
            message_id = %self.message.id,
            attempt_id = %self.handle.id(),
            channel = %self.channel.name(),
            kind = ?error.kind(),
            "Attempt failed: {error}"
        );
        Outcome::Failed(error)
    }
}
