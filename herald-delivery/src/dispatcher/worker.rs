use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use herald_common::{Signal, internal};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};

use super::{Dispatcher, Job, state::Phase};
use crate::{
    attempt::AttemptHandle,
    channel::Channel,
    error::{DeliveryError, SystemError, TransientError},
    types::Outcome,
};

impl Dispatcher {
    /// Run queued attempts until a shutdown signal arrives.
    ///
    /// Attempts run strictly one at a time, in the order they were queued.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Backoff timers stop and parked interactions are withdrawn
    /// 2. Pending cancellations get up to `shutdown_timeout_secs` to settle
    /// 3. Every channel is shut down
    ///
    /// Messages still in flight stay `Sending` in the store and are picked up
    /// by [`Dispatcher::resume_pending`] on the next start.
    ///
    /// # Errors
    /// [`SystemError::AlreadyServing`] if another task is already serving.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        let receiver = self.shared.receiver.lock().take();
        let Some(mut jobs) = receiver else {
            return Err(SystemError::AlreadyServing.into());
        };

        internal!("Dispatcher starting");

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
                sig = shutdown.recv() => match sig {
                    Ok(Signal::Shutdown | Signal::Finalised) => {
                        internal!("Dispatcher received shutdown signal");
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dispatcher missed {skipped} signals");
                    }
                    Err(RecvError::Closed) => {
                        error!("Dispatcher shutdown channel closed");
                        break;
                    }
                },
            }
        }

        self.wind_down().await;
        *self.shared.receiver.lock() = Some(jobs);

        internal!("Dispatcher shutdown complete");
        Ok(())
    }

    async fn wind_down(&self) {
        self.shared.stopping.cancel();

        let withdrawn: Vec<_> = self.shared.state.lock().pending.drain().map(|(id, _)| id).collect();
        for interaction in &withdrawn {
            self.shared.bridge.withdraw(interaction);
        }

        let timeout = self.shared.config.shutdown_timeout();
        let start = std::time::Instant::now();
        while self.shared.cancel_pool.active() > 0 {
            if start.elapsed() >= timeout {
                warn!(
                    "Shutdown timeout exceeded, {} cancellations did not settle",
                    self.shared.cancel_pool.active()
                );
                break;
            }

            debug!(
                "Waiting for cancellations to settle ({:.1}s elapsed)...",
                start.elapsed().as_secs_f64()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let busy: AHashSet<_> = self
            .shared
            .state
            .lock()
            .in_flight
            .values()
            .filter(|entry| entry.phase == Phase::Running)
            .map(|entry| entry.channel.name().clone())
            .collect();

        for channel in self.shared.registry.channels() {
            if busy.contains(channel.name()) {
                warn!(channel = %channel.name(), "Channel still has a running attempt, leaving it up");
                continue;
            }
            channel.shutdown().await;
        }
    }

    /// Run one queued attempt and route its outcome.
    async fn process(&self, job: Job) {
        let Some((channel, handle)) = self.claim(job) else {
            debug!(message_id = %job.message_id, "Skipping stale or cancelled job");
            return;
        };

        let message = match self.shared.store.read(&job.message_id).await {
            Ok(message) => message,
            Err(error) => {
                error!(message_id = %job.message_id, "Could not load message for delivery: {error}");
                self.abandon_unreadable(job, error.into());
                return;
            }
        };

        let mut attempt = channel.new_attempt(message, handle.clone());
        let limit = self.shared.config.attempt_timeout();
        let outcome = match tokio::time::timeout(
            limit,
            attempt.run(self.shared.store.as_ref(), &self.shared.events),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                handle.interrupt();
                warn!(message_id = %job.message_id, "Attempt exceeded {}s", limit.as_secs());
                Outcome::Failed(
                    TransientError::Timeout(format!("attempt exceeded {}s", limit.as_secs())).into(),
                )
            }
        };

        self.complete(channel, handle, attempt.into_message(), outcome)
            .await;
    }

    /// Move the job's entry from `Queued` to `Running`, unless it is stale or
    /// cancelled.
    fn claim(&self, job: Job) -> Option<(Arc<Channel>, AttemptHandle)> {
        let mut state = self.shared.state.lock();
        let entry = state.entry_mut(&job.message_id, job.attempt_id)?;
        if entry.phase != Phase::Queued || entry.handle.is_cancel_requested() {
            return None;
        }
        entry.phase = Phase::Running;
        Some((Arc::clone(&entry.channel), entry.handle.clone()))
    }
}
