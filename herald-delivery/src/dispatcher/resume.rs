use herald_common::{LifecycleState, internal};
use tracing::warn;

use super::Dispatcher;
use crate::{error::DeliveryError, types::SendStatus};

impl Dispatcher {
    /// Re-schedule every message the store still has as `Sending`.
    ///
    /// Called on start-up to pick up deliveries interrupted by a crash or
    /// shutdown. Cached artifacts let each attempt skip the steps that had
    /// already completed. Returns how many messages were scheduled.
    ///
    /// # Errors
    /// If the store cannot be listed. Messages that fail individually are
    /// logged and skipped.
    pub async fn resume_pending(&self) -> Result<usize, DeliveryError> {
        let ids = self.shared.store.list().await?;
        let mut resumed = 0;

        for id in ids {
            let message = match self.shared.store.read(&id).await {
                Ok(message) => message,
                Err(error) => {
                    warn!(message_id = %id, "Skipping unreadable message: {error}");
                    continue;
                }
            };

            if message.state() != LifecycleState::Sending {
                continue;
            }

            match self.send(message).await {
                Ok(SendStatus::Scheduled) => resumed += 1,
                Ok(_) => {}
                Err(error) => warn!(message_id = %id, "Could not resume delivery: {error}"),
            }
        }

        internal!(level = INFO, "Resumed {resumed} interrupted deliveries");
        Ok(resumed)
    }
}
