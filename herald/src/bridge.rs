//! Answers interaction requests on behalf of an absent user
//!
//! The binary has no one to ask, so requests are logged and answered according
//! to configuration.

use herald_common::internal;
use herald_delivery::{BridgeMessage, Dispatcher, InteractionOutcome};
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

/// How to answer interactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AutoAnswer {
    #[default]
    Approve,
    Deny,
    /// Leave requests unanswered; the messages wait until cancelled.
    Ignore,
}

impl AutoAnswer {
    const fn outcome(self) -> Option<InteractionOutcome> {
        match self {
            Self::Approve => Some(InteractionOutcome::Approved),
            Self::Deny => Some(InteractionOutcome::Denied),
            Self::Ignore => None,
        }
    }
}

/// Drain `requests`, answering each through `dispatcher`. Ends when the
/// sending bridge is dropped.
pub fn spawn(
    dispatcher: Dispatcher,
    mut requests: mpsc::UnboundedReceiver<BridgeMessage>,
    answer: AutoAnswer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            match message {
                BridgeMessage::Request(request) => {
                    info!(
                        interaction = %request.id,
                        message_id = %request.message_id,
                        channel = %request.channel,
                        "Asked to {}: {}",
                        request.kind,
                        request.detail
                    );

                    let Some(outcome) = answer.outcome() else {
                        continue;
                    };
                    if !dispatcher.on_interaction_result(request.id, outcome) {
                        warn!(interaction = %request.id, "Interaction was no longer pending");
                    }
                }
                BridgeMessage::Withdraw(id) => {
                    internal!(level = DEBUG, "Interaction {id} withdrawn");
                }
            }
        }
    })
}
