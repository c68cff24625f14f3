//! End-to-end behaviour of the dispatcher over scripted transports
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use herald_common::{ArtifactKey, LifecycleState};
use herald_delivery::{
    ChannelConfig, ChannelName, ChannelRegistry, DeliveryError, DeliveryEvent, DispatcherConfig,
    InteractionKind, InteractionOutcome, Progress, RecoveryConfig, SendStatus, StepKind, SystemError,
    Transport,
};
use herald_store::{MessageStore, TestMessageStore};
use pretty_assertions::assert_eq;
use support::{Fault, GatedStore, Harness, ScriptedTransport, WAIT, message};

fn quick_recovery() -> RecoveryConfig {
    RecoveryConfig {
        base_retry_delay_ms: 10,
        max_retry_delay_ms: 10,
        retry_jitter_factor: 0.0,
        ..RecoveryConfig::default()
    }
}

/// `CloudMail` falling back to `LocalMailApp`, both routed from "email"
fn mail_chain(cloud: &Arc<ScriptedTransport>, local: &Arc<ScriptedTransport>) -> ChannelRegistry {
    ChannelRegistry::builder()
        .channel(
            ChannelConfig::new("CloudMail")
                .fallback("LocalMailApp")
                .recovery(quick_recovery()),
            Arc::clone(cloud) as Arc<dyn Transport>,
        )
        .channel(
            ChannelConfig::new("LocalMailApp").recovery(quick_recovery()),
            Arc::clone(local) as Arc<dyn Transport>,
        )
        .route("email", "CloudMail")
        .build()
        .unwrap()
}

fn single(transport: &Arc<ScriptedTransport>) -> ChannelRegistry {
    ChannelRegistry::builder()
        .channel(
            ChannelConfig::new("CloudMail").recovery(quick_recovery()),
            Arc::clone(transport) as Arc<dyn Transport>,
        )
        .route("email", "CloudMail")
        .build()
        .unwrap()
}

fn is_finished_via(event: &DeliveryEvent, name: &str) -> bool {
    matches!(event, DeliveryEvent::Finished { channel, .. } if channel == &ChannelName::from(name))
}

async fn wait_for_calls(transport: &ScriptedTransport, kind: &StepKind, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while transport.calls(kind) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("step was not called");
}

#[tokio::test]
async fn test_delivers_and_persists_every_artifact() {
    let transport = ScriptedTransport::new();
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    let status = harness.dispatcher.send(message.clone()).await.unwrap();
    assert_eq!(status, SendStatus::Scheduled);

    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "CloudMail"));

    let stored = harness.stored(&message).await;
    assert_eq!(stored.state(), LifecycleState::Sent);
    assert!(stored.artifacts.contains(&ArtifactKey::from("uploaded_url")));
    assert!(stored.artifacts.contains(&ArtifactKey::from("canonical_url")));
    assert!(stored.confirmed_recipients.contains("alice@example.com"));
    assert!(!harness.dispatcher.is_delivering(&message.id));
    assert_eq!(harness.dispatcher.in_flight_count(), 0);

    let events = harness.events.events();
    assert!(matches!(events.first(), Some(DeliveryEvent::Started { .. })));
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, DeliveryEvent::BecameNonCancellable { .. })),
        1
    );
    assert!(events.iter().any(|event| matches!(
        event,
        DeliveryEvent::Progress { progress: Progress::Determinate(done), .. } if (done - 1.0).abs() < f32::EPSILON
    )));

    harness.stop().await;
    assert_eq!(transport.inits(), 1);
    assert_eq!(transport.shutdowns(), 1);
}

#[tokio::test]
async fn test_second_send_while_in_flight_is_ignored() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate(StepKind::Authenticate);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    assert_eq!(
        harness.dispatcher.send(message.clone()).await.unwrap(),
        SendStatus::Scheduled
    );
    gate.entered().await;
    assert_eq!(
        harness.dispatcher.send(message.clone()).await.unwrap(),
        SendStatus::AlreadyInFlight
    );

    gate.open();
    harness.finished(&message).await;

    assert_eq!(transport.calls(&StepKind::Authenticate), 1);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, DeliveryEvent::Started { .. })),
        1
    );

    assert_eq!(
        harness.dispatcher.send(message.clone()).await.unwrap(),
        SendStatus::AlreadySent
    );
    assert!(!harness.dispatcher.is_delivering(&message.id));

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_mid_flight_reverts_to_not_sent() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate(StepKind::Upload);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    gate.entered().await;

    assert!(harness.dispatcher.is_delivering_and_cancellable(&message.id));
    assert!(harness.dispatcher.cancel(&message.id));

    let event = harness.finished(&message).await;
    assert!(matches!(event, DeliveryEvent::Cancelled { .. }));

    assert_eq!(harness.stored(&message).await.state(), LifecycleState::NotSent);
    assert_eq!(transport.calls(&StepKind::Commit), 0);
    assert!(!harness.dispatcher.is_delivering(&message.id));
    assert!(!harness.dispatcher.cancel(&message.id));

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_while_send_persists_leaves_not_sent() {
    let transport = ScriptedTransport::new();
    let store = TestMessageStore::new();
    let gated = GatedStore::new(store.clone());
    let gate = gated.gate_update(LifecycleState::Sending);
    let mut harness = Harness::start_over(
        single(&transport),
        store,
        Arc::clone(&gated) as Arc<dyn MessageStore>,
        DispatcherConfig::default(),
    );
    let message = message("email");

    let sending = {
        let dispatcher = harness.dispatcher.clone();
        let message = message.clone();
        tokio::spawn(async move { dispatcher.send(message).await })
    };

    // Written as new, but not yet moved to `Sending`
    harness.store.wait_for_count(1, WAIT).await.unwrap();
    gate.entered().await;

    assert!(harness.dispatcher.cancel(&message.id));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        harness.events.count(|event| matches!(event, DeliveryEvent::Cancelled { .. })),
        0
    );

    gate.open();
    sending.await.unwrap().unwrap();

    let event = harness.finished(&message).await;
    assert!(matches!(event, DeliveryEvent::Cancelled { .. }));
    harness
        .store
        .wait_for_state(&message.id, LifecycleState::NotSent, WAIT)
        .await
        .unwrap();
    assert!(!harness.dispatcher.is_delivering(&message.id));
    assert_eq!(transport.calls(&StepKind::Authenticate), 0);

    // Nothing is left for a restart to pick up
    assert_eq!(harness.dispatcher.resume_pending().await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_refused_during_commit() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate(StepKind::Commit);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    gate.entered().await;

    assert!(harness.dispatcher.is_delivering(&message.id));
    assert!(!harness.dispatcher.is_delivering_and_cancellable(&message.id));
    assert!(!harness.dispatcher.cancel(&message.id));

    gate.open();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "CloudMail"));
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::Sent);

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_refused_once_irrevocable() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate(StepKind::Confirm);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    gate.entered().await;
    harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::BecameNonCancellable { .. }))
        .await;

    assert!(!harness.dispatcher.cancel(&message.id));
    assert_eq!(harness.dispatcher.cancel_all(), 0);

    gate.open();
    harness.finished(&message).await;
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, DeliveryEvent::Cancelled { .. })),
        0
    );
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::Sent);

    harness.stop().await;
}

#[tokio::test]
async fn test_transient_failures_exhaust_into_manual_retry() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::Transient; 4]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    let DeliveryEvent::QueuedForManualRetry { error, .. } = event else {
        panic!("expected manual retry, got {event:?}");
    };
    assert!(error.is_transient());

    // max_retries of 3 allows four attempts in total
    assert_eq!(transport.calls(&StepKind::Authenticate), 4);
    assert_eq!(transport.calls(&StepKind::Upload), 0);

    let stored = harness.stored(&message).await;
    assert_eq!(stored.state(), LifecycleState::QueuedForManualRetry);
    assert!(stored.last_error.is_some());

    // A manual re-send starts over with fresh counters
    assert_eq!(
        harness.dispatcher.send(message.clone()).await.unwrap(),
        SendStatus::Scheduled
    );
    harness
        .events
        .wait_for(|event| is_finished_via(event, "CloudMail"))
        .await;
    assert_eq!(harness.stored(&message).await.last_error, None);

    harness.stop().await;
}

#[tokio::test]
async fn test_rejection_falls_back_exactly_once() {
    let cloud = ScriptedTransport::new();
    let local = ScriptedTransport::new();
    cloud.fail(
        StepKind::Upload,
        [Fault::Transient, Fault::Transient, Fault::Transient, Fault::Rejected],
    );
    let mut harness = Harness::start(mail_chain(&cloud, &local));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "LocalMailApp"));

    assert_eq!(cloud.calls(&StepKind::Upload), 4);
    assert_eq!(local.calls(&StepKind::Upload), 1);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, DeliveryEvent::Finished { .. })),
        1
    );
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, DeliveryEvent::QueuedForManualRetry { .. })),
        0
    );
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::Sent);

    harness.stop().await;
}

#[tokio::test]
async fn test_fallback_reuses_cached_artifacts() {
    let cloud = ScriptedTransport::new();
    let local = ScriptedTransport::new();
    cloud.fail(StepKind::Commit, [Fault::Rejected]);
    let mut harness = Harness::start(mail_chain(&cloud, &local));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "LocalMailApp"));

    // The upload made by CloudMail is reused, not repeated
    assert_eq!(cloud.calls(&StepKind::Upload), 1);
    assert_eq!(local.calls(&StepKind::Upload), 0);
    assert_eq!(local.calls(&StepKind::Commit), 1);

    let stored = harness.stored(&message).await;
    let uploaded = stored.artifacts.get(&ArtifactKey::from("uploaded_url")).unwrap();
    assert!(uploaded.starts_with("https://CloudMail/"));
    let canonical = stored.artifacts.get(&ArtifactKey::from("canonical_url")).unwrap();
    assert!(canonical.starts_with("https://LocalMailApp/"));

    harness.stop().await;
}

#[tokio::test]
async fn test_unavailable_resource_backs_off_then_succeeds() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::Unavailable, Fault::Unavailable]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "CloudMail"));
    assert_eq!(transport.calls(&StepKind::Authenticate), 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::Unavailable]);
    let registry = ChannelRegistry::builder()
        .channel(
            ChannelConfig::new("CloudMail").recovery(RecoveryConfig {
                base_retry_delay_ms: 60_000,
                max_retry_delay_ms: 60_000,
                retry_jitter_factor: 0.0,
                ..RecoveryConfig::default()
            }),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .route("email", "CloudMail")
        .build()
        .unwrap();
    let mut harness = Harness::start(registry);
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    wait_for_calls(&transport, &StepKind::Authenticate, 1).await;

    assert!(harness.dispatcher.cancel(&message.id));
    let event = harness.finished(&message).await;
    assert!(matches!(event, DeliveryEvent::Cancelled { .. }));

    assert_eq!(transport.calls(&StepKind::Authenticate), 1);
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::NotSent);

    harness.stop().await;
}

#[tokio::test]
async fn test_interaction_approval_resumes_delivery() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::AuthExpired]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::AwaitingInteraction { .. }))
        .await;
    let DeliveryEvent::AwaitingInteraction { request, .. } = event else {
        unreachable!();
    };

    assert_eq!(request.kind, InteractionKind::Reauthorize);
    assert_eq!(request.message_id, message.id);
    assert_eq!(harness.bridge.requests.lock().clone(), vec![request.clone()]);
    assert_eq!(harness.dispatcher.pending_interactions(), vec![request.clone()]);
    assert!(harness.dispatcher.is_delivering(&message.id));

    assert!(
        harness
            .dispatcher
            .on_interaction_result(request.id, InteractionOutcome::Approved)
    );
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "CloudMail"));
    assert_eq!(transport.calls(&StepKind::Authenticate), 2);

    // Answering twice has no effect
    assert!(
        !harness
            .dispatcher
            .on_interaction_result(request.id, InteractionOutcome::Approved)
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_while_awaiting_interaction_withdraws_it() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::AuthExpired]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::AwaitingInteraction { .. }))
        .await;
    let DeliveryEvent::AwaitingInteraction { request, .. } = event else {
        unreachable!();
    };

    assert!(harness.dispatcher.cancel(&message.id));
    let event = harness.finished(&message).await;
    assert!(matches!(event, DeliveryEvent::Cancelled { .. }));

    assert_eq!(harness.bridge.withdrawn.lock().clone(), vec![request.id]);
    assert!(harness.dispatcher.pending_interactions().is_empty());
    assert!(!harness.dispatcher.is_awaiting(&request.id));
    assert!(
        !harness
            .dispatcher
            .on_interaction_result(request.id, InteractionOutcome::Approved)
    );
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::NotSent);
    assert_eq!(transport.calls(&StepKind::Authenticate), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_denied_interaction_moves_to_fallback() {
    let cloud = ScriptedTransport::new();
    let local = ScriptedTransport::new();
    cloud.fail(StepKind::Authenticate, [Fault::AuthExpired]);
    let mut harness = Harness::start(mail_chain(&cloud, &local));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::AwaitingInteraction { .. }))
        .await;
    let DeliveryEvent::AwaitingInteraction { request, .. } = event else {
        unreachable!();
    };

    assert!(
        harness
            .dispatcher
            .on_interaction_result(request.id, InteractionOutcome::Denied)
    );
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "LocalMailApp"));
    assert_eq!(cloud.calls(&StepKind::Authenticate), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_denied_interaction_without_fallback_needs_manual_retry() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::AuthExpired]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::AwaitingInteraction { .. }))
        .await;
    let DeliveryEvent::AwaitingInteraction { request, .. } = event else {
        unreachable!();
    };

    harness
        .dispatcher
        .on_interaction_result(request.id, InteractionOutcome::Denied);
    let event = harness.finished(&message).await;
    assert!(matches!(event, DeliveryEvent::QueuedForManualRetry { .. }));
    assert_eq!(
        harness.stored(&message).await.state(),
        LifecycleState::QueuedForManualRetry
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_no_matching_channel_is_rejected_up_front() {
    let transport = ScriptedTransport::new();
    let mut harness = Harness::start(single(&transport));
    let message = message("fax");

    let error = harness.dispatcher.send(message.clone()).await.unwrap_err();
    assert!(matches!(
        error,
        DeliveryError::System(SystemError::NoMatchingChannel(_))
    ));
    assert_eq!(harness.store.message_count(), 0);
    assert!(!harness.dispatcher.is_delivering(&message.id));

    harness.stop().await;
}

#[tokio::test]
async fn test_disabled_head_routes_to_fallback() {
    let cloud = ScriptedTransport::new();
    let local = ScriptedTransport::new();
    let registry = mail_chain(&cloud, &local);
    registry
        .get(&ChannelName::from("CloudMail"))
        .unwrap()
        .set_enabled(false);
    let mut harness = Harness::start(registry);
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "LocalMailApp"));
    assert_eq!(cloud.calls(&StepKind::Authenticate), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_resume_pending_skips_completed_steps() {
    let store = TestMessageStore::new();
    let mut interrupted = message("email");
    interrupted.advance(LifecycleState::Sending).unwrap();
    interrupted
        .artifacts
        .set(ArtifactKey::from("uploaded_url"), "https://CloudMail/upload/earlier");
    store.write(&interrupted).await.unwrap();

    let untouched = message("email");
    store.write(&untouched).await.unwrap();

    let transport = ScriptedTransport::new();
    let mut harness = Harness::start_with(single(&transport), store, DispatcherConfig::default());

    assert_eq!(harness.dispatcher.resume_pending().await.unwrap(), 1);
    let event = harness.finished(&interrupted).await;
    assert!(is_finished_via(&event, "CloudMail"));
    assert_eq!(transport.calls(&StepKind::Upload), 0);
    assert_eq!(transport.calls(&StepKind::Commit), 1);
    assert_eq!(harness.stored(&untouched).await.state(), LifecycleState::NotSent);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_retried() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::Hang]);
    let config = DispatcherConfig {
        attempt_timeout_secs: 1,
        ..DispatcherConfig::default()
    };
    let mut harness = Harness::start_with(single(&transport), TestMessageStore::new(), config);
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness.finished(&message).await;
    assert!(is_finished_via(&event, "CloudMail"));
    assert_eq!(transport.calls(&StepKind::Authenticate), 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_withdraws_interactions_and_keeps_sending() {
    let transport = ScriptedTransport::new();
    transport.fail(StepKind::Authenticate, [Fault::AuthExpired]);
    let mut harness = Harness::start(single(&transport));
    let message = message("email");

    harness.dispatcher.send(message.clone()).await.unwrap();
    let event = harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::AwaitingInteraction { .. }))
        .await;
    let DeliveryEvent::AwaitingInteraction { request, .. } = event else {
        unreachable!();
    };

    harness.stop().await;

    assert_eq!(harness.bridge.withdrawn.lock().clone(), vec![request.id]);
    assert_eq!(harness.stored(&message).await.state(), LifecycleState::Sending);
    assert_eq!(transport.shutdowns(), 1);
}

#[tokio::test]
async fn test_serve_twice_is_refused() {
    let transport = ScriptedTransport::new();
    let mut harness = Harness::start(single(&transport));

    // Let the harness worker take the queue first
    harness.dispatcher.send(message("email")).await.unwrap();
    harness
        .events
        .wait_for(|event| matches!(event, DeliveryEvent::Finished { .. }))
        .await;

    let (_shutdown, receiver) = tokio::sync::broadcast::channel(1);
    let error = harness.dispatcher.serve(receiver).await.unwrap_err();
    assert!(matches!(
        error,
        DeliveryError::System(SystemError::AlreadyServing)
    ));

    harness.stop().await;
}
