// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine tests: registration, endpoint activation, the dehydration sweeper
//! and event recording.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use orchestra_engine::{
    Endpoint, Engine, EngineConfig, EngineError, EventFilter, EventSettings, InvocationStyle,
    ProcessEvent, Store,
};

#[test]
fn test_builder_requires_bindings_and_interpreter() {
    let interpreter = Arc::new(RecordingInterpreter::new(timeline(), InterpreterOptions::default()));
    let err = Engine::builder()
        .interpreter(interpreter)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("binding context is required"));

    let err = Engine::builder()
        .bindings(Arc::new(CountingBindings::default()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("interpreter is required"));
}

#[tokio::test]
async fn test_register_activates_my_role_endpoints() {
    let harness = Harness::new();
    let runtime = harness.deploy(false).await;

    assert_eq!(
        *harness.bindings.activated.lock(),
        vec![Endpoint::new(ORDER_SERVICE, "OrderPort")]
    );
    let epr = runtime.initial_my_role_epr("client").await.unwrap();
    assert_eq!(
        epr.as_ref().map(|epr| epr.address()),
        Some("local://OrderService/OrderPort")
    );
    assert_eq!(
        runtime.my_role_endpoint("client").await.unwrap(),
        Endpoint::new(ORDER_SERVICE, "OrderPort")
    );

    let routed = harness.engine.route_for_service(ORDER_SERVICE).expect("service routed");
    assert_eq!(routed.process_id(), runtime.process_id());
    assert!(harness.engine.route_for_service(SHIPPER_SERVICE).is_none());
    assert_eq!(harness.engine.process_ids(), vec![order_process_id()]);
}

#[tokio::test]
async fn test_double_registration_is_rejected() {
    let harness = Harness::new();
    harness.deploy(false).await;

    let err = harness
        .engine
        .register(order_deployment(order_process_id(), false))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));
    assert!(err.to_string().contains("already registered"), "{}", err);
    assert_eq!(harness.bindings.activated.lock().len(), 1);
}

#[tokio::test]
async fn test_unregister_deactivates_and_closes_channels() {
    let harness = Harness::new();
    let runtime = harness.deploy(false).await;
    let channel = runtime.partner_role_channel("shipper").await.unwrap();
    drop(channel);

    assert!(harness.engine.unregister(runtime.process_id()).await.unwrap());
    assert!(!harness.engine.unregister(runtime.process_id()).await.unwrap());

    assert_eq!(
        *harness.bindings.deactivated.lock(),
        vec![Endpoint::new(ORDER_SERVICE, "OrderPort")]
    );
    let channels = harness.bindings.channels.lock();
    assert_eq!(channels.len(), 1);
    assert!(channels[0].closed.load(Ordering::SeqCst));
    assert!(!runtime.hint_is_hydrated());
    assert!(harness.engine.process(runtime.process_id()).is_none());
}

#[tokio::test]
async fn test_invoke_partner_sends_on_channel() {
    let harness = Harness::new();
    let runtime = harness.deploy(false).await;

    let mut exchange = harness
        .store
        .create_message_exchange(
            "out-1",
            orchestra_engine::Direction::Outbound,
            InvocationStyle::Unreliable,
        )
        .await
        .unwrap();
    exchange.operation = "ship".to_string();
    exchange.partner_link_model_id = Some(2);
    runtime.invoke_partner(&mut exchange).await.unwrap();

    let channels = harness.bindings.channels.lock();
    assert_eq!(*channels[0].invoked.lock(), vec!["out-1".to_string()]);
    assert_eq!(channels[0].port_type, "ShipperPT");
}

#[tokio::test]
async fn test_sweeper_dehydrates_and_stops_on_shutdown() {
    let config = EngineConfig {
        dehydration_idle: Some(Duration::ZERO),
        dehydration_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let harness = Harness::build(InterpreterOptions::default(), config, None);
    let runtime = harness.deploy(false).await;
    let sweeper = harness.engine.spawn_sweeper();

    tokio::time::timeout(Duration::from_secs(2), async {
        while runtime.hint_is_hydrated() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweeper dehydrates the idle process");

    harness.engine.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), sweeper)
        .await
        .expect("sweeper stops")
        .unwrap();
    assert!(harness.engine.process_ids().is_empty());
    assert_eq!(harness.bindings.deactivated.lock().len(), 1);
}

#[tokio::test]
async fn test_save_event_follows_deployment_settings() {
    let harness = Harness::new();
    let settings = EventSettings {
        process: EventFilter::Only(["ProcessInstanceStarted".to_string()].into()),
        ..EventSettings::default()
    };
    let runtime = harness
        .engine
        .register(order_deployment(order_process_id(), false).with_events(settings))
        .await
        .unwrap();

    let started = ProcessEvent::new("ProcessInstanceStarted");
    let modified = ProcessEvent::new("VariableModified");
    assert!(runtime.save_event(&started, Some(7)).await.unwrap());
    assert!(!runtime.save_event(&modified, Some(7)).await.unwrap());
    assert!(!runtime.save_event(&started, None).await.unwrap());

    let events = harness.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "ProcessInstanceStarted");
    assert_eq!(events[0].instance_id, Some(7));
}

#[tokio::test]
async fn test_transient_process_uses_private_store() {
    let harness = Harness::new();
    let runtime = harness.deploy(true).await;

    assert!(runtime.is_in_memory());
    let styles = runtime.supported_invocation_styles();
    assert!(styles.contains(&InvocationStyle::Transacted));
    assert!(styles.contains(&InvocationStyle::Unreliable));
    assert!(!styles.contains(&InvocationStyle::Reliable));

    assert!(runtime.store().get_process(&order_process_id()).await.unwrap().is_some());
    assert!(harness.store.get_process(&order_process_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_persistent_process_supports_reliable_invocation() {
    let harness = Harness::new();
    let runtime = harness.deploy(false).await;

    assert!(!runtime.is_in_memory());
    let styles = runtime.supported_invocation_styles();
    assert!(styles.contains(&InvocationStyle::Reliable));
    assert!(!styles.contains(&InvocationStyle::Transacted));
    assert!(runtime.provides_service(ORDER_SERVICE));
    assert_eq!(
        runtime.service_names().into_iter().collect::<Vec<_>>(),
        vec![ORDER_SERVICE.to_string()]
    );
}
