/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! A bridge that answers on the calling thread, from inside create and send.

mod support;

use integration_test_utils::{wait_until, RecordingCallbacks};
use std::sync::Arc;
use std::time::Duration;
use subscription_core::{
    Message, MsgType, PlatformError, ServiceLevel, StatusCode, Subscription, SubscriptionSetup,
    SubscriptionState,
};
use support::{activate_and_settle, wait_for_state, Fixture, SETTLE, SOURCE, SYMBOL};

#[tokio::test(start_paused = true)]
async fn initial_answered_inline_completes_activation() {
    let fixture = Fixture::new();
    fixture.bridge.set_inline_replies(true);
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());

    activate_and_settle(&fixture, &subscription).await;

    assert_eq!(subscription.state(), SubscriptionState::Activated);
    assert_eq!(callbacks.msg_count(MsgType::Initial), 1);
    assert_eq!(callbacks.create_count(), 1);
    assert!(!subscription.is_expecting_initial());

    fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || callbacks.msg_count(MsgType::Update) == 1).await);
}

#[tokio::test(start_paused = true)]
async fn snapshot_answered_inline_deactivates() {
    let fixture = Fixture::new();
    fixture.bridge.set_inline_replies(true);
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = Subscription::allocate();
    subscription
        .setup(
            SubscriptionSetup::new(fixture.env.clone(), callbacks.clone(), SOURCE, SYMBOL)
                .with_service_level(ServiceLevel::Snapshot, 0),
        )
        .expect("snapshot setup");

    subscription.activate().expect("activate");
    assert!(wait_for_state(&subscription, SubscriptionState::Deactivated).await);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(callbacks.msg_count(MsgType::Initial), 1);
    assert_eq!(callbacks.error_count(StatusCode::Timeout), 0);
    assert_eq!(subscription.state(), SubscriptionState::Deactivated);
}

#[tokio::test(start_paused = true)]
async fn destroy_from_an_inline_initial_tears_down() {
    let fixture = Fixture::new();
    fixture.bridge.set_inline_replies(true);
    let callbacks = Arc::new(RecordingCallbacks::destroying_on_msg());
    let subscription = fixture.subscription(callbacks.clone());

    subscription.activate().expect("activate");
    assert!(wait_for_state(&subscription, SubscriptionState::Destroyed).await);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(callbacks.msg_count(MsgType::Initial), 1);
    assert_eq!(callbacks.destroy_count(), 1);
    assert_eq!(callbacks.error_count(StatusCode::Timeout), 0);
    assert_eq!(fixture.bridge.stats().live_subscriptions, 0);
    assert_eq!(fixture.queue.object_count(), 0);
    assert_eq!(fixture.transport.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn error_raised_inside_create_discards_the_new_bridge_subscription() {
    let fixture = Fixture::new();
    fixture
        .bridge
        .set_error_during_create(Some(PlatformError::new(9, "session dropped")), true);
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());

    subscription.activate().expect("activate");
    assert!(wait_until(SETTLE, || callbacks.error_count(StatusCode::Platform) == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(subscription.state(), SubscriptionState::Deactivated);
    assert_eq!(fixture.bridge.stats().creates, 1);
    assert_eq!(fixture.bridge.stats().live_subscriptions, 0);
    assert_eq!(callbacks.create_count(), 0);
    assert_eq!(fixture.queue.object_count(), 0);
    assert_eq!(fixture.transport.listener_count(), 0);
    assert_eq!(fixture.bridge.sent_count(MsgType::InitialRequest), 0);
}
