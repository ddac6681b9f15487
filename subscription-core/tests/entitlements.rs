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

mod support;

use integration_test_utils::{wait_until, RecordingCallbacks};
use std::sync::Arc;
use std::time::Duration;
use subscription_core::{
    Message, MsgType, StatusCode, Subscription, SubscriptionCallbacks, SubscriptionSetup,
    SubscriptionState,
};
use support::{activate_and_settle, Fixture, SETTLE, SOURCE, SYMBOL, TOPIC};

#[tokio::test(start_paused = true)]
async fn denied_subject_fails_setup_without_bridge_resources() {
    let fixture = Fixture::new();
    let entitlements = fixture.bridge.loopback_entitlements();
    entitlements.deny(TOPIC);

    let callbacks: Arc<dyn SubscriptionCallbacks> = Arc::new(RecordingCallbacks::new());
    let subscription = Subscription::allocate();
    let err = subscription
        .setup(SubscriptionSetup::new(
            fixture.env.clone(),
            callbacks,
            SOURCE,
            SYMBOL,
        ))
        .expect_err("denied subject must not set up");

    assert_eq!(err.code(), StatusCode::NotEntitled);
    assert_eq!(subscription.state(), SubscriptionState::Allocated);
    assert_eq!(fixture.bridge.stats().creates, 0);
    assert_eq!(fixture.bridge.stats().publishers, 0);
    assert_eq!(entitlements.live_handles(), 0);
    assert_eq!(fixture.queue.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deferred_entitlements_skip_the_local_check() {
    let fixture = Fixture::new();
    let entitlements = fixture.bridge.loopback_entitlements();
    entitlements.deny(TOPIC);
    entitlements.set_deferred(true);

    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    assert_eq!(entitlements.check_count(), 0);
    assert_eq!(callbacks.msg_count(MsgType::Initial), 1);
}

#[tokio::test(start_paused = true)]
async fn message_with_entitle_code_is_reported_not_delivered() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    fixture.bridge.publish(
        SOURCE,
        SYMBOL,
        Message::new(MsgType::Update).with_entitle_code(7),
    );
    assert!(wait_until(SETTLE, || callbacks.error_count(StatusCode::NotEntitled) == 1).await);

    assert_eq!(callbacks.msg_count(MsgType::Update), 0);
    assert_eq!(subscription.state(), SubscriptionState::Activated);
}

#[tokio::test(start_paused = true)]
async fn entitlement_revoked_after_setup_blocks_later_updates() {
    let fixture = Fixture::new();
    let entitlements = fixture.bridge.loopback_entitlements();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || callbacks.msg_count(MsgType::Update) == 1).await);

    entitlements.deny(TOPIC);
    fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || callbacks.error_count(StatusCode::NotEntitled) == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(callbacks.msg_count(MsgType::Update), 1);
}

#[tokio::test(start_paused = true)]
async fn entitlement_handle_is_released_on_destroy() {
    let fixture = Fixture::new();
    let entitlements = fixture.bridge.loopback_entitlements();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    assert_eq!(entitlements.live_handles(), 1);

    activate_and_settle(&fixture, &subscription).await;
    subscription.destroy().expect("destroy");
    assert!(wait_until(SETTLE, || subscription.state() == SubscriptionState::Destroyed).await);
    subscription.deallocate().expect("deallocate");

    assert_eq!(entitlements.live_handles(), 0);
}
