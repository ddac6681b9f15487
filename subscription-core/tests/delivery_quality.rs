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

use integration_test_utils::{wait_until, CallbackEvent, RecordingCallbacks};
use std::sync::Arc;
use std::time::Duration;
use subscription_core::{
    BasicSetup, ItemClosure, Message, MsgQualifier, MsgType, PlatformError, Quality, StatusCode,
    Subscription, SubscriptionState,
};
use subscription_core::subscription::MsgQualifierFilter;
use support::{activate_and_settle, wait_for_state, Fixture, SETTLE, SOURCE, SYMBOL};

fn update(seq: u64) -> Message {
    Message::new(MsgType::Update).with_seq_num(seq)
}

#[tokio::test(start_paused = true)]
async fn duplicate_updates_are_suppressed() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    for seq in [1, 2, 2, 1, 3] {
        fixture.bridge.publish(SOURCE, SYMBOL, update(seq));
    }
    assert!(wait_until(SETTLE, || callbacks.update_seqs().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(callbacks.update_seqs(), vec![1, 2, 3]);
    assert_eq!(callbacks.count(|event| matches!(event, CallbackEvent::Gap { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn gap_requests_a_recap_and_recovers_quality() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    fixture.bridge.publish(SOURCE, SYMBOL, update(1));
    fixture.bridge.publish(SOURCE, SYMBOL, update(4));
    assert!(wait_until(SETTLE, || callbacks.qualities() == vec![Quality::Stale, Quality::Ok]).await);

    let events = callbacks.events();
    let gap = events
        .iter()
        .position(|event| matches!(event, CallbackEvent::Gap { .. }))
        .expect("gap reported");
    assert!(matches!(events[gap + 1], CallbackEvent::RecapRequest { .. }));
    assert!(matches!(
        events[gap + 2],
        CallbackEvent::Quality {
            quality: Quality::Stale,
            ..
        }
    ));
    assert!(matches!(
        events[gap + 3],
        CallbackEvent::Msg {
            msg_type: MsgType::Update,
            seq_num: Some(4),
            ..
        }
    ));
    assert_eq!(callbacks.msg_count(MsgType::Recap), 1);
    assert_eq!(fixture.bridge.sent_count(MsgType::RecapRequest), 1);
    assert_eq!(subscription.quality(), Quality::Ok);

    // Numbering continues from the recap.
    fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || callbacks.update_seqs() == vec![1, 4, 5]).await);
}

#[tokio::test(start_paused = true)]
async fn second_gap_while_stale_does_not_request_again() {
    let fixture = Fixture::new();
    fixture.bridge.set_image_replies(false);
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    subscription.set_requires_initial(false);
    activate_and_settle(&fixture, &subscription).await;

    for seq in [1, 3, 6] {
        fixture.bridge.publish(SOURCE, SYMBOL, update(seq));
    }
    assert!(wait_until(SETTLE, || callbacks.update_seqs().len() == 3).await);

    assert_eq!(callbacks.count(|event| matches!(event, CallbackEvent::Gap { .. })), 2);
    assert_eq!(callbacks.qualities(), vec![Quality::Stale]);
    assert_eq!(fixture.bridge.sent_count(MsgType::RecapRequest), 1);
}

#[tokio::test(start_paused = true)]
async fn possibly_stale_and_manual_recap() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    subscription.set_possibly_stale();
    subscription.set_possibly_stale();
    assert_eq!(callbacks.qualities(), vec![Quality::MaybeStale]);
    assert_eq!(subscription.quality(), Quality::MaybeStale);

    subscription.request_recap().expect("recap");
    assert!(wait_until(SETTLE, || subscription.quality() == Quality::Ok).await);

    assert_eq!(callbacks.qualities(), vec![Quality::MaybeStale, Quality::Ok]);
    assert_eq!(
        callbacks.count(|event| matches!(event, CallbackEvent::RecapRequest { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn qualifier_filter_drops_flagged_messages() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    subscription.set_recover_gaps(false);
    subscription.set_msg_qualifier_filter(MsgQualifierFilter {
        ignore_possibly_duplicate: true,
        ..MsgQualifierFilter::default()
    });
    activate_and_settle(&fixture, &subscription).await;

    fixture.bridge.publish(SOURCE, SYMBOL, update(1));
    fixture.bridge.publish(
        SOURCE,
        SYMBOL,
        update(1).with_qualifier(MsgQualifier::POSSIBLY_DUPLICATE),
    );
    fixture.bridge.publish(
        SOURCE,
        SYMBOL,
        update(2).with_qualifier(MsgQualifier::OUT_OF_SEQUENCE),
    );
    assert!(wait_until(SETTLE, || callbacks.update_seqs().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(callbacks.update_seqs(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn item_closure_travels_with_each_message() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    let closure: ItemClosure = Arc::new(String::from("row 7"));
    subscription.set_item_closure(Some(closure));
    activate_and_settle(&fixture, &subscription).await;

    fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || callbacks.msg_count(MsgType::Update) == 1).await);

    assert!(callbacks.events().iter().all(|event| match event {
        CallbackEvent::Msg {
            has_item_closure, ..
        } => *has_item_closure,
        _ => true,
    }));
    let stored = subscription.item_closure().expect("closure kept");
    assert_eq!(stored.downcast_ref::<String>().map(String::as_str), Some("row 7"));
}

#[tokio::test(start_paused = true)]
async fn wildcard_subscription_sees_every_symbol_on_the_source() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = Subscription::allocate();
    subscription
        .setup_wildcard(BasicSetup::new(fixture.env.clone(), callbacks.clone()).with_source(SOURCE))
        .expect("wildcard setup");
    assert!(subscription.has_wildcards());

    subscription.activate().expect("activate");
    assert!(wait_for_state(&subscription, SubscriptionState::Activated).await);

    fixture
        .bridge
        .publish(SOURCE, "MSFT", Message::new(MsgType::Update));
    fixture
        .bridge
        .publish(SOURCE, "IBM", Message::new(MsgType::Update));
    fixture
        .bridge
        .publish("NYSE", "MSFT", Message::new(MsgType::Update));
    assert!(wait_until(SETTLE, || {
        callbacks.count(|event| matches!(event, CallbackEvent::WildcardMsg { .. })) == 2
    })
    .await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let topics: Vec<String> = callbacks
        .events()
        .into_iter()
        .filter_map(|event| match event {
            CallbackEvent::WildcardMsg { topic, .. } => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(topics, vec!["MSFT".to_string(), "IBM".to_string()]);
    assert_eq!(subscription.subject_context_count(), 2);
    assert_eq!(fixture.bridge.stats().wildcard_creates, 1);
    assert_eq!(fixture.bridge.stats().inbox_sends, 0);
}

#[tokio::test(start_paused = true)]
async fn basic_subscription_activates_without_the_throttle() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = Subscription::allocate();
    subscription
        .setup_basic(BasicSetup::new(fixture.env.clone(), callbacks.clone()).with_symbol("RAW.FEED"))
        .expect("basic setup");

    subscription.activate().expect("activate");
    assert_eq!(subscription.state(), SubscriptionState::Activated);
    assert_eq!(callbacks.create_count(), 1);

    // No sequence checking: the repeat is delivered too.
    fixture.bridge.publish_topic("RAW.FEED", update(5));
    fixture.bridge.publish_topic("RAW.FEED", update(5));
    assert!(wait_until(SETTLE, || callbacks.msg_count(MsgType::Update) == 2).await);

    assert_eq!(
        subscription.request_recap().expect_err("basic").code(),
        StatusCode::InvalidType
    );
    assert_eq!(fixture.bridge.stats().publishers, 0);
}

#[tokio::test(start_paused = true)]
async fn destroy_from_inside_on_msg_stops_delivery() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::destroying_on_msg());
    let subscription = fixture.subscription(callbacks.clone());

    subscription.activate().expect("activate");
    assert!(wait_for_state(&subscription, SubscriptionState::Destroyed).await);

    let routed = fixture
        .bridge
        .publish(SOURCE, SYMBOL, Message::new(MsgType::Update));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(routed, 0);
    assert_eq!(callbacks.msg_count(MsgType::Initial), 1);
    assert_eq!(callbacks.msg_count(MsgType::Update), 0);
    assert_eq!(callbacks.events().last(), Some(&CallbackEvent::Destroy));
    assert_eq!(fixture.bridge.stats().live_subscriptions, 0);
    assert_eq!(fixture.queue.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn platform_error_with_deactivate_tears_down_first() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());
    activate_and_settle(&fixture, &subscription).await;

    let reached = fixture.bridge.raise_platform_error(
        SOURCE,
        SYMBOL,
        PlatformError::new(42, "session lost"),
        true,
    );
    assert_eq!(reached, 1);
    assert_eq!(callbacks.error_count(StatusCode::Platform), 1);
    assert!(wait_for_state(&subscription, SubscriptionState::Deactivated).await);

    assert_eq!(subscription.platform_error().map(|error| error.code), Some(42));
    assert_eq!(fixture.bridge.stats().live_subscriptions, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_bridge_create_reports_platform_error() {
    let fixture = Fixture::new();
    fixture
        .bridge
        .set_fail_creates(Some(PlatformError::new(7, "no session")));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscription = fixture.subscription(callbacks.clone());

    subscription.activate().expect("activate is queued");
    assert!(wait_until(SETTLE, || callbacks.error_count(StatusCode::Platform) == 1).await);

    assert_eq!(subscription.state(), SubscriptionState::Deactivated);
    assert_eq!(subscription.platform_error().map(|error| error.code), Some(7));
    assert_eq!(callbacks.create_count(), 0);
    assert_eq!(fixture.queue.object_count(), 0);

    fixture.bridge.set_fail_creates(None);
    activate_and_settle(&fixture, &subscription).await;
    assert_eq!(callbacks.create_count(), 1);
}
