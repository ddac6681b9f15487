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
use subscription_core::config::{CoreConfig, ThrottleConfig};
use subscription_core::SubscriptionState;
use support::{Fixture, SETTLE};

const SYMBOLS: [&str; 6] = ["MSFT", "IBM", "AAPL", "ORCL", "INTC", "CSCO"];

#[tokio::test(start_paused = true)]
async fn creates_are_paced_by_the_default_throttle() {
    let config = CoreConfig {
        default_throttle: ThrottleConfig {
            rate: 20.0,
            interval_ms: 100,
        },
        ..CoreConfig::default()
    };
    let fixture = Fixture::with_config(&config);
    assert_eq!(fixture.env.default_throttle.per_interval_quota(), 2);

    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscriptions: Vec<_> = SYMBOLS
        .iter()
        .map(|symbol| fixture.subscription_for(symbol, callbacks.clone()))
        .collect();
    for subscription in &subscriptions {
        subscription.activate().expect("activate");
    }
    assert_eq!(fixture.env.default_throttle.queue_len(), SYMBOLS.len());
    assert_eq!(fixture.bridge.stats().creates, 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fixture.bridge.stats().creates, 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.bridge.stats().creates, 6);

    assert!(wait_until(SETTLE, || callbacks.create_count() == SYMBOLS.len()).await);
    assert!(subscriptions
        .iter()
        .all(|subscription| subscription.state() == SubscriptionState::Activated));
    assert!(wait_until(SETTLE, || !fixture.env.default_throttle.is_timer_running()).await);
}

#[tokio::test(start_paused = true)]
async fn disabled_throttle_creates_on_the_calling_thread() {
    let config = CoreConfig {
        default_throttle: ThrottleConfig::disabled(),
        ..CoreConfig::default()
    };
    let fixture = Fixture::with_config(&config);
    let callbacks = Arc::new(RecordingCallbacks::new());

    for symbol in SYMBOLS {
        let subscription = fixture.subscription_for(symbol, callbacks.clone());
        subscription.activate().expect("activate");
        assert_eq!(subscription.state(), SubscriptionState::Activated);
    }

    assert_eq!(fixture.bridge.stats().creates, SYMBOLS.len() as u64);
    assert_eq!(fixture.queue.object_count(), SYMBOLS.len() as i64);
    assert!(!fixture.env.default_throttle.is_timer_running());
}

#[tokio::test(start_paused = true)]
async fn deactivating_queued_subscriptions_empties_the_throttle() {
    let fixture = Fixture::new();
    let callbacks = Arc::new(RecordingCallbacks::new());
    let subscriptions: Vec<_> = SYMBOLS
        .iter()
        .map(|symbol| fixture.subscription_for(symbol, callbacks.clone()))
        .collect();
    for subscription in &subscriptions {
        subscription.activate().expect("activate");
    }
    for subscription in &subscriptions {
        subscription.deactivate().expect("deactivate");
    }

    assert_eq!(fixture.env.default_throttle.queue_len(), 0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.bridge.stats().creates, 0);
    assert_eq!(callbacks.create_count(), 0);
}
