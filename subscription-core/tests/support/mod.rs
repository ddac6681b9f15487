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

#![allow(dead_code)]

use integration_test_utils::{wait_until, RecordingCallbacks};
use loopback_bridge::{LoopbackBridge, LoopbackQueue, LoopbackTransport};
use std::sync::Arc;
use std::time::Duration;
use subscription_core::config::CoreConfig;
use subscription_core::{
    Subscription, SubscriptionCallbacks, SubscriptionEnv, SubscriptionSetup, SubscriptionState,
    TimerRuntime,
};
use tokio::runtime::Handle;

pub(crate) const SOURCE: &str = "NASDAQ";
pub(crate) const SYMBOL: &str = "MSFT";
pub(crate) const TOPIC: &str = "NASDAQ.MSFT";

/// Long enough for several throttle ticks and image timeouts under paused time.
pub(crate) const SETTLE: Duration = Duration::from_secs(30);

pub(crate) struct Fixture {
    pub(crate) bridge: LoopbackBridge,
    pub(crate) transport: Arc<LoopbackTransport>,
    pub(crate) queue: Arc<LoopbackQueue>,
    pub(crate) env: SubscriptionEnv,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_config(&CoreConfig::default())
    }

    pub(crate) fn with_config(config: &CoreConfig) -> Self {
        integration_test_utils::init_logging();

        let handle = Handle::current();
        let bridge = LoopbackBridge::new("loopback", handle.clone());
        let transport = Arc::new(LoopbackTransport::new("loop-tport"));
        let queue = Arc::new(LoopbackQueue::new(handle));
        let runtime = TimerRuntime::current().expect("tokio test runtime");
        let env = SubscriptionEnv::new(
            Arc::new(bridge.clone()),
            transport.clone(),
            queue.clone(),
            config,
            runtime,
        );
        Self {
            bridge,
            transport,
            queue,
            env,
        }
    }

    /// A real-time subscription to `NASDAQ.MSFT`, set up but not activated.
    pub(crate) fn subscription(&self, callbacks: Arc<RecordingCallbacks>) -> Subscription {
        self.subscription_for(SYMBOL, callbacks)
    }

    pub(crate) fn subscription_for(
        &self,
        symbol: &str,
        callbacks: Arc<RecordingCallbacks>,
    ) -> Subscription {
        let subscription = Subscription::allocate();
        let callbacks: Arc<dyn SubscriptionCallbacks> = callbacks;
        subscription
            .setup(SubscriptionSetup::new(
                self.env.clone(),
                callbacks,
                SOURCE,
                symbol,
            ))
            .expect("setup should succeed");
        subscription
    }
}

pub(crate) async fn wait_for_state(subscription: &Subscription, state: SubscriptionState) -> bool {
    wait_until(SETTLE, || subscription.state() == state).await
}

/// Activates and waits for the bridge subscription and initial image.
pub(crate) async fn activate_and_settle(fixture: &Fixture, subscription: &Subscription) {
    subscription.activate().expect("activate");
    assert!(wait_for_state(subscription, SubscriptionState::Activated).await);
    if subscription.requires_initial() {
        assert!(
            wait_until(SETTLE, || !subscription.is_expecting_initial()).await,
            "initial image never arrived"
        );
    }
    assert!(fixture.bridge.stats().live_subscriptions >= 1);
}
