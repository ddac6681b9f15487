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

//! Capability traits a middleware bridge implements for the subscription core.
//!
//! The core never talks to a transport directly. It creates low-level
//! subscriptions and publishers through [`Bridge`], hands work to the
//! application's [`Queue`], registers refresh listeners with the [`Transport`]
//! and, unless the bridge defers them, runs entitlement checks through
//! [`Entitlements`].
//!
//! The core releases its subscription lock before creating or destroying a
//! low-level subscription and before sending through a [`Publisher`], so
//! [`BridgeListener`] callbacks and [`Inbox`] replies may be delivered on the
//! calling thread from inside those calls.

use crate::image_request::Inbox;
use crate::message::Message;
use crate::status::Status;
use std::sync::Arc;

/// Identity handed to the bridge when a low-level subscription is created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionRequest {
    /// Process-unique id of the owning subscription.
    pub subscription_id: u64,
    pub source: Option<String>,
    /// Wire symbol after symbol-list mapping. `None` for transport-wide wildcards.
    pub symbol: Option<String>,
    pub root: Option<String>,
}

impl SubscriptionRequest {
    /// `source.symbol`, or whichever half is present.
    pub fn topic(&self) -> String {
        match (&self.source, &self.symbol) {
            (Some(source), Some(symbol)) => format!("{source}.{symbol}"),
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Callbacks the core registers with every low-level subscription.
pub trait BridgeListener: Send + Sync {
    fn on_message(&self, msg: Message);

    fn on_wildcard_message(&self, msg: Message, topic: &str);

    /// Reports a transport failure. `deactivate` asks the core to tear down.
    fn on_platform_error(&self, status: Status, deactivate: bool);

    /// Acknowledges a completed `BridgeSubscription::destroy`.
    fn on_destroyed(&self);
}

/// A live low-level subscription owned by exactly one core subscription.
pub trait BridgeSubscription: Send {
    /// Stops message delivery without releasing the subscription.
    fn mute(&mut self);

    /// Starts an asynchronous destroy, acknowledged through `on_destroyed`.
    fn destroy(self: Box<Self>) -> Result<(), Status>;

    fn has_wildcards(&self) -> bool;

    fn is_valid(&self) -> bool;
}

pub trait Publisher: Send + Sync {
    fn send(&self, msg: &Message) -> Result<(), Status>;

    /// Sends a request whose replies must be routed to `inbox`.
    fn send_from_inbox(&self, inbox: &Inbox, msg: &Message) -> Result<(), Status>;

    fn send_reply_to_inbox(&self, request: &Message, reply: &Message) -> Result<(), Status>;
}

/// Event queue the application dispatches subscription callbacks from.
pub trait Queue: Send + Sync {
    fn enqueue_event(&self, event: Box<dyn FnOnce() + Send>) -> Result<(), Status>;

    /// Tracks a live subscription so the queue can wait for it before shutdown.
    fn increment_object_count(&self);

    fn decrement_object_count(&self);
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Registers a subscription for transport-wide refresh handling.
    fn add_subscription_listener(&self, subscription_id: u64);

    fn remove_subscription_listener(&self, subscription_id: u64);

    /// Group size hint applied when a subscription does not set one.
    fn group_size_hint(&self) -> u32 {
        0
    }

    /// Maps a user symbol to its wire form.
    fn map_symbol(&self, symbol: &str) -> String {
        symbol.to_string()
    }
}

/// Opaque per-subject entitlement context issued by [`Entitlements`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntitlementHandle(pub u64);

pub trait Entitlements: Send + Sync {
    /// When `true` the core skips every local `is_allowed` check.
    fn are_entitlements_deferred(&self) -> bool;

    fn is_allowed(&self, handle: EntitlementHandle, subject: &str) -> bool;

    fn create_subscription(&self, subject: &str) -> Result<EntitlementHandle, Status>;

    fn destroy_subscription(&self, handle: EntitlementHandle);
}

pub trait Bridge: Send + Sync {
    fn name(&self) -> &str;

    fn create_subscription(
        &self,
        request: &SubscriptionRequest,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<Box<dyn BridgeSubscription>, Status>;

    fn create_wildcard_subscription(
        &self,
        request: &SubscriptionRequest,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<Box<dyn BridgeSubscription>, Status>;

    fn create_publisher(
        &self,
        transport: &Arc<dyn Transport>,
        topic: &str,
        source: Option<&str>,
        root: Option<&str>,
    ) -> Result<Arc<dyn Publisher>, Status>;

    /// `None` when the bridge has no entitlement capability at all.
    fn entitlements(&self) -> Option<Arc<dyn Entitlements>>;
}

#[cfg(test)]
mod tests {
    use super::SubscriptionRequest;

    #[test]
    fn topic_joins_source_and_symbol() {
        let mut request = SubscriptionRequest {
            subscription_id: 1,
            source: Some("NASDAQ".to_string()),
            symbol: Some("MSFT".to_string()),
            root: None,
        };
        assert_eq!(request.topic(), "NASDAQ.MSFT");

        request.symbol = None;
        assert_eq!(request.topic(), "NASDAQ");
    }
}
