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

use super::types::Quality;
use super::Subscription;
use crate::message::Message;
use crate::status::Status;
use std::any::Any;
use std::sync::Arc;

/// Per-topic application state handed back with every message for that topic.
pub type ItemClosure = Arc<dyn Any + Send + Sync>;

/// Application callbacks for one subscription.
///
/// Callbacks run on the bridge's dispatch thread, the throttle's timer
/// thread, or the calling thread for synchronous completions. The core never
/// holds its own locks while invoking them, so they may call back into the
/// subscription, including `destroy`.
pub trait SubscriptionCallbacks: Send + Sync {
    fn on_create(&self, _subscription: &Subscription) {}

    /// `subject` is the user symbol the error relates to, when known.
    fn on_error(&self, _subscription: &Subscription, _status: &Status, _subject: Option<&str>) {}

    fn on_msg(&self, subscription: &Subscription, msg: &Message, item_closure: Option<&ItemClosure>);

    fn on_wildcard_msg(
        &self,
        subscription: &Subscription,
        msg: &Message,
        _topic: &str,
        item_closure: Option<&ItemClosure>,
    ) {
        self.on_msg(subscription, msg, item_closure);
    }

    fn on_quality(&self, _subscription: &Subscription, _quality: Quality, _symbol: Option<&str>) {}

    /// A sequence gap was detected on `symbol`.
    fn on_gap(&self, _subscription: &Subscription, _symbol: Option<&str>) {}

    fn on_recap_request(&self, _subscription: &Subscription, _symbol: Option<&str>) {}

    /// The subscription reached DESTROYED or DEALLOCATED.
    fn on_destroy(&self, _subscription: &Subscription) {}
}
