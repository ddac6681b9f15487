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

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use subscription_core::{
    ItemClosure, Message, MsgType, Quality, Status, StatusCode, Subscription,
    SubscriptionCallbacks,
};
use tracing::debug;

/// One callback invocation, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum CallbackEvent {
    Create,
    Error {
        code: StatusCode,
        subject: Option<String>,
    },
    Msg {
        msg_type: MsgType,
        symbol: Option<String>,
        seq_num: Option<u64>,
        has_item_closure: bool,
    },
    WildcardMsg {
        topic: String,
        msg_type: MsgType,
    },
    Quality {
        quality: Quality,
        symbol: Option<String>,
    },
    Gap {
        symbol: Option<String>,
    },
    RecapRequest {
        symbol: Option<String>,
    },
    Destroy,
}

/// Records every callback so tests can assert on order and counts.
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
    destroy_on_msg: AtomicBool,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroys the subscription from inside the first `on_msg`.
    pub fn destroying_on_msg() -> Self {
        Self {
            destroy_on_msg: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    pub fn count<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&CallbackEvent) -> bool,
    {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }

    pub fn create_count(&self) -> usize {
        self.count(|event| matches!(event, CallbackEvent::Create))
    }

    pub fn destroy_count(&self) -> usize {
        self.count(|event| matches!(event, CallbackEvent::Destroy))
    }

    pub fn error_count(&self, code: StatusCode) -> usize {
        self.count(|event| matches!(event, CallbackEvent::Error { code: c, .. } if *c == code))
    }

    pub fn msg_count(&self, msg_type: MsgType) -> usize {
        self.count(|event| {
            matches!(event, CallbackEvent::Msg { msg_type: t, .. } if *t == msg_type)
        })
    }

    /// Sequence numbers of delivered updates, in delivery order.
    pub fn update_seqs(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallbackEvent::Msg {
                    msg_type: MsgType::Update,
                    seq_num,
                    ..
                } => *seq_num,
                _ => None,
            })
            .collect()
    }

    pub fn qualities(&self) -> Vec<Quality> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallbackEvent::Quality { quality, .. } => Some(*quality),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: CallbackEvent) {
        debug!(?event, "subscription callback");
        self.events.lock().push(event);
    }
}

impl SubscriptionCallbacks for RecordingCallbacks {
    fn on_create(&self, _subscription: &Subscription) {
        self.push(CallbackEvent::Create);
    }

    fn on_error(&self, _subscription: &Subscription, status: &Status, subject: Option<&str>) {
        self.push(CallbackEvent::Error {
            code: status.code(),
            subject: subject.map(str::to_string),
        });
    }

    fn on_msg(&self, subscription: &Subscription, msg: &Message, item_closure: Option<&ItemClosure>) {
        self.push(CallbackEvent::Msg {
            msg_type: msg.msg_type(),
            symbol: msg.issue_symbol().map(str::to_string),
            seq_num: msg.seq_num(),
            has_item_closure: item_closure.is_some(),
        });
        if self.destroy_on_msg.swap(false, Ordering::SeqCst) {
            if let Err(err) = subscription.destroy() {
                debug!(err = %err, "destroy from on_msg failed");
            }
        }
    }

    fn on_wildcard_msg(
        &self,
        _subscription: &Subscription,
        msg: &Message,
        topic: &str,
        _item_closure: Option<&ItemClosure>,
    ) {
        self.push(CallbackEvent::WildcardMsg {
            topic: topic.to_string(),
            msg_type: msg.msg_type(),
        });
    }

    fn on_quality(&self, _subscription: &Subscription, quality: Quality, symbol: Option<&str>) {
        self.push(CallbackEvent::Quality {
            quality,
            symbol: symbol.map(str::to_string),
        });
    }

    fn on_gap(&self, _subscription: &Subscription, symbol: Option<&str>) {
        self.push(CallbackEvent::Gap {
            symbol: symbol.map(str::to_string),
        });
    }

    fn on_recap_request(&self, _subscription: &Subscription, symbol: Option<&str>) {
        self.push(CallbackEvent::RecapRequest {
            symbol: symbol.map(str::to_string),
        });
    }

    fn on_destroy(&self, _subscription: &Subscription) {
        self.push(CallbackEvent::Destroy);
    }
}
