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

use crate::entitlements::LoopbackEntitlements;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use subscription_core::bridge::{
    Bridge, BridgeListener, BridgeSubscription, Entitlements, Publisher, SubscriptionRequest,
    Transport,
};
use subscription_core::{
    EndpointPool, Inbox, Message, MsgType, PlatformError, Status, StatusCode,
};
use tokio::runtime::Handle;
use tracing::{debug, trace};

const COMPONENT: &str = "loopback_bridge";

/// Pool key wildcard subscriptions without a source register under.
const ANY_SOURCE: &str = "*";

fn wildcard_key(source: &str) -> String {
    format!("{source}.*")
}

/// One low-level subscription as registered in the fan-out pool.
struct LoopbackEndpoint {
    subscription_id: u64,
    listener: Arc<dyn BridgeListener>,
    muted: AtomicBool,
    wildcard: bool,
}

/// A message a publisher handed to the loopback bridge.
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub topic: String,
    pub msg: Message,
    /// Sent as a request with a reply inbox.
    pub with_inbox: bool,
}

/// Counter snapshot returned by [`LoopbackBridge::stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoopbackStats {
    pub creates: u64,
    pub wildcard_creates: u64,
    pub destroys: u64,
    pub live_subscriptions: u64,
    pub publishers: u64,
    pub sends: u64,
    pub inbox_sends: u64,
    pub replies_delivered: u64,
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    wildcard_creates: AtomicU64,
    destroys: AtomicU64,
    publishers: AtomicU64,
    sends: AtomicU64,
    inbox_sends: AtomicU64,
    replies_delivered: AtomicU64,
}

struct Shared {
    name: String,
    handle: Handle,
    pool: EndpointPool<LoopbackEndpoint>,
    entitlements: Arc<LoopbackEntitlements>,
    counters: Counters,
    image_replies: AtomicBool,
    images_per_request: AtomicU32,
    auto_ack_destroy: AtomicBool,
    fail_destroys: AtomicBool,
    fail_creates: Mutex<Option<PlatformError>>,
    inline_replies: AtomicBool,
    error_during_create: Mutex<Option<(PlatformError, bool)>>,
    pending_acks: Mutex<Vec<Arc<dyn BridgeListener>>>,
    sequences: Mutex<HashMap<String, u64>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl Shared {
    fn current_seq(&self, topic: &str) -> u64 {
        self.sequences.lock().get(topic).copied().unwrap_or(0)
    }

    fn next_seq(&self, topic: &str) -> u64 {
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(topic.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Keeps explicitly numbered messages visible to later image replies.
    fn observe_seq(&self, topic: &str, seq: u64) {
        let mut sequences = self.sequences.lock();
        let current = sequences.entry(topic.to_string()).or_insert(0);
        *current = (*current).max(seq);
    }

    fn record(&self, topic: &str, msg: &Message, with_inbox: bool) {
        self.sent.lock().push(SentMessage {
            topic: topic.to_string(),
            msg: msg.clone(),
            with_inbox,
        });
    }

    fn create(
        self: &Arc<Self>,
        request: &SubscriptionRequest,
        listener: Arc<dyn BridgeListener>,
        wildcard: bool,
    ) -> Result<Box<dyn BridgeSubscription>, Status> {
        if let Some(error) = self.fail_creates.lock().clone() {
            return Err(Status::platform(error));
        }
        let topic = if wildcard {
            request
                .source
                .as_deref()
                .map_or_else(|| ANY_SOURCE.to_string(), wildcard_key)
        } else {
            request.topic()
        };
        let endpoint = Arc::new(LoopbackEndpoint {
            subscription_id: request.subscription_id,
            listener,
            muted: AtomicBool::new(false),
            wildcard,
        });
        let identifier = self
            .pool
            .register_without_identifier(&topic, Arc::clone(&endpoint))?;

        let raised = self.error_during_create.lock().clone();
        if let Some((error, deactivate)) = raised {
            endpoint
                .listener
                .on_platform_error(Status::platform(error), deactivate);
        }

        if wildcard {
            self.counters.wildcard_creates.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.creates.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            component = COMPONENT,
            bridge = %self.name,
            subscription_id = request.subscription_id,
            topic = %topic,
            wildcard,
            "bridge subscription created"
        );
        Ok(Box::new(LoopbackSubscription {
            shared: Arc::clone(self),
            topic,
            identifier,
            endpoint,
        }))
    }

    /// Hands `msg` to every unmuted endpoint still registered under `key`.
    fn fan_out(self: &Arc<Self>, key: &str, topic: &str, msg: &Message) -> usize {
        let endpoints = self.pool.get_registered(key);
        let targeted = endpoints.len();
        if targeted == 0 {
            return 0;
        }
        let shared = Arc::clone(self);
        let key = key.to_string();
        let topic = topic.to_string();
        let msg = msg.clone();
        self.handle.spawn(async move {
            for endpoint in endpoints.iter() {
                // Unregistered while this delivery was in flight.
                if !shared.pool.is_registered_by_content(&key, endpoint) {
                    continue;
                }
                if endpoint.muted.load(Ordering::SeqCst) {
                    continue;
                }
                if endpoint.wildcard {
                    endpoint.listener.on_wildcard_message(msg.clone(), &topic);
                } else {
                    endpoint.listener.on_message(msg.clone());
                }
            }
        });
        targeted
    }

    fn answer_image_request(self: &Arc<Self>, topic: &str, inbox: &Inbox, request: &Message) {
        if !self.image_replies.load(Ordering::SeqCst) {
            trace!(
                component = COMPONENT,
                bridge = %self.name,
                topic,
                "image replies disabled, request left unanswered"
            );
            return;
        }
        let reply_type = match request.msg_type() {
            MsgType::RecapRequest => MsgType::Recap,
            _ => MsgType::Initial,
        };
        let mut reply = Message::new(reply_type).with_seq_num(self.current_seq(topic));
        if let Some(source) = request.source() {
            reply = reply.with_source(source);
        }
        if let Some(symbol) = request.issue_symbol() {
            reply = reply.with_issue_symbol(symbol);
        }
        let images = self.images_per_request.load(Ordering::SeqCst);
        if self.inline_replies.load(Ordering::SeqCst) {
            self.deliver_images(inbox, &reply, images);
            return;
        }
        let shared = Arc::clone(self);
        let inbox = inbox.clone();
        self.handle.spawn(async move {
            shared.deliver_images(&inbox, &reply, images);
        });
    }

    fn deliver_images(&self, inbox: &Inbox, reply: &Message, images: u32) {
        for _ in 0..images {
            if inbox.deliver(reply.clone()) {
                self.counters
                    .replies_delivered
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

struct LoopbackSubscription {
    shared: Arc<Shared>,
    topic: String,
    identifier: String,
    endpoint: Arc<LoopbackEndpoint>,
}

impl BridgeSubscription for LoopbackSubscription {
    fn mute(&mut self) {
        self.endpoint.muted.store(true, Ordering::SeqCst);
    }

    fn destroy(self: Box<Self>) -> Result<(), Status> {
        self.shared.pool.unregister(&self.topic, &self.identifier);
        self.shared.counters.destroys.fetch_add(1, Ordering::SeqCst);
        debug!(
            component = COMPONENT,
            bridge = %self.shared.name,
            subscription_id = self.endpoint.subscription_id,
            topic = %self.topic,
            "bridge subscription destroyed"
        );

        if self.shared.fail_destroys.load(Ordering::SeqCst) {
            return Err(Status::platform(PlatformError::new(
                -1,
                "loopback destroy failure",
            )));
        }

        let listener = Arc::clone(&self.endpoint.listener);
        if self.shared.auto_ack_destroy.load(Ordering::SeqCst) {
            self.shared.handle.spawn(async move { listener.on_destroyed() });
        } else {
            self.shared.pending_acks.lock().push(listener);
        }
        Ok(())
    }

    fn has_wildcards(&self) -> bool {
        self.endpoint.wildcard
    }

    fn is_valid(&self) -> bool {
        self.shared
            .pool
            .is_registered_by_content(&self.topic, &self.endpoint)
    }
}

struct LoopbackPublisher {
    shared: Arc<Shared>,
    topic: String,
}

impl Publisher for LoopbackPublisher {
    fn send(&self, msg: &Message) -> Result<(), Status> {
        self.shared.counters.sends.fetch_add(1, Ordering::SeqCst);
        self.shared.record(&self.topic, msg, false);
        Ok(())
    }

    fn send_from_inbox(&self, inbox: &Inbox, msg: &Message) -> Result<(), Status> {
        self.shared.counters.inbox_sends.fetch_add(1, Ordering::SeqCst);
        self.shared.record(&self.topic, msg, true);
        self.shared.answer_image_request(&self.topic, inbox, msg);
        Ok(())
    }

    fn send_reply_to_inbox(&self, _request: &Message, reply: &Message) -> Result<(), Status> {
        self.shared.counters.sends.fetch_add(1, Ordering::SeqCst);
        self.shared.record(&self.topic, reply, false);
        Ok(())
    }
}

/// The bridge itself: creates subscriptions and publishers, and lets a test
/// play the part of the remote side.
///
/// Defaults: image requests are answered with one image, destroys are
/// acknowledged asynchronously, entitlements are local and allow everything.
#[derive(Clone)]
pub struct LoopbackBridge {
    shared: Arc<Shared>,
}

impl LoopbackBridge {
    pub fn new(name: &str, handle: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                handle,
                pool: EndpointPool::new(name),
                entitlements: Arc::new(LoopbackEntitlements::new()),
                counters: Counters::default(),
                image_replies: AtomicBool::new(true),
                images_per_request: AtomicU32::new(1),
                auto_ack_destroy: AtomicBool::new(true),
                fail_destroys: AtomicBool::new(false),
                fail_creates: Mutex::new(None),
                inline_replies: AtomicBool::new(false),
                error_during_create: Mutex::new(None),
                pending_acks: Mutex::new(Vec::new()),
                sequences: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Builds on the ambient tokio runtime.
    pub fn current(name: &str) -> Result<Self, Status> {
        let handle = Handle::try_current().map_err(|err| {
            Status::fail_with_code(
                StatusCode::InvalidState,
                format!("loopback bridge needs a tokio runtime: {err}"),
            )
        })?;
        Ok(Self::new(name, handle))
    }

    pub fn loopback_entitlements(&self) -> Arc<LoopbackEntitlements> {
        Arc::clone(&self.shared.entitlements)
    }

    /// When disabled, image requests are recorded but never answered.
    pub fn set_image_replies(&self, enabled: bool) {
        self.shared.image_replies.store(enabled, Ordering::SeqCst);
    }

    pub fn set_images_per_request(&self, images: u32) {
        self.shared.images_per_request.store(images, Ordering::SeqCst);
    }

    /// When disabled, destroys wait for [`LoopbackBridge::ack_pending_destroys`].
    pub fn set_auto_ack_destroy(&self, enabled: bool) {
        self.shared.auto_ack_destroy.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_destroys(&self, fail: bool) {
        self.shared.fail_destroys.store(fail, Ordering::SeqCst);
    }

    /// Makes every create fail with `error` until cleared with `None`.
    pub fn set_fail_creates(&self, error: Option<PlatformError>) {
        *self.shared.fail_creates.lock() = error;
    }

    /// Answers image requests on the sending thread instead of the runtime.
    pub fn set_inline_replies(&self, enabled: bool) {
        self.shared.inline_replies.store(enabled, Ordering::SeqCst);
    }

    /// Reports `error` to the new subscription's listener from inside every
    /// create, before the create returns successfully.
    pub fn set_error_during_create(&self, error: Option<PlatformError>, deactivate: bool) {
        *self.shared.error_during_create.lock() = error.map(|error| (error, deactivate));
    }

    pub fn pending_destroy_count(&self) -> usize {
        self.shared.pending_acks.lock().len()
    }

    /// Acknowledges every held destroy on the caller's thread.
    pub fn ack_pending_destroys(&self) -> usize {
        let pending = std::mem::take(&mut *self.shared.pending_acks.lock());
        let acknowledged = pending.len();
        for listener in pending {
            listener.on_destroyed();
        }
        acknowledged
    }

    /// Publishes `msg` on `source.symbol` as the remote side would.
    ///
    /// Missing source, symbol and sequence number are filled in. Wildcard
    /// subscriptions on `source` and transport-wide ones also receive it.
    /// Returns how many low-level subscriptions the message was routed to.
    pub fn publish(&self, source: &str, symbol: &str, msg: Message) -> usize {
        let topic = format!("{source}.{symbol}");
        let mut msg = msg;
        if msg.source().is_none() {
            msg = msg.with_source(source);
        }
        if msg.issue_symbol().is_none() {
            msg = msg.with_issue_symbol(symbol);
        }
        match msg.seq_num() {
            Some(seq) => self.shared.observe_seq(&topic, seq),
            None => msg = msg.with_seq_num(self.shared.next_seq(&topic)),
        }

        self.shared.fan_out(&topic, symbol, &msg)
            + self.shared.fan_out(&wildcard_key(source), symbol, &msg)
            + self.shared.fan_out(ANY_SOURCE, &topic, &msg)
    }

    /// Publishes on a plain topic, as basic subscriptions see it.
    pub fn publish_topic(&self, topic: &str, msg: Message) -> usize {
        let msg = match msg.seq_num() {
            Some(_) => msg,
            None => msg.with_seq_num(self.shared.next_seq(topic)),
        };
        self.shared.fan_out(topic, topic, &msg)
    }

    /// Reports a platform error to every subscription on `source.symbol`.
    pub fn raise_platform_error(
        &self,
        source: &str,
        symbol: &str,
        error: PlatformError,
        deactivate: bool,
    ) -> usize {
        let endpoints = self.shared.pool.get_registered(&format!("{source}.{symbol}"));
        for endpoint in endpoints.iter() {
            endpoint
                .listener
                .on_platform_error(Status::platform(error.clone()), deactivate);
        }
        endpoints.len()
    }

    pub fn stats(&self) -> LoopbackStats {
        let counters = &self.shared.counters;
        let creates = counters.creates.load(Ordering::SeqCst);
        let wildcard_creates = counters.wildcard_creates.load(Ordering::SeqCst);
        let destroys = counters.destroys.load(Ordering::SeqCst);
        LoopbackStats {
            creates,
            wildcard_creates,
            destroys,
            live_subscriptions: (creates + wildcard_creates).saturating_sub(destroys),
            publishers: counters.publishers.load(Ordering::SeqCst),
            sends: counters.sends.load(Ordering::SeqCst),
            inbox_sends: counters.inbox_sends.load(Ordering::SeqCst),
            replies_delivered: counters.replies_delivered.load(Ordering::SeqCst),
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.shared.sent.lock().clone()
    }

    pub fn sent_count(&self, msg_type: MsgType) -> usize {
        self.shared
            .sent
            .lock()
            .iter()
            .filter(|sent| sent.msg.msg_type() == msg_type)
            .count()
    }
}

impl Bridge for LoopbackBridge {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn create_subscription(
        &self,
        request: &SubscriptionRequest,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<Box<dyn BridgeSubscription>, Status> {
        self.shared.create(request, listener, false)
    }

    fn create_wildcard_subscription(
        &self,
        request: &SubscriptionRequest,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<Box<dyn BridgeSubscription>, Status> {
        self.shared.create(request, listener, true)
    }

    fn create_publisher(
        &self,
        _transport: &Arc<dyn Transport>,
        topic: &str,
        source: Option<&str>,
        _root: Option<&str>,
    ) -> Result<Arc<dyn Publisher>, Status> {
        self.shared.counters.publishers.fetch_add(1, Ordering::SeqCst);
        let topic = match source {
            Some(source) => format!("{source}.{topic}"),
            None => topic.to_string(),
        };
        Ok(Arc::new(LoopbackPublisher {
            shared: Arc::clone(&self.shared),
            topic,
        }))
    }

    fn entitlements(&self) -> Option<Arc<dyn Entitlements>> {
        Some(Arc::clone(&self.shared.entitlements) as Arc<dyn Entitlements>)
    }
}

#[cfg(test)]
mod tests {
    use super::LoopbackBridge;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use subscription_core::bridge::{Bridge, BridgeListener, SubscriptionRequest};
    use subscription_core::{Message, MsgType, Status};

    #[derive(Default)]
    struct CountingListener {
        messages: Mutex<Vec<Message>>,
        destroyed: AtomicU32,
    }

    impl BridgeListener for CountingListener {
        fn on_message(&self, msg: Message) {
            self.messages.lock().push(msg);
        }

        fn on_wildcard_message(&self, msg: Message, _topic: &str) {
            self.messages.lock().push(msg);
        }

        fn on_platform_error(&self, _status: Status, _deactivate: bool) {}

        fn on_destroyed(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(symbol: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            subscription_id: 7,
            source: Some("NASDAQ".to_string()),
            symbol: Some(symbol.to_string()),
            root: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriptions_only() {
        let bridge = LoopbackBridge::current("loop").expect("runtime");
        let msft = Arc::new(CountingListener::default());
        let ibm = Arc::new(CountingListener::default());
        let _msft_sub = bridge
            .create_subscription(&request("MSFT"), msft.clone())
            .expect("create");
        let _ibm_sub = bridge
            .create_subscription(&request("IBM"), ibm.clone())
            .expect("create");

        assert_eq!(bridge.publish("NASDAQ", "MSFT", Message::new(MsgType::Update)), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivered = msft.messages.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].seq_num(), Some(1));
        assert!(ibm.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn muted_or_destroyed_subscriptions_receive_nothing() {
        let bridge = LoopbackBridge::current("loop").expect("runtime");
        bridge.set_auto_ack_destroy(false);
        let listener = Arc::new(CountingListener::default());
        let mut subscription = bridge
            .create_subscription(&request("MSFT"), listener.clone())
            .expect("create");
        assert!(subscription.is_valid());

        subscription.mute();
        bridge.publish("NASDAQ", "MSFT", Message::new(MsgType::Update));
        subscription.destroy().expect("destroy");
        bridge.publish("NASDAQ", "MSFT", Message::new(MsgType::Update));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(listener.messages.lock().is_empty());
        assert_eq!(bridge.pending_destroy_count(), 1);
        assert_eq!(listener.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.ack_pending_destroys(), 1);
        assert_eq!(listener.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.stats().live_subscriptions, 0);
    }
}
