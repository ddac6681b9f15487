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

//! Point-to-point full-image requests with reply timeout and retry.
//!
//! An [`ImageRequest`] sends one request message through a [`Publisher`],
//! optionally paced by a [`RateThrottle`], and arms a reply timer. Replies come
//! back through the [`Inbox`] the publisher was given. Every request carries a
//! generation; stopping or re-sending bumps it, so late replies and timers
//! from an earlier request are dropped instead of reaching the owner.

use crate::bridge::Publisher;
use crate::message::Message;
use crate::observability::events;
use crate::runtime::TimerRuntime;
use crate::status::Status;
use crate::throttle::{Dispatch, RateThrottle, ThrottleOwner};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const COMPONENT: &str = "image_request";

/// The subscription side of an image request.
///
/// Implementations must not block on locks held across calls into
/// [`ImageRequest`]; the counters below are expected to be atomics.
pub trait ImageRequestOwner: Send + Sync {
    /// Replies are only forwarded while this returns `true`.
    fn accepts_replies(&self) -> bool;

    fn on_image_reply(&self, msg: Message);

    /// Images received since the last reset.
    fn received_images(&self, is_recap: bool) -> u32;

    fn reset_received_images(&self, is_recap: bool);

    /// The reply timer fired after at least one image arrived.
    fn on_request_complete(&self, is_recap: bool);

    /// Every attempt timed out without an image.
    fn on_request_timeout(&self, is_recap: bool);

    fn set_expecting_initial(&self, expecting: bool);
}

/// Reply address handed to the publisher with each request.
#[derive(Clone)]
pub struct Inbox {
    request: Weak<RequestShared>,
    generation: u64,
}

impl Inbox {
    /// Routes a reply to the request that issued this inbox.
    ///
    /// Returns `false` when the request has since been stopped, re-sent or dropped.
    pub fn deliver(&self, msg: Message) -> bool {
        match self.request.upgrade() {
            Some(request) => request.on_reply(self.generation, msg),
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.request
            .upgrade()
            .is_some_and(|request| request.is_current(self.generation))
    }
}

impl Debug for Inbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct RequestState {
    waiting: bool,
    is_recap: bool,
    attempts: u32,
    retried: u32,
    retries: u32,
    timeout: Duration,
    msg: Option<Message>,
    reply_timer: Option<JoinHandle<()>>,
    generation: u64,
    destroyed: bool,
}

struct RequestShared {
    owner: Weak<dyn ImageRequestOwner>,
    symbol: String,
    publisher: Arc<dyn Publisher>,
    throttle: RateThrottle,
    throttle_owner: ThrottleOwner,
    runtime: TimerRuntime,
    state: Mutex<RequestState>,
}

impl RequestShared {
    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.waiting && state.generation == generation
    }

    fn on_reply(&self, generation: u64, msg: Message) -> bool {
        if !self.is_current(generation) {
            trace!(
                event = events::IMAGE_REQUEST_REPLY_DROPPED,
                component = COMPONENT,
                symbol = %self.symbol,
                generation,
                "reply for a stale request dropped"
            );
            return false;
        }
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        if !owner.accepts_replies() {
            return false;
        }
        owner.on_image_reply(msg);
        true
    }

    /// Arms the reply timer if none is running. Caller holds the state lock.
    fn start_reply_timer(self: &Arc<Self>, state: &mut RequestState) {
        if state.reply_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let generation = state.generation;
        let timeout = state.timeout;
        state.reply_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.process_timeout(generation);
            }
        }));
    }

    fn send_now(self: &Arc<Self>, generation: u64) {
        let (inbox, msg) = {
            let mut state = self.state.lock();
            if !state.waiting || state.generation != generation {
                return;
            }
            let Some(msg) = state.msg.clone() else {
                return;
            };
            self.start_reply_timer(&mut state);
            state.attempts += 1;
            (
                Inbox {
                    request: Arc::downgrade(self),
                    generation,
                },
                msg,
            )
        };

        debug!(
            event = events::IMAGE_REQUEST_SEND,
            component = COMPONENT,
            symbol = %self.symbol,
            msg_type = msg.msg_type().as_str(),
            "requesting initial value, dictionary or recap"
        );
        if let Err(err) = self.publisher.send_from_inbox(&inbox, &msg) {
            warn!(
                event = events::IMAGE_REQUEST_SEND_FAILED,
                component = COMPONENT,
                symbol = %self.symbol,
                err = %err,
                "unable to send image request"
            );
        }
    }

    fn schedule(self: &Arc<Self>, generation: u64, immediate: bool) -> Result<(), Status> {
        let weak = Arc::downgrade(self);
        let outcome = self.throttle.dispatch(self.throttle_owner, immediate, move || {
            if let Some(shared) = weak.upgrade() {
                shared.send_now(generation);
            }
        })?;
        if let Dispatch::Queued(_) = outcome {
            trace!(
                component = COMPONENT,
                symbol = %self.symbol,
                throttle = self.throttle.name(),
                "image request queued on throttle"
            );
        }
        Ok(())
    }

    fn process_timeout(self: &Arc<Self>, generation: u64) {
        let is_recap = {
            let mut state = self.state.lock();
            if !state.waiting || state.generation != generation {
                return;
            }
            state.reply_timer = None;
            state.is_recap
        };

        let Some(owner) = self.owner.upgrade() else {
            self.stop();
            return;
        };

        if owner.received_images(is_recap) > 0 {
            self.stop();
            debug!(
                event = events::IMAGE_REQUEST_COMPLETE,
                component = COMPONENT,
                symbol = %self.symbol,
                is_recap,
                "image request complete"
            );
            owner.on_request_complete(is_recap);
            return;
        }

        let retry = {
            let mut state = self.state.lock();
            if !state.waiting || state.generation != generation {
                return;
            }
            if state.retried < state.retries {
                state.retried += 1;
                self.start_reply_timer(&mut state);
                Some(state.retried)
            } else {
                None
            }
        };

        match retry {
            Some(retried) => {
                debug!(
                    event = events::IMAGE_REQUEST_RETRY,
                    component = COMPONENT,
                    symbol = %self.symbol,
                    retried,
                    "retrying image request"
                );
                if let Err(err) = self.schedule(generation, true) {
                    warn!(
                        event = events::IMAGE_REQUEST_SEND_FAILED,
                        component = COMPONENT,
                        symbol = %self.symbol,
                        err = %err,
                        "unable to schedule image request retry"
                    );
                }
            }
            None => {
                self.stop();
                warn!(
                    event = events::IMAGE_REQUEST_TIMEOUT,
                    component = COMPONENT,
                    symbol = %self.symbol,
                    is_recap,
                    "timeout waiting for recap or initial value"
                );
                owner.on_request_timeout(is_recap);
            }
        }
    }

    fn stop(&self) -> bool {
        let (was_waiting, was_recap, timer) = {
            let mut state = self.state.lock();
            let was_waiting = state.waiting;
            let was_recap = state.is_recap;
            state.waiting = false;
            state.is_recap = false;
            state.msg = None;
            state.generation += 1;
            (was_waiting, was_recap, state.reply_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.throttle.remove_messages_for_owner(self.throttle_owner);
        if !was_recap {
            if let Some(owner) = self.owner.upgrade() {
                owner.set_expecting_initial(false);
            }
        }
        if was_waiting {
            trace!(
                event = events::IMAGE_REQUEST_STOP,
                component = COMPONENT,
                symbol = %self.symbol,
                "stopped waiting for response"
            );
        }
        was_waiting
    }
}

/// One outstanding initial or recap request for a subscription.
pub struct ImageRequest {
    shared: Arc<RequestShared>,
}

impl ImageRequest {
    pub fn new(
        owner: Weak<dyn ImageRequestOwner>,
        symbol: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        throttle: RateThrottle,
        runtime: TimerRuntime,
    ) -> Self {
        Self {
            shared: Arc::new(RequestShared {
                owner,
                symbol: symbol.into(),
                publisher,
                throttle,
                throttle_owner: ThrottleOwner::next(),
                runtime,
                state: Mutex::new(RequestState {
                    waiting: false,
                    is_recap: false,
                    attempts: 0,
                    retried: 0,
                    retries: 0,
                    timeout: Duration::ZERO,
                    msg: None,
                    reply_timer: None,
                    generation: 0,
                    destroyed: false,
                }),
            }),
        }
    }

    /// Sends `msg` and waits up to `timeout` per attempt, retrying `retries` times.
    ///
    /// Initial requests go out immediately; recaps and retries are paced by
    /// the throttle when `use_throttle` is set.
    pub fn send_request(
        &self,
        msg: Message,
        timeout: Duration,
        retries: u32,
        use_throttle: bool,
        is_recap: bool,
    ) -> Result<(), Status> {
        let (generation, previous_timer) = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Err(Status::invalid_state("send_request", "DESTROYED"));
            }
            state.generation += 1;
            state.waiting = true;
            state.is_recap = is_recap;
            state.attempts = 0;
            state.retried = 0;
            state.retries = retries;
            state.timeout = timeout;
            state.msg = Some(msg);
            (state.generation, state.reply_timer.take())
        };
        if let Some(timer) = previous_timer {
            timer.abort();
        }
        if let Some(owner) = self.shared.owner.upgrade() {
            owner.reset_received_images(is_recap);
        }

        if use_throttle {
            self.shared.schedule(generation, is_recap)
        } else {
            self.shared.send_now(generation);
            Ok(())
        }
    }

    /// Cancels any reply timer and queued send. Safe when nothing is outstanding.
    pub fn stop_wait_for_response(&self) {
        self.shared.stop();
    }

    /// Stops an outstanding request. No reply or timeout for it is delivered afterwards.
    pub fn cancel_request(&self) {
        if self.is_waiting_for_response() {
            self.shared.stop();
        }
    }

    /// Cancels and refuses further requests.
    pub fn destroy(&self) {
        self.shared.state.lock().destroyed = true;
        self.shared.stop();
    }

    pub fn is_waiting_for_response(&self) -> bool {
        self.shared.state.lock().waiting
    }

    pub fn is_recap_request(&self) -> bool {
        self.shared.state.lock().is_recap
    }

    /// Sends made for the current request, including retries.
    pub fn request_count(&self) -> u32 {
        self.shared.state.lock().attempts
    }

    pub fn symbol(&self) -> &str {
        &self.shared.symbol
    }
}

impl Debug for ImageRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ImageRequest")
            .field("symbol", &self.shared.symbol)
            .field("waiting", &state.waiting)
            .field("is_recap", &state.is_recap)
            .field("attempts", &state.attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{ImageRequest, ImageRequestOwner, Inbox};
    use crate::bridge::Publisher;
    use crate::config::ThrottleConfig;
    use crate::message::{Message, MsgType};
    use crate::runtime::TimerRuntime;
    use crate::status::Status;
    use crate::throttle::RateThrottle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPublisher {
        inboxes: Mutex<Vec<Inbox>>,
    }

    impl RecordingPublisher {
        fn sends(&self) -> usize {
            self.inboxes.lock().len()
        }

        fn last_inbox(&self) -> Inbox {
            self.inboxes.lock().last().cloned().expect("a request was sent")
        }
    }

    impl Publisher for RecordingPublisher {
        fn send(&self, _msg: &Message) -> Result<(), Status> {
            Ok(())
        }

        fn send_from_inbox(&self, inbox: &Inbox, _msg: &Message) -> Result<(), Status> {
            self.inboxes.lock().push(inbox.clone());
            Ok(())
        }

        fn send_reply_to_inbox(&self, _request: &Message, _reply: &Message) -> Result<(), Status> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestOwner {
        replies: Mutex<Vec<Message>>,
        images: AtomicU32,
        completes: AtomicU32,
        timeouts: AtomicU32,
        expecting_initial: AtomicBool,
    }

    impl ImageRequestOwner for TestOwner {
        fn accepts_replies(&self) -> bool {
            true
        }

        fn on_image_reply(&self, msg: Message) {
            self.images.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().push(msg);
        }

        fn received_images(&self, _is_recap: bool) -> u32 {
            self.images.load(Ordering::SeqCst)
        }

        fn reset_received_images(&self, _is_recap: bool) {
            self.images.store(0, Ordering::SeqCst);
        }

        fn on_request_complete(&self, _is_recap: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request_timeout(&self, _is_recap: bool) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn set_expecting_initial(&self, expecting: bool) {
            self.expecting_initial.store(expecting, Ordering::SeqCst);
        }
    }

    fn fixture(rate: f64) -> (Arc<TestOwner>, Arc<RecordingPublisher>, ImageRequest) {
        let runtime = TimerRuntime::current().expect("tokio test runtime");
        let owner = Arc::new(TestOwner::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let throttle = RateThrottle::new(
            "image-test",
            ThrottleConfig {
                rate,
                interval_ms: 100,
            },
            runtime.clone(),
        );
        let weak_owner: Weak<dyn ImageRequestOwner> = Arc::<TestOwner>::downgrade(&owner);
        let request = ImageRequest::new(
            weak_owner,
            "MSFT",
            publisher.clone() as Arc<dyn Publisher>,
            throttle,
            runtime,
        );
        (owner, publisher, request)
    }

    fn initial_request() -> Message {
        Message::new(MsgType::InitialRequest).with_source("NASDAQ")
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_retries_then_times_out_once() {
        let (owner, publisher, request) = fixture(1000.0);

        request
            .send_request(initial_request(), Duration::from_secs(2), 1, false, false)
            .expect("send");
        assert_eq!(publisher.sends(), 1);
        assert!(request.is_waiting_for_response());

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.sends(), 2);
        assert_eq!(owner.timeouts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(publisher.sends(), 2);
        assert_eq!(owner.timeouts.load(Ordering::SeqCst), 1);
        assert!(!request.is_waiting_for_response());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_reaches_owner_and_completes_on_timer() {
        let (owner, publisher, request) = fixture(1000.0);

        request
            .send_request(initial_request(), Duration::from_secs(1), 2, false, false)
            .expect("send");
        assert!(publisher
            .last_inbox()
            .deliver(Message::new(MsgType::Initial).with_issue_symbol("MSFT")));
        assert_eq!(owner.replies.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(owner.completes.load(Ordering::SeqCst), 1);
        assert_eq!(owner.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_inbox_drops_replies_after_stop() {
        let (owner, publisher, request) = fixture(1000.0);

        request
            .send_request(initial_request(), Duration::from_secs(1), 0, false, false)
            .expect("send");
        let inbox = publisher.last_inbox();
        request.stop_wait_for_response();

        assert!(!inbox.is_live());
        assert!(!inbox.deliver(Message::new(MsgType::Initial)));
        assert!(owner.replies.lock().is_empty());
        assert!(!owner.expecting_initial.load(Ordering::SeqCst));

        request.stop_wait_for_response();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_retries_and_timeout() {
        let (owner, publisher, request) = fixture(1000.0);

        request
            .send_request(initial_request(), Duration::from_secs(1), 3, false, false)
            .expect("send");
        request.cancel_request();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(publisher.sends(), 1);
        assert_eq!(owner.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_request_is_purged_when_stopped_before_tick() {
        let (_owner, publisher, request) = fixture(10.0);

        request
            .send_request(
                Message::new(MsgType::RecapRequest),
                Duration::from_secs(1),
                0,
                true,
                true,
            )
            .expect("send");
        assert!(request.is_recap_request());
        assert_eq!(publisher.sends(), 0);

        request.stop_wait_for_response();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(publisher.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_request_rejects_new_sends() {
        let (_owner, _publisher, request) = fixture(0.0);

        request.destroy();
        assert!(request
            .send_request(initial_request(), Duration::from_secs(1), 0, false, false)
            .is_err());
    }
}
